//! Average True Range with Wilder's smoothing.
//!
//! TR[0] = high - low; afterwards the true range against the previous
//! close. Seed is the mean of the first n TRs. Warmup: first (n-1) points.

use super::Series;

pub fn calculate_atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Series {
    let len = high.len().min(low.len()).min(close.len());
    let mut out = vec![None; len];
    if period == 0 || len < period {
        return out;
    }

    let tr: Vec<f64> = (0..len)
        .map(|i| {
            let range = high[i] - low[i];
            if i == 0 {
                range
            } else {
                let prev = close[i - 1];
                range.max((high[i] - prev).abs()).max((low[i] - prev).abs())
            }
        })
        .collect();

    let mut atr = tr[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(atr);
    for i in period..len {
        atr = (atr * (period - 1) as f64 + tr[i]) / period as f64;
        out[i] = Some(atr);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_seed_is_mean_true_range() {
        let high = [10.0, 12.0, 13.0];
        let low = [8.0, 9.0, 11.0];
        let close = [9.0, 11.0, 12.0];
        let out = calculate_atr(&high, &low, &close, 2);
        // TR = [2, 3, 2]; seed (2+3)/2 = 2.5; next (2.5 + 2)/2 = 2.25
        assert_eq!(out, vec![None, Some(2.5), Some(2.25)]);
    }

    #[test]
    fn atr_uses_gap_from_previous_close() {
        let out = calculate_atr(&[10.0, 20.0], &[9.0, 19.0], &[9.5, 19.5], 1);
        // gap: |20 - 9.5| = 10.5
        assert_eq!(out, vec![Some(1.0), Some(10.5)]);
    }

    #[test]
    fn atr_insufficient_points() {
        assert_eq!(calculate_atr(&[1.0], &[0.5], &[0.8], 3), vec![None]);
    }
}
