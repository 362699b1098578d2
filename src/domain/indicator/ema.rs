//! Exponential Moving Average.
//!
//! k = 2/(n+1), seeded with the SMA of the first n points, then
//! EMA[i] = V[i]*k + EMA[i-1]*(1-k). Warmup: first (n-1) points.

use super::Series;

pub fn calculate_ema(values: &[f64], period: usize) -> Series {
    let mut out = Vec::with_capacity(values.len());
    if period == 0 {
        out.resize(values.len(), None);
        return out;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = 0.0;
    let mut sum = 0.0;

    for (i, &v) in values.iter().enumerate() {
        if i + 1 < period {
            sum += v;
            out.push(None);
        } else if i + 1 == period {
            sum += v;
            ema = sum / period as f64;
            out.push(Some(ema));
        } else {
            ema = v * k + ema * (1.0 - k);
            out.push(Some(ema));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::assert_series_close;

    #[test]
    fn ema_seeds_with_sma() {
        let out = calculate_ema(&[10.0, 20.0, 30.0, 40.0, 50.0], 3);
        // seed = 20, k = 0.5: 40*0.5 + 20*0.5 = 30, 50*0.5 + 30*0.5 = 40
        assert_series_close(&out, &[None, None, Some(20.0), Some(30.0), Some(40.0)]);
    }

    #[test]
    fn ema_period_one_tracks_input() {
        let out = calculate_ema(&[3.0, 1.0, 4.0], 1);
        assert_series_close(&out, &[Some(3.0), Some(1.0), Some(4.0)]);
    }

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }
}
