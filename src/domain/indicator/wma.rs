//! Weighted Moving Average.
//!
//! O(n) sliding window: WMA(n) = (1*P[i-n+1] + ... + n*P[i]) / (n*(n+1)/2).
//! Warmup: first (n-1) points.

use super::Series;

pub fn calculate_wma(values: &[f64], period: usize) -> Series {
    let mut out = Vec::with_capacity(values.len());
    if period == 0 {
        out.resize(values.len(), None);
        return out;
    }

    let divisor = (period * (period + 1)) as f64 / 2.0;
    let mut weighted_sum = 0.0;
    let mut window_sum = 0.0;

    for (i, &v) in values.iter().enumerate() {
        if i < period {
            weighted_sum += (i + 1) as f64 * v;
            window_sum += v;
        } else {
            weighted_sum += period as f64 * v - window_sum;
            window_sum += v - values[i - period];
        }
        out.push((i + 1 >= period).then(|| weighted_sum / divisor));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::assert_series_close;

    #[test]
    fn wma_weights_recent_points_more() {
        let out = calculate_wma(&[1.0, 2.0, 3.0, 4.0], 3);
        // (1*1 + 2*2 + 3*3)/6 = 14/6, (1*2 + 2*3 + 3*4)/6 = 20/6
        assert_series_close(&out, &[None, None, Some(14.0 / 6.0), Some(20.0 / 6.0)]);
    }

    #[test]
    fn wma_sliding_matches_direct_sum() {
        let values = [5.0, 3.0, 8.0, 1.0, 9.0, 2.0, 7.0];
        let out = calculate_wma(&values, 4);
        for i in 3..values.len() {
            let direct: f64 = (0..4).map(|j| (j + 1) as f64 * values[i - 3 + j]).sum::<f64>() / 10.0;
            assert!((out[i].unwrap() - direct).abs() < 1e-9);
        }
    }
}
