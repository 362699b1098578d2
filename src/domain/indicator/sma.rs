//! Simple Moving Average.
//!
//! Rolling-sum window; warmup: first (n-1) points are undefined.

use super::Series;

pub fn calculate_sma(values: &[f64], period: usize) -> Series {
    let mut out = Vec::with_capacity(values.len());
    if period == 0 {
        out.resize(values.len(), None);
        return out;
    }

    let mut window_sum = 0.0;
    for (i, &v) in values.iter().enumerate() {
        window_sum += v;
        if i >= period {
            window_sum -= values[i - period];
        }
        if i + 1 >= period {
            out.push(Some(window_sum / period as f64));
        } else {
            out.push(None);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::assert_series_close;

    #[test]
    fn sma_warmup_and_values() {
        let out = calculate_sma(&[2.0, 4.0, 6.0, 8.0, 10.0], 3);
        assert_series_close(&out, &[None, None, Some(4.0), Some(6.0), Some(8.0)]);
    }

    #[test]
    fn sma_period_longer_than_input() {
        let out = calculate_sma(&[1.0, 2.0], 5);
        assert_eq!(out, vec![None, None]);
    }

    #[test]
    fn sma_zero_period_is_all_undefined() {
        assert_eq!(calculate_sma(&[1.0, 2.0, 3.0], 0), vec![None, None, None]);
    }
}
