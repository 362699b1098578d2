//! Rolling population standard deviation over n points.
//! Warmup: first (n-1) points.

use super::Series;

pub fn calculate_stddev(values: &[f64], period: usize) -> Series {
    (0..values.len())
        .map(|i| {
            if period == 0 || i + 1 < period {
                return None;
            }
            Some(window_stddev(&values[i + 1 - period..=i]))
        })
        .collect()
}

pub(crate) fn window_stddev(window: &[f64]) -> f64 {
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stddev_constant_series_is_zero() {
        let out = calculate_stddev(&[5.0, 5.0, 5.0, 5.0], 3);
        assert_eq!(out[..2], [None, None]);
        assert_eq!(out[2], Some(0.0));
        assert_eq!(out[3], Some(0.0));
    }

    #[test]
    fn stddev_population_formula() {
        let out = calculate_stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8);
        assert!((out[7].unwrap() - 2.0).abs() < 1e-9);
    }
}
