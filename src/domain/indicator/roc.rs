//! Rate of Change: ((V[i] - V[i-n]) / V[i-n]) * 100, and 0 when V[i-n] is 0.
//! Warmup: first n points.

use super::Series;

pub fn calculate_roc(values: &[f64], period: usize) -> Series {
    (0..values.len())
        .map(|i| {
            if i < period {
                return None;
            }
            let prev = values[i - period];
            Some(if prev == 0.0 {
                0.0
            } else {
                (values[i] - prev) / prev * 100.0
            })
        })
        .collect()
}
