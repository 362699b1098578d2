//! Bollinger Bands: SMA middle band with upper/lower bands at
//! `multiplier` population standard deviations. Warmup: first (n-1) points.

use super::stddev::window_stddev;
use super::Series;

#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: Series,
    pub middle: Series,
    pub lower: Series,
}

pub fn calculate_bollinger(values: &[f64], period: usize, multiplier: f64) -> BollingerBands {
    let mut bands = BollingerBands {
        upper: Vec::with_capacity(values.len()),
        middle: Vec::with_capacity(values.len()),
        lower: Vec::with_capacity(values.len()),
    };

    for i in 0..values.len() {
        if period == 0 || i + 1 < period {
            bands.upper.push(None);
            bands.middle.push(None);
            bands.lower.push(None);
            continue;
        }
        let window = &values[i + 1 - period..=i];
        let middle = window.iter().sum::<f64>() / period as f64;
        let width = multiplier * window_stddev(window);
        bands.upper.push(Some(middle + width));
        bands.middle.push(Some(middle));
        bands.lower.push(Some(middle - width));
    }
    bands
}
