//! On-Balance Volume. No warmup.

use super::Series;

pub fn calculate_obv(close: &[f64], volume: &[f64]) -> Series {
    let len = close.len().min(volume.len());
    let mut out = Vec::with_capacity(len);
    let mut obv = 0.0;
    for i in 0..len {
        if i == 0 {
            obv = volume[0];
        } else if close[i] > close[i - 1] {
            obv += volume[i];
        } else if close[i] < close[i - 1] {
            obv -= volume[i];
        }
        out.push(Some(obv));
    }
    out
}
