//! MACD (Moving Average Convergence Divergence).
//!
//! Line = EMA(fast) - EMA(slow); Signal = EMA(signal) of the line, seeded
//! once the line is defined; Histogram = Line - Signal.

use super::ema::calculate_ema;
use super::Series;

pub const DEFAULT_FAST: usize = 12;
pub const DEFAULT_SLOW: usize = 26;
pub const DEFAULT_SIGNAL: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct MacdSeries {
    pub line: Series,
    pub signal: Series,
    pub histogram: Series,
}

pub fn calculate_macd(values: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdSeries {
    let ema_fast = calculate_ema(values, fast);
    let ema_slow = calculate_ema(values, slow);

    let line: Series = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    // The signal EMA runs over the defined tail of the line only.
    let first_defined = line.iter().position(Option::is_some).unwrap_or(line.len());
    let tail: Vec<f64> = line[first_defined..].iter().flatten().copied().collect();
    let mut signal = vec![None; first_defined];
    signal.extend(calculate_ema(&tail, signal_period));

    let histogram = line
        .iter()
        .zip(&signal)
        .map(|(l, s)| Some((*l)? - (*s)?))
        .collect();

    MacdSeries {
        line,
        signal,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_warmup_lengths() {
        let values: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let macd = calculate_macd(&values, DEFAULT_FAST, DEFAULT_SLOW, DEFAULT_SIGNAL);
        assert_eq!(macd.line.len(), 40);
        assert!(macd.line[24].is_none());
        assert!(macd.line[25].is_some());
        // signal needs 9 defined line points
        assert!(macd.signal[32].is_none());
        assert!(macd.signal[33].is_some());
        assert!(macd.histogram[33].is_some());
    }

    #[test]
    fn macd_of_constant_series_is_zero() {
        let macd = calculate_macd(&[50.0; 12], 2, 4, 3);
        for i in 5..12 {
            assert!(macd.line[i].unwrap().abs() < 1e-12);
            assert!(macd.histogram[i].unwrap().abs() < 1e-12);
        }
    }

    #[test]
    fn macd_short_input_has_no_signal() {
        let macd = calculate_macd(&[1.0, 2.0, 3.0], 2, 3, 5);
        assert!(macd.signal.iter().all(Option::is_none));
        assert_eq!(macd.signal.len(), 3);
    }
}
