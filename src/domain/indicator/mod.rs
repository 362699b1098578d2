//! Technical indicator implementations over numeric series.
//!
//! Every calculation returns one entry per input point. `None` marks warmup
//! points where the indicator is not yet defined.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod obv;
pub mod roc;
pub mod rsi;
pub mod sma;
pub mod stddev;
pub mod wma;

pub use atr::calculate_atr;
pub use bollinger::{calculate_bollinger, BollingerBands};
pub use ema::calculate_ema;
pub use macd::{calculate_macd, MacdSeries};
pub use obv::calculate_obv;
pub use roc::calculate_roc;
pub use rsi::calculate_rsi;
pub use sma::calculate_sma;
pub use stddev::calculate_stddev;
pub use wma::calculate_wma;

/// Indicator output aligned with its input.
pub type Series = Vec<Option<f64>>;

#[cfg(test)]
pub(crate) fn assert_series_close(actual: &[Option<f64>], expected: &[Option<f64>]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        match (a, e) {
            (Some(a), Some(e)) => assert!((a - e).abs() < 1e-9, "index {i}: {a} != {e}"),
            (None, None) => {}
            _ => panic!("index {i}: {a:?} != {e:?}"),
        }
    }
}
