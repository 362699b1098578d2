//! OHLCV bar representation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One trading day for a single symbol, as handed to strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_round_trips_through_json() {
        let bar = OhlcvBar {
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            open: 50.0,
            high: 56.0,
            low: 48.0,
            close: 52.0,
            volume: 12_000,
        };
        let json = serde_json::to_string(&bar).unwrap();
        assert!(json.contains("\"date\":\"2024-03-04\""));
        let back: OhlcvBar = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bar);
    }
}
