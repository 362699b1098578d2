//! Market data access port trait.

use crate::domain::error::StratboxError;
use crate::domain::ohlcv::OhlcvBar;
use chrono::NaiveDate;

pub trait DataPort {
    /// Bars for `code`, sorted by date, optionally clipped to `[start, end]`.
    fn fetch_ohlcv(
        &self,
        code: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<OhlcvBar>, StratboxError>;

    fn list_symbols(&self) -> Result<Vec<String>, StratboxError>;
}
