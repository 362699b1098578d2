//! CSV file data adapter.

use crate::domain::error::StratboxError;
use crate::domain::ohlcv::OhlcvBar;
use crate::ports::data_port::DataPort;
use chrono::NaiveDate;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

/// Reads `{base_path}/{code}.csv` files with a
/// `date,open,high,low,close,volume` header.
pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, code: &str) -> PathBuf {
        self.base_path.join(format!("{code}.csv"))
    }
}

fn parse_field<T>(record: &csv::StringRecord, index: usize, name: &str, row: usize) -> Result<T, StratboxError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = record.get(index).ok_or_else(|| StratboxError::Data {
        reason: format!("row {row}: missing {name} column"),
    })?;
    raw.trim().parse().map_err(|e| StratboxError::Data {
        reason: format!("row {row}: invalid {name} value '{raw}': {e}"),
    })
}

impl DataPort for CsvAdapter {
    fn fetch_ohlcv(
        &self,
        code: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<OhlcvBar>, StratboxError> {
        let path = self.csv_path(code);
        let content = fs::read_to_string(&path).map_err(|e| StratboxError::Data {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let mut bars = Vec::new();

        for (i, result) in rdr.records().enumerate() {
            let row = i + 2;
            let record = result.map_err(|e| StratboxError::Data {
                reason: format!("CSV parse error: {e}"),
            })?;

            let date_str = record.get(0).ok_or_else(|| StratboxError::Data {
                reason: format!("row {row}: missing date column"),
            })?;
            let date = NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d").map_err(|e| {
                StratboxError::Data {
                    reason: format!("row {row}: invalid date '{date_str}': {e}"),
                }
            })?;

            if start_date.is_some_and(|start| date < start) || end_date.is_some_and(|end| date > end) {
                continue;
            }

            bars.push(OhlcvBar {
                date,
                open: parse_field(&record, 1, "open", row)?,
                high: parse_field(&record, 2, "high", row)?,
                low: parse_field(&record, 3, "low", row)?,
                close: parse_field(&record, 4, "close", row)?,
                volume: parse_field(&record, 5, "volume", row)?,
            });
        }

        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    fn list_symbols(&self) -> Result<Vec<String>, StratboxError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| StratboxError::Data {
            reason: format!(
                "failed to read directory {}: {}",
                self.base_path.display(),
                e
            ),
        })?;

        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StratboxError::Data {
                reason: format!("directory entry error: {e}"),
            })?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(code) = name_str.strip_suffix(".csv") {
                symbols.push(code.to_string());
            }
        }

        symbols.sort();
        Ok(symbols)
    }
}
