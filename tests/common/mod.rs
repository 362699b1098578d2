#![allow(dead_code)]

use chrono::NaiveDate;
use std::collections::HashMap;
use std::io::Write;
use stratbox::domain::error::StratboxError;
pub use stratbox::domain::ohlcv::OhlcvBar;
use stratbox::domain::outcome::StrategyContext;
use stratbox::domain::sandbox::WORKER_STACK_BYTES;
use stratbox::ports::data_port::DataPort;

pub struct MockDataPort {
    pub data: HashMap<String, Vec<OhlcvBar>>,
}

impl MockDataPort {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, code: &str, bars: Vec<OhlcvBar>) -> Self {
        self.data.insert(code.to_string(), bars);
        self
    }
}

impl DataPort for MockDataPort {
    fn fetch_ohlcv(
        &self,
        code: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<OhlcvBar>, StratboxError> {
        let bars = self.data.get(code).ok_or_else(|| StratboxError::Data {
            reason: format!("unknown code {code}"),
        })?;
        Ok(bars
            .iter()
            .filter(|b| start_date.is_none_or(|s| b.date >= s))
            .filter(|b| end_date.is_none_or(|e| b.date <= e))
            .cloned()
            .collect())
    }

    fn list_symbols(&self) -> Result<Vec<String>, StratboxError> {
        let mut codes: Vec<String> = self.data.keys().cloned().collect();
        codes.sort();
        Ok(codes)
    }
}

pub fn make_bar(date: &str, close: f64) -> OhlcvBar {
    OhlcvBar {
        date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        open: close - 0.5,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 1_000,
    }
}

/// Consecutive daily bars starting 2024-01-01 with the given closes.
pub fn make_bars(closes: &[f64]) -> Vec<OhlcvBar> {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let date = start + chrono::Days::new(i as u64);
            make_bar(&date.format("%Y-%m-%d").to_string(), close)
        })
        .collect()
}

/// A gentle uptrend with a dip in the middle, long enough for 20-bar indicators.
pub fn trending_closes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let x = i as f64;
            100.0 + x * 0.5 + (x / 3.0).sin() * 4.0
        })
        .collect()
}

pub fn context(closes: &[f64]) -> StrategyContext {
    StrategyContext::new(make_bars(closes))
}

/// Runs `f` on a thread whose stack matches the execution worker's.
pub fn on_worker_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    std::thread::Builder::new()
        .stack_size(WORKER_STACK_BYTES)
        .spawn(f)
        .unwrap()
        .join()
        .unwrap()
}

pub fn write_temp_file(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Writes `{code}.csv` into `dir` in the layout `CsvAdapter` reads.
pub fn write_csv(dir: &std::path::Path, code: &str, bars: &[OhlcvBar]) {
    let mut out = String::from("date,open,high,low,close,volume\n");
    for b in bars {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            b.date, b.open, b.high, b.low, b.close, b.volume
        ));
    }
    std::fs::write(dir.join(format!("{code}.csv")), out).unwrap();
}
