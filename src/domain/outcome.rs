//! Inputs and raw outputs of one sandboxed execution.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use super::error::ExecutionError;
use super::ohlcv::OhlcvBar;

/// Immutable strategy source text.
#[derive(Clone, PartialEq, Eq)]
pub struct StrategyCode(Arc<str>);

impl StrategyCode {
    pub fn new(source: impl Into<Arc<str>>) -> Self {
        StrategyCode(source.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for StrategyCode {
    fn from(source: &str) -> Self {
        StrategyCode::new(source)
    }
}

impl From<String> for StrategyCode {
    fn from(source: String) -> Self {
        StrategyCode::new(source)
    }
}

impl fmt::Debug for StrategyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrategyCode({} bytes)", self.0.len())
    }
}

/// Read-only market data and parameters handed to a strategy.
#[derive(Debug, Clone, Default)]
pub struct StrategyContext {
    pub bars: Vec<OhlcvBar>,
    pub params: Map<String, JsonValue>,
}

impl StrategyContext {
    pub fn new(bars: Vec<OhlcvBar>) -> Self {
        StrategyContext {
            bars,
            params: Map::new(),
        }
    }

    pub fn with_params(mut self, params: Map<String, JsonValue>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(TradeSide::Long),
            "short" | "sell" => Some(TradeSide::Short),
            _ => None,
        }
    }
}

/// One closed trade reported by a strategy. Only `pnl` is required.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRecord {
    pub pnl: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<TradeSide>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
}

impl TradeRecord {
    pub fn from_pnl(pnl: f64) -> Self {
        TradeRecord {
            pnl,
            side: None,
            entry_index: None,
            exit_index: None,
            entry_price: None,
            exit_price: None,
            quantity: None,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquityPoint {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub equity: f64,
}

/// When an execution ran, on the worker's monotonic clock.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExecutionTiming {
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(skip)]
    pub finished_at: Instant,
    pub elapsed_ms: f64,
}

impl ExecutionTiming {
    pub fn between(started_at: Instant, finished_at: Instant) -> Self {
        ExecutionTiming {
            started_at,
            finished_at,
            elapsed_ms: finished_at.saturating_duration_since(started_at).as_secs_f64() * 1000.0,
        }
    }
}

/// Raw result of running a strategy in the sandbox.
///
/// When `raised_error` is set, `trade_records` and `equity_curve` are empty.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub trade_records: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub raised_error: Option<ExecutionError>,
    pub logs: Vec<String>,
    pub limits_enforced: bool,
    pub timing: ExecutionTiming,
}

impl ExecutionOutcome {
    pub fn failed(
        error: ExecutionError,
        logs: Vec<String>,
        limits_enforced: bool,
        timing: ExecutionTiming,
    ) -> Self {
        ExecutionOutcome {
            trade_records: Vec::new(),
            equity_curve: Vec::new(),
            raised_error: Some(error),
            logs,
            limits_enforced,
            timing,
        }
    }

    pub fn is_success(&self) -> bool {
        self.raised_error.is_none()
    }
}
