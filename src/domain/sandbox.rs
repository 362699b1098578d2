//! Runs one strategy against one context under resource limits.
//!
//! `SandboxRunner::execute` never fails: parse errors, script exceptions,
//! limit breaches and interpreter panics all come back as an
//! `ExecutionOutcome` with `raised_error` set.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::domain::error::{ExecutionError, ExecutionErrorKind};
use crate::domain::limits::{LimitEnforcer, ResourceLimits, platform_enforcer};
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::outcome::{
    EquityPoint, ExecutionOutcome, ExecutionTiming, StrategyCode, StrategyContext, TradeRecord,
    TradeSide,
};
use crate::domain::script::value::{Args, Fault, Heap, Value};
use crate::domain::script::{Interpreter, parse};

/// Stack reserved for the thread that runs strategies. Nested calls are capped
/// well below what this can hold, even for unoptimised builds.
pub const WORKER_STACK_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Deepest chain of nested strategy function calls.
    pub max_call_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig { max_call_depth: 64 }
    }
}

pub struct SandboxRunner {
    config: SandboxConfig,
    enforcer: Arc<dyn LimitEnforcer>,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_enforcer(config, platform_enforcer())
    }

    pub fn with_enforcer(config: SandboxConfig, enforcer: Arc<dyn LimitEnforcer>) -> Self {
        SandboxRunner { config, enforcer }
    }

    pub fn limits_enforced(&self) -> bool {
        self.enforcer.is_enforced()
    }

    pub fn execute(
        &self,
        code: &StrategyCode,
        context: &StrategyContext,
        limits: &ResourceLimits,
    ) -> ExecutionOutcome {
        let limits_enforced = self.limits_enforced();
        let started_at = Instant::now();
        debug!(
            code_bytes = code.len(),
            bars = context.bars.len(),
            timeout_seconds = limits.timeout_seconds,
            memory_limit_mb = limits.memory_limit_mb,
            "executing strategy"
        );

        let result = catch_unwind(AssertUnwindSafe(|| self.run_guarded(code, context, limits)));
        let (result, logs) = match result {
            Ok(finished) => finished,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(%detail, "strategy interpreter panicked");
                let err = ExecutionError::new(
                    ExecutionErrorKind::Internal,
                    format!("interpreter panicked: {detail}"),
                );
                (Err(err), Vec::new())
            }
        };
        let timing = ExecutionTiming::between(started_at, Instant::now());

        match result {
            Ok((trade_records, equity_curve)) => {
                debug!(
                    trades = trade_records.len(),
                    equity_points = equity_curve.len(),
                    elapsed_ms = timing.elapsed_ms,
                    "strategy finished"
                );
                ExecutionOutcome {
                    trade_records,
                    equity_curve,
                    raised_error: None,
                    logs,
                    limits_enforced,
                    timing,
                }
            }
            Err(err) => {
                debug!(kind = %err.kind, error = %err, "strategy failed");
                ExecutionOutcome::failed(err, logs, limits_enforced, timing)
            }
        }
    }

    fn run_guarded(
        &self,
        code: &StrategyCode,
        context: &StrategyContext,
        limits: &ResourceLimits,
    ) -> (Result<Extracted, ExecutionError>, Vec<String>) {
        let program = match parse(code.as_str()) {
            Ok(program) => program,
            Err(err) => {
                let err = ExecutionError::runtime(format!("SyntaxError: {err}"));
                return (Err(err), Vec::new());
            }
        };
        let (budget, guard) = match self.enforcer.arm(limits) {
            Ok(armed) => armed,
            Err(err) => return (Err(err), Vec::new()),
        };

        let mut interp = Interpreter::new(budget, self.config.max_call_depth);
        let result = install_context(&mut interp, context)
            .and_then(|()| interp.run(&program))
            .and_then(|()| extract_results(&mut interp, context))
            .map_err(Fault::into_execution_error);
        let logs = interp.take_logs();
        drop(interp);
        drop(guard);
        (result, logs)
    }
}

impl Default for SandboxRunner {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

fn install_context(interp: &mut Interpreter, context: &StrategyContext) -> Result<(), Fault> {
    let data = market_data(interp.heap(), context)?;
    let params = json_object(interp.heap(), &context.params)?;
    interp.set_global("data", data);
    interp.set_global("params", params);
    Ok(())
}

const PRICE_FIELDS: [(&str, fn(&OhlcvBar) -> f64); 4] = [
    ("open", |b| b.open),
    ("high", |b| b.high),
    ("low", |b| b.low),
    ("close", |b| b.close),
];

/// Column-oriented view of the bars: one list per field.
fn market_data(heap: &Heap, context: &StrategyContext) -> Result<Value, Fault> {
    let bars = &context.bars;
    let data = heap.new_dict()?;
    data.set_str("date", heap.list(bars.iter().map(|b| Value::Date(b.date)).collect())?)?;
    for (key, field) in PRICE_FIELDS {
        let column: Vec<f64> = bars.iter().map(field).collect();
        data.set_str(key, heap.float_list(&column)?)?;
    }
    data.set_str("volume", heap.list(bars.iter().map(|b| Value::Int(b.volume)).collect())?)?;
    Ok(Value::Dict(data))
}

fn json_object(heap: &Heap, object: &Map<String, JsonValue>) -> Result<Value, Fault> {
    let dict = heap.new_dict()?;
    for (key, value) in object {
        dict.set_str(key, json_value(heap, value)?)?;
    }
    Ok(Value::Dict(dict))
}

fn json_value(heap: &Heap, value: &JsonValue) -> Result<Value, Fault> {
    Ok(match value {
        JsonValue::Null => Value::None,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => heap.string(s.clone())?,
        JsonValue::Array(items) => {
            let items = items
                .iter()
                .map(|item| json_value(heap, item))
                .collect::<Result<Vec<_>, _>>()?;
            heap.list(items)?
        }
        JsonValue::Object(object) => json_object(heap, object)?,
    })
}

type Extracted = (Vec<TradeRecord>, Vec<EquityPoint>);

/// Reads trades and equity from `strategy(...)`'s return value when the
/// script defines one, otherwise from module globals.
fn extract_results(interp: &mut Interpreter, context: &StrategyContext) -> Result<Extracted, Fault> {
    let (trades, equity) = match interp.global("strategy") {
        Some(strategy) => {
            let returned = call_strategy(interp, &strategy)?;
            let Value::Dict(result) = &returned else {
                return Err(invalid(format!(
                    "strategy() must return a dict, got {}",
                    returned.type_name()
                )));
            };
            let equity = result
                .get_str("equity")
                .or_else(|| result.get_str("equity_curve"));
            (result.get_str("trades"), equity)
        }
        None => {
            let equity = interp
                .global("equity")
                .or_else(|| interp.global("equity_curve"));
            (interp.global("trades"), equity)
        }
    };

    let trades = trades.ok_or_else(|| invalid("strategy did not produce 'trades'"))?;
    let trade_records = interp
        .collect(&trades)
        .map_err(|fault| not_a_list(fault, "trades", &trades))?
        .iter()
        .enumerate()
        .map(|(i, trade)| trade_record(i, trade))
        .collect::<Result<Vec<_>, _>>()?;

    let equity_curve = match equity {
        None | Some(Value::None) => Vec::new(),
        Some(equity) => equity_points(interp, &equity, context)?,
    };
    Ok((trade_records, equity_curve))
}

fn call_strategy(interp: &mut Interpreter, strategy: &Value) -> Result<Value, Fault> {
    let data = interp.global("data").unwrap_or(Value::None);
    let wants_params = match strategy {
        Value::Function(func) => func.def.params.len() >= 2,
        Value::Native(_) | Value::BoundMethod(_) => false,
        other => {
            return Err(invalid(format!(
                "'strategy' must be a function, got {}",
                other.type_name()
            )));
        }
    };
    let mut positional = vec![data];
    if wants_params {
        positional.push(interp.global("params").unwrap_or(Value::None));
    }
    interp.call(strategy, Args::new(positional))
}

fn trade_record(index: usize, trade: &Value) -> Result<TradeRecord, Fault> {
    let pnl_of = |value: &Value| match value {
        Value::Int(_) | Value::Float(_) => value.as_f64(),
        _ => None,
    };
    let record = match trade {
        Value::Dict(fields) => {
            let pnl = fields
                .get_str("pnl")
                .or_else(|| fields.get_str("profit"))
                .ok_or_else(|| invalid(format!("trade {index} has no 'pnl' or 'profit' key")))?;
            let pnl = pnl_of(&pnl)
                .ok_or_else(|| invalid(format!("trade {index} pnl must be a number, got {}", pnl.type_name())))?;
            let number = |key: &str| fields.get_str(key).as_ref().and_then(pnl_of);
            let position = |key: &str| -> Result<Option<usize>, Fault> {
                match fields.get_str(key) {
                    None | Some(Value::None) => Ok(None),
                    Some(Value::Int(i)) if i >= 0 => Ok(Some(i as usize)),
                    Some(other) => Err(invalid(format!(
                        "trade {index} {key} must be a non-negative int, got {}",
                        other.short_repr()
                    ))),
                }
            };
            TradeRecord {
                pnl,
                side: fields
                    .get_str("side")
                    .as_ref()
                    .and_then(|s| s.as_str().and_then(TradeSide::parse)),
                entry_index: position("entry_index")?,
                exit_index: position("exit_index")?,
                entry_price: number("entry_price"),
                exit_price: number("exit_price"),
                quantity: number("quantity"),
            }
        }
        other => TradeRecord::from_pnl(pnl_of(other).ok_or_else(|| {
            invalid(format!(
                "trade {index} must be a number or a dict, got {}",
                other.type_name()
            ))
        })?),
    };
    if !record.pnl.is_finite() {
        return Err(invalid(format!("trade {index} pnl is not finite")));
    }
    Ok(record)
}

fn equity_points(
    interp: &mut Interpreter,
    equity: &Value,
    context: &StrategyContext,
) -> Result<Vec<EquityPoint>, Fault> {
    let values = interp
        .collect(equity)
        .map_err(|fault| not_a_list(fault, "equity", equity))?;
    let aligned = values.len() == context.bars.len();
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let equity = match value {
                Value::Int(_) | Value::Float(_) => value.as_f64().unwrap_or(f64::NAN),
                other => {
                    return Err(invalid(format!(
                        "equity point {index} must be a number, got {}",
                        other.type_name()
                    )));
                }
            };
            if !equity.is_finite() {
                return Err(invalid(format!("equity point {index} is not finite")));
            }
            Ok(EquityPoint {
                index,
                date: aligned.then(|| context.bars[index].date),
                equity,
            })
        })
        .collect()
}

/// Resource faults raised while iterating still win over the shape error.
fn not_a_list(fault: Fault, name: &str, value: &Value) -> Fault {
    match fault {
        Fault::Fatal(err) if err.kind != ExecutionErrorKind::Runtime => Fault::Fatal(err),
        _ => invalid(format!("'{name}' must be a list, got {}", value.type_name())),
    }
}

fn invalid(message: impl Into<String>) -> Fault {
    Fault::Fatal(ExecutionError::invalid_output(message))
}
