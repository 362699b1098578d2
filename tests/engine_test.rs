//! End-to-end tests through `ExecutionEngine`: validation gate, worker
//! serialization, resource limits and metric scoring.

mod common;

use approx::assert_relative_eq;
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratbox::domain::config::EngineConfig;
use stratbox::domain::engine::ExecutionEngine;
use stratbox::domain::error::{ExecutionErrorKind, StratboxError};
use stratbox::domain::limits::{ResourceLimits, UnenforcedLimits};
use stratbox::domain::metrics::PROFIT_FACTOR_NO_LOSSES;
use stratbox::domain::outcome::StrategyCode;
use stratbox::ports::data_port::DataPort;

const SMA_CROSS: &str = "\
import indicators
import backtest

def strategy(data, params):
    fast = indicators.sma(data['close'], params['fast'])
    slow = indicators.sma(data['close'], params['slow'])
    signals = []
    for f, s in zip(fast, slow):
        signals.append(1 if f is not None and s is not None and f > s else 0)
    print(f\"signals: {sum(signals)}\")
    return backtest.simulate(data['close'], signals, initial_capital=params['capital'])
";

fn engine() -> ExecutionEngine {
    ExecutionEngine::new(EngineConfig::default()).unwrap()
}

fn execution_kind(err: StratboxError) -> ExecutionErrorKind {
    match err {
        StratboxError::Execution(e) => e.kind,
        other => panic!("expected an execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn indicator_strategy_runs_end_to_end() {
    let engine = engine();
    let port = MockDataPort::new().with_bars("BHP", make_bars(&trending_closes(120)));
    let bars = port.fetch_ohlcv("BHP", None, None).unwrap();
    let params = json!({ "fast": 5, "slow": 20, "capital": 10_000 });
    let context = stratbox::domain::outcome::StrategyContext::new(bars)
        .with_params(params.as_object().unwrap().clone());

    let report = engine
        .run(&StrategyCode::from(SMA_CROSS), context, None)
        .await
        .unwrap();

    assert!(report.metrics.trade_count >= 1);
    assert_eq!(report.outcome.equity_curve.len(), 120);
    assert!(report.outcome.equity_curve.iter().all(|p| p.date.is_some()));
    assert!(report.outcome.logs[0].starts_with("signals: "));
    assert_relative_eq!(
        report.metrics.final_equity,
        report.outcome.equity_curve.last().unwrap().equity,
        epsilon = 1e-9
    );
    engine.close().await;
}

#[tokio::test]
async fn canonical_trades_produce_documented_metrics() {
    let engine = engine();
    let report = engine
        .run(&StrategyCode::from("trades = [10, -4, 6]\n"), context(&[1.0; 5]), None)
        .await
        .unwrap();
    assert_eq!(report.metrics.trade_count, 3);
    assert_relative_eq!(report.metrics.win_rate, 2.0 / 3.0);
    assert_relative_eq!(report.metrics.profit_factor, 4.0);
}

#[tokio::test]
async fn profit_factor_without_losses_is_a_stable_sentinel() {
    let engine = engine();
    let code = StrategyCode::from("trades = [5, 3.5]\n");
    for _ in 0..2 {
        let report = engine.run(&code, context(&[1.0; 3]), None).await.unwrap();
        assert_eq!(report.metrics.profit_factor, PROFIT_FACTOR_NO_LOSSES);
        assert!(report.metrics.profit_factor_unbounded);
        let json = serde_json::to_value(&report.metrics).unwrap();
        assert!(json["profit_factor"].is_null());
    }
}

#[tokio::test]
async fn disallowed_code_is_rejected_before_execution() {
    let engine = engine();
    let err = engine
        .run(
            &StrategyCode::from("data = open(\"/etc/passwd\").read()\ntrades = [1]\n"),
            context(&[1.0]),
            None,
        )
        .await
        .unwrap_err();
    match err {
        StratboxError::Validation { reason } => assert!(reason.contains("'open'"), "{reason}"),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn zero_trades_is_degenerate_not_an_error() {
    let engine = engine();
    let code = StrategyCode::from("def strategy(data):\n    return {'trades': []}\n");
    let err = engine.run(&code, context(&[1.0, 2.0]), None).await.unwrap_err();
    assert!(matches!(err, StratboxError::DegenerateResult { bars: 2 }));
    assert_eq!(err.exit_status(), 6);
}

#[tokio::test]
async fn sequential_runs_never_overlap() {
    let engine = engine();
    let summing = StrategyCode::from("total = 0\nfor i in range(20000):\n    total += i\ntrades = [total]\n");
    let crossing = StrategyCode::from(SMA_CROSS);
    let params = json!({ "fast": 3, "slow": 10, "capital": 1_000 });
    let crossing_context = stratbox::domain::outcome::StrategyContext::new(make_bars(&trending_closes(60)))
        .with_params(params.as_object().unwrap().clone());

    let first = engine.run(&summing, context(&[1.0]), None).await.unwrap();
    let second = engine.run(&crossing, crossing_context, None).await.unwrap();
    assert_eq!(first.outcome.trade_records[0].pnl, 199_990_000.0);
    assert!(second.outcome.timing.started_at >= first.outcome.timing.finished_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_are_serialized() {
    let engine = Arc::new(engine());
    let code = StrategyCode::from("total = 0\nfor i in range(20000):\n    total += i\ntrades = [total]\n");
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let code = code.clone();
            tokio::spawn(async move { engine.run(&code, context(&[1.0]), None).await })
        })
        .collect();

    let mut spans = Vec::new();
    for task in tasks {
        let report = task.await.unwrap().unwrap();
        spans.push((report.outcome.timing.started_at, report.outcome.timing.finished_at));
    }
    spans.sort_by_key(|(start, _)| *start);
    for pair in spans.windows(2) {
        assert!(pair[1].0 >= pair[0].1, "executions overlapped");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_drains_in_flight_work() {
    let engine = Arc::new(engine());
    let code = StrategyCode::from("total = 0\nfor i in range(50000):\n    total += i\ntrades = [total]\n");
    let pending = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(&code, context(&[1.0]), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.close().await;
    engine.close().await;

    let report = pending.await.unwrap().unwrap();
    assert_eq!(report.metrics.trade_count, 1);
    assert!(matches!(
        engine.run(&StrategyCode::from("trades = [1]\n"), context(&[1.0]), None).await,
        Err(StratboxError::EngineClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_close_waits_for_the_worker() {
    let engine = Arc::new(engine());
    let code = StrategyCode::from("total = 0\nfor i in range(2_000_000):\n    total += i\ntrades = [total]\n");
    let pending = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(&code, context(&[1.0]), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first_close = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.close().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.close().await;
    let second_close_returned = Instant::now();

    assert!(engine.is_closed());
    let report = pending.await.unwrap().unwrap();
    assert_eq!(report.metrics.trade_count, 1);
    assert!(
        report.outcome.timing.finished_at <= second_close_returned,
        "second close returned before the in-flight run finished"
    );
    first_close.await.unwrap();
}

#[tokio::test]
async fn unbounded_recursion_is_contained() {
    let engine = engine();
    let code = StrategyCode::from("def f(n):\n    return f(n + 1) + 1\ntrades = [f(0)]\n");
    let err = engine.run(&code, context(&[1.0]), None).await.unwrap_err();
    assert_eq!(execution_kind(err), ExecutionErrorKind::RecursionLimit);

    // The worker survives and keeps serving.
    let report = engine
        .run(&StrategyCode::from("trades = [1]\n"), context(&[1.0]), None)
        .await
        .unwrap();
    assert_eq!(report.metrics.trade_count, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn infinite_loop_times_out_promptly() {
    let engine = engine();
    assert!(engine.limits_enforced());
    let limits = ResourceLimits {
        timeout_seconds: 1,
        memory_limit_mb: 64,
    };
    let started = Instant::now();
    let err = engine
        .run(&StrategyCode::from("while True:\n    pass\n"), context(&[1.0]), Some(limits))
        .await
        .unwrap_err();
    assert_eq!(execution_kind(err), ExecutionErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[cfg(unix)]
#[tokio::test]
async fn memory_bomb_is_refused() {
    let engine = engine();
    let limits = ResourceLimits {
        timeout_seconds: 10,
        memory_limit_mb: 16,
    };
    let err = engine
        .run(&StrategyCode::from("x = [0] * 100_000_000\ntrades = [1]\n"), context(&[1.0]), Some(limits))
        .await
        .unwrap_err();
    assert_eq!(execution_kind(err), ExecutionErrorKind::MemoryExceeded);
}

#[tokio::test]
async fn unenforced_engine_reports_the_gap_but_runs() {
    let engine =
        ExecutionEngine::with_enforcer(EngineConfig::default(), Arc::new(UnenforcedLimits::new()))
            .unwrap();
    assert!(!engine.limits_enforced());
    let report = engine
        .run(&StrategyCode::from("trades = [2, -1]\n"), context(&[1.0]), None)
        .await
        .unwrap();
    assert!(!report.outcome.limits_enforced);
    assert_eq!(report.metrics.trade_count, 2);
}

#[tokio::test]
async fn report_serializes_for_reporting() {
    let engine = engine();
    let report = engine
        .run(
            &StrategyCode::from("trades = [{'pnl': 3, 'side': 'short'}]\nequity = [100, 103]\n"),
            context(&[1.0, 2.0]),
            None,
        )
        .await
        .unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["outcome"]["trade_records"][0]["side"], "short");
    assert_eq!(json["outcome"]["equity_curve"][1]["date"], "2024-01-02");
    assert_eq!(json["metrics"]["trade_count"], 1);
}

#[test]
fn dropping_an_open_engine_releases_the_worker() {
    let engine = engine();
    assert!(!engine.is_closed());
    drop(engine);
}
