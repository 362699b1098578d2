//! Async front door for strategy execution.
//!
//! Every execution runs on one dedicated worker thread fed by a channel, so
//! concurrent callers queue and executions never overlap. The only await is
//! for the worker's reply.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::domain::config::EngineConfig;
use crate::domain::error::StratboxError;
use crate::domain::limits::{LimitEnforcer, ResourceLimits, platform_enforcer};
use crate::domain::metrics::PerformanceMetrics;
use crate::domain::outcome::{ExecutionOutcome, StrategyCode, StrategyContext};
use crate::domain::sandbox::{SandboxRunner, WORKER_STACK_BYTES};
use crate::domain::validator::{ValidationVerdict, Validator};

/// Metrics plus the raw outcome they were computed from.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub metrics: PerformanceMetrics,
    pub outcome: ExecutionOutcome,
}

struct Job {
    code: StrategyCode,
    context: StrategyContext,
    limits: ResourceLimits,
    reply: oneshot::Sender<ExecutionOutcome>,
}

struct Worker {
    jobs: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(runner: SandboxRunner) -> Result<Self, StratboxError> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("stratbox-worker".to_string())
            .stack_size(WORKER_STACK_BYTES)
            .spawn(move || {
                // Ends once every sender is gone and the queue is drained.
                for job in queue {
                    let outcome = runner.execute(&job.code, &job.context, &job.limits);
                    if job.reply.send(outcome).is_err() {
                        debug!("caller went away before its execution finished");
                    }
                }
            })
            .map_err(|e| StratboxError::WorkerUnavailable {
                reason: format!("failed to start worker thread: {e}"),
            })?;
        Ok(Worker { jobs, handle })
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("execution worker panicked during shutdown");
    }
}

/// Validates strategies and runs them one at a time on a dedicated worker.
///
/// Release it with [`ExecutionEngine::close`]. Dropping an engine that was
/// never closed joins the worker on the dropping thread, which blocks until
/// every queued execution has finished.
pub struct ExecutionEngine {
    validator: Validator,
    config: EngineConfig,
    limits_enforced: bool,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    // Held across the join so every `close()` caller waits for it.
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Result<Self, StratboxError> {
        Self::with_enforcer(config, platform_enforcer())
    }

    pub fn with_enforcer(
        config: EngineConfig,
        enforcer: Arc<dyn LimitEnforcer>,
    ) -> Result<Self, StratboxError> {
        let runner = SandboxRunner::with_enforcer(config.sandbox.clone(), enforcer);
        let limits_enforced = runner.limits_enforced();
        let Worker { jobs, handle } = Worker::spawn(runner)?;
        info!(
            limits_enforced,
            timeout_seconds = config.limits.timeout_seconds,
            memory_limit_mb = config.limits.memory_limit_mb,
            "execution engine started"
        );
        Ok(ExecutionEngine {
            validator: Validator::new(config.validator.clone()),
            config,
            limits_enforced,
            jobs: Mutex::new(Some(jobs)),
            handle: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    /// False when the platform cannot enforce timeouts or memory limits.
    pub fn limits_enforced(&self) -> bool {
        self.limits_enforced
    }

    pub fn default_limits(&self) -> &ResourceLimits {
        &self.config.limits
    }

    pub fn validate(&self, code: &StrategyCode) -> ValidationVerdict {
        self.validator.check(code)
    }

    /// Validates, executes on the worker and scores the result.
    ///
    /// `limits` falls back to the engine's configured defaults.
    pub async fn run(
        &self,
        code: &StrategyCode,
        context: StrategyContext,
        limits: Option<ResourceLimits>,
    ) -> Result<RunReport, StratboxError> {
        let verdict = self.validate(code);
        if !verdict.is_valid {
            let reason = verdict.reason.unwrap_or_default();
            info!(%reason, "strategy rejected by validator");
            return Err(StratboxError::Validation { reason });
        }

        let bars = context.bars.len();
        let limits = limits.unwrap_or(self.config.limits);
        let (reply, outcome) = oneshot::channel();
        self.submit(Job {
            code: code.clone(),
            context,
            limits,
            reply,
        })?;

        let outcome = outcome.await.map_err(|_| StratboxError::WorkerUnavailable {
            reason: "worker stopped before replying".to_string(),
        })?;

        if let Some(err) = outcome.raised_error {
            if err.kind.is_resource_breach() {
                warn!(kind = %err.kind, error = %err, "strategy stopped at a resource limit");
            } else {
                warn!(kind = %err.kind, error = %err, "strategy execution failed");
            }
            return Err(StratboxError::Execution(err));
        }
        if outcome.trade_records.is_empty() {
            warn!(bars, "strategy produced no trades");
            return Err(StratboxError::DegenerateResult { bars });
        }

        let metrics = PerformanceMetrics::compute(&outcome, &self.config.metrics);
        info!(
            trades = metrics.trade_count,
            sharpe_ratio = metrics.sharpe_ratio,
            max_drawdown = metrics.max_drawdown,
            elapsed_ms = outcome.timing.elapsed_ms,
            "strategy run complete"
        );
        Ok(RunReport { metrics, outcome })
    }

    fn submit(&self, job: Job) -> Result<(), StratboxError> {
        let jobs = self.lock_jobs();
        let jobs = jobs.as_ref().ok_or(StratboxError::EngineClosed)?;
        jobs.send(job).map_err(|_| StratboxError::WorkerUnavailable {
            reason: "worker thread has exited".to_string(),
        })
    }

    /// Stops accepting work, lets queued executions finish, then joins the
    /// worker. Every caller returns only after the worker is gone; calling
    /// it again afterwards is a no-op.
    pub async fn close(&self) {
        drop(self.lock_jobs().take());
        let mut handle = self.handle.lock().await;
        let Some(worker) = handle.take() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || join_worker(worker)).await {
            warn!(error = %e, "joining execution worker failed");
        }
        info!("execution engine closed");
    }

    /// True once `close()` has begun; new runs are refused from then on.
    pub fn is_closed(&self) -> bool {
        self.lock_jobs().is_none()
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Option<mpsc::Sender<Job>>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        drop(
            self.jobs
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );
        if let Some(worker) = self.handle.get_mut().take() {
            join_worker(worker);
            debug!("execution engine dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ExecutionErrorKind;
    use crate::domain::ohlcv::OhlcvBar;
    use chrono::NaiveDate;

    fn context() -> StrategyContext {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        StrategyContext::new(vec![
            OhlcvBar {
                date,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10,
            };
            4
        ])
    }

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn scores_a_successful_run() {
        let engine = engine();
        let report = engine
            .run(&StrategyCode::from("trades = [10, -4, 6]\n"), context(), None)
            .await
            .unwrap();
        assert_eq!(report.metrics.trade_count, 3);
        assert!((report.metrics.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.metrics.profit_factor - 4.0).abs() < 1e-12);
        engine.close().await;
    }

    #[tokio::test]
    async fn rejected_code_never_reaches_the_worker() {
        let engine = engine();
        let err = engine
            .run(&StrategyCode::from("open('/etc/passwd')\n"), context(), None)
            .await
            .unwrap_err();
        match err {
            StratboxError::Validation { reason } => {
                assert_eq!(reason, "disallowed call to 'open' at line 1");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_trades_are_degenerate() {
        let engine = engine();
        let err = engine
            .run(&StrategyCode::from("trades = []\n"), context(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StratboxError::DegenerateResult { bars: 4 }));
    }

    #[tokio::test]
    async fn raised_error_maps_to_execution() {
        let engine = engine();
        let err = engine
            .run(&StrategyCode::from("trades = [1]\nraise ValueError('bad')\n"), context(), None)
            .await
            .unwrap_err();
        match err {
            StratboxError::Execution(e) => {
                assert_eq!(e.kind, ExecutionErrorKind::Runtime);
                assert_eq!(e.message, "ValueError: bad");
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_refuses_new_work() {
        let engine = engine();
        engine.close().await;
        engine.close().await;
        assert!(engine.is_closed());
        let err = engine
            .run(&StrategyCode::from("trades = [1]\n"), context(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StratboxError::EngineClosed));
    }

    #[test]
    fn drop_joins_the_worker() {
        let engine = engine();
        assert!(!engine.is_closed());
        assert_eq!(engine.default_limits(), &ResourceLimits::default());
        drop(engine);
    }
}
