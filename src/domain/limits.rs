//! Resource limits and the platform capability that enforces them.
//!
//! `LimitEnforcer` has two implementations: `EnforcedLimits` (unix) arms a
//! wall-clock alarm, a thread CPU-time budget and a memory budget for each
//! execution; `UnenforcedLimits` arms nothing and warns once. Callers obtain
//! the right one from [`platform_enforcer`] and never branch on the platform.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{ExecutionError, ExecutionErrorKind};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Number of budget checks between CPU clock samples.
const CPU_SAMPLE_INTERVAL: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            timeout_seconds: 30,
            memory_limit_mb: 512,
        }
    }
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// CPU time allowed: one second past the wall-clock timeout, so a busy
    /// loop is reported as a timeout rather than a CPU breach.
    pub fn cpu_limit(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.saturating_add(1))
    }

    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.memory_limit_mb.saturating_mul(BYTES_PER_MB)).unwrap_or(usize::MAX)
    }
}

/// Capability interface over platform resource controls.
pub trait LimitEnforcer: Send + Sync {
    /// Whether limits are actually enforced on this platform.
    fn is_enforced(&self) -> bool;

    /// Arm limits for one execution on the calling thread.
    ///
    /// The returned guard must live for the whole execution; dropping it
    /// disarms the alarm.
    fn arm(&self, limits: &ResourceLimits) -> Result<(ExecutionBudget, LimitGuard), ExecutionError>;
}

/// Returns the enforcer for the current platform.
pub fn platform_enforcer() -> Arc<dyn LimitEnforcer> {
    #[cfg(unix)]
    {
        Arc::new(EnforcedLimits)
    }
    #[cfg(not(unix))]
    {
        Arc::new(UnenforcedLimits::new())
    }
}

/// Enforces wall-clock, CPU-time and memory limits.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EnforcedLimits;

#[cfg(unix)]
impl LimitEnforcer for EnforcedLimits {
    fn is_enforced(&self) -> bool {
        true
    }

    fn arm(&self, limits: &ResourceLimits) -> Result<(ExecutionBudget, LimitGuard), ExecutionError> {
        let interrupt = Arc::new(AtomicBool::new(false));
        let alarm = Alarm::schedule(limits.timeout(), Arc::clone(&interrupt)).map_err(|e| {
            ExecutionError::new(
                ExecutionErrorKind::Internal,
                format!("failed to arm wall-clock alarm: {e}"),
            )
        })?;

        let cpu = thread_cpu_time().map(|start| CpuBudget {
            clock: thread_cpu_time,
            start,
            limit: limits.cpu_limit(),
        });

        let budget = ExecutionBudget {
            interrupt,
            timeout_seconds: limits.timeout_seconds,
            memory_limit: Some(limits.memory_limit_bytes()),
            cpu,
            ticks: 0,
        };
        Ok((budget, LimitGuard { alarm: Some(alarm) }))
    }
}

#[cfg(unix)]
fn thread_cpu_time() -> Option<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    let secs = u64::try_from(ts.tv_sec).ok()?;
    let nanos = u32::try_from(ts.tv_nsec).ok()?;
    Some(Duration::new(secs, nanos))
}

/// Arms nothing. Warns the first time it is used.
#[derive(Debug, Default)]
pub struct UnenforcedLimits {
    warned: AtomicBool,
}

impl UnenforcedLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the capability-gap warning has been emitted.
    pub fn has_warned(&self) -> bool {
        self.warned.load(Ordering::SeqCst)
    }
}

impl LimitEnforcer for UnenforcedLimits {
    fn is_enforced(&self) -> bool {
        false
    }

    fn arm(&self, limits: &ResourceLimits) -> Result<(ExecutionBudget, LimitGuard), ExecutionError> {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                timeout_seconds = limits.timeout_seconds,
                memory_limit_mb = limits.memory_limit_mb,
                "resource limits are not enforced on this platform; strategy execution is unprotected"
            );
        }
        Ok((ExecutionBudget::unlimited(), LimitGuard { alarm: None }))
    }
}

/// Keeps the wall-clock alarm alive for one execution.
#[derive(Debug)]
pub struct LimitGuard {
    alarm: Option<Alarm>,
}

impl LimitGuard {
    pub fn has_alarm(&self) -> bool {
        self.alarm.is_some()
    }
}

/// Watchdog thread that raises the interrupt flag once the deadline passes.
#[derive(Debug)]
struct Alarm {
    cancel: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Alarm {
    fn schedule(after: Duration, interrupt: Arc<AtomicBool>) -> std::io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("stratbox-alarm".into())
            .spawn(move || {
                if let Err(mpsc::RecvTimeoutError::Timeout) = cancelled.recv_timeout(after) {
                    interrupt.store(true, Ordering::SeqCst);
                }
            })?;
        Ok(Alarm {
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the watchdog immediately.
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("wall-clock alarm thread panicked");
            }
        }
    }
}

struct CpuBudget {
    clock: fn() -> Option<Duration>,
    start: Duration,
    limit: Duration,
}

/// Per-execution limit state polled by the interpreter.
pub struct ExecutionBudget {
    interrupt: Arc<AtomicBool>,
    timeout_seconds: u64,
    memory_limit: Option<usize>,
    cpu: Option<CpuBudget>,
    ticks: u64,
}

impl ExecutionBudget {
    /// A budget that never trips.
    pub fn unlimited() -> Self {
        ExecutionBudget {
            interrupt: Arc::new(AtomicBool::new(false)),
            timeout_seconds: 0,
            memory_limit: None,
            cpu: None,
            ticks: 0,
        }
    }

    /// A budget with only a memory cap, for tests and tooling.
    pub fn with_memory_limit(bytes: usize) -> Self {
        ExecutionBudget {
            memory_limit: Some(bytes),
            ..Self::unlimited()
        }
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    /// Handle that trips the budget when set; used by the alarm.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Called by the interpreter on every statement, loop iteration and call.
    pub fn check(&mut self) -> Result<(), ExecutionError> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(ExecutionError::new(
                ExecutionErrorKind::Timeout,
                format!("wall-clock limit of {}s exceeded", self.timeout_seconds),
            ));
        }

        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % CPU_SAMPLE_INTERVAL == 0 {
            if let Some(cpu) = &self.cpu {
                if let Some(now) = (cpu.clock)() {
                    if now.saturating_sub(cpu.start) > cpu.limit {
                        return Err(ExecutionError::new(
                            ExecutionErrorKind::CpuTimeExceeded,
                            format!("cpu time limit of {}s exceeded", cpu.limit.as_secs()),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Live-byte accounting for script allocations.
///
/// Containers charge on growth and release on drop, so the meter tracks what
/// the script currently holds rather than what it ever allocated.
#[derive(Debug)]
pub struct MemoryMeter {
    used: Cell<usize>,
    limit: Option<usize>,
}

impl MemoryMeter {
    pub fn new(limit: Option<usize>) -> Rc<Self> {
        Rc::new(MemoryMeter {
            used: Cell::new(0),
            limit,
        })
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Fail without charging if `bytes` more would exceed the limit.
    pub fn ensure_fits(&self, bytes: usize) -> Result<(), ExecutionError> {
        if let Some(limit) = self.limit {
            let next = self.used.get().saturating_add(bytes);
            if next > limit {
                return Err(ExecutionError::new(
                    ExecutionErrorKind::MemoryExceeded,
                    format!(
                        "memory limit of {} MB exceeded (requested {} bytes with {} in use)",
                        limit as u64 / BYTES_PER_MB,
                        bytes,
                        self.used.get()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn charge(&self, bytes: usize) -> Result<(), ExecutionError> {
        self.ensure_fits(bytes)?;
        self.used.set(self.used.get().saturating_add(bytes));
        Ok(())
    }

    pub fn release(&self, bytes: usize) {
        self.used.set(self.used.get().saturating_sub(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.timeout(), Duration::from_secs(30));
        assert_eq!(limits.cpu_limit(), Duration::from_secs(31));
        assert_eq!(limits.memory_limit_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn unlimited_budget_never_trips() {
        let mut budget = ExecutionBudget::unlimited();
        for _ in 0..10_000 {
            assert!(budget.check().is_ok());
        }
        assert_eq!(budget.memory_limit(), None);
    }

    #[test]
    fn interrupt_trips_budget_as_timeout() {
        let mut budget = ExecutionBudget::unlimited();
        budget.interrupt_handle().store(true, Ordering::SeqCst);
        let err = budget.check().unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Timeout);
    }

    #[test]
    fn meter_charges_and_releases() {
        let meter = MemoryMeter::new(Some(100));
        meter.charge(60).unwrap();
        assert_eq!(meter.used(), 60);
        let err = meter.charge(41).unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::MemoryExceeded);
        assert_eq!(meter.used(), 60);
        meter.release(60);
        assert_eq!(meter.used(), 0);
        meter.charge(100).unwrap();
    }

    #[test]
    fn meter_without_limit_accepts_anything() {
        let meter = MemoryMeter::new(None);
        meter.charge(usize::MAX / 2).unwrap();
        meter.ensure_fits(usize::MAX / 2).unwrap();
    }

    #[test]
    fn unenforced_warns_once_and_arms_nothing() {
        let enforcer = UnenforcedLimits::new();
        assert!(!enforcer.is_enforced());
        assert!(!enforcer.has_warned());

        let (budget, guard) = enforcer.arm(&ResourceLimits::default()).unwrap();
        assert!(enforcer.has_warned());
        assert!(!guard.has_alarm());
        assert_eq!(budget.memory_limit(), None);

        let _ = enforcer.arm(&ResourceLimits::default()).unwrap();
        assert!(enforcer.has_warned());
    }

    #[cfg(unix)]
    #[test]
    fn enforced_alarm_fires_after_timeout() {
        let limits = ResourceLimits {
            timeout_seconds: 1,
            memory_limit_mb: 8,
        };
        let (mut budget, guard) = EnforcedLimits.arm(&limits).unwrap();
        assert!(guard.has_alarm());
        assert_eq!(budget.memory_limit(), Some(8 * 1024 * 1024));
        assert!(budget.check().is_ok());

        std::thread::sleep(Duration::from_millis(1300));
        let err = budget.check().unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Timeout);
        drop(guard);
    }

    #[cfg(unix)]
    #[test]
    fn dropping_guard_cancels_alarm_promptly() {
        let limits = ResourceLimits {
            timeout_seconds: 60,
            memory_limit_mb: 8,
        };
        let (budget, guard) = EnforcedLimits.arm(&limits).unwrap();
        let started = std::time::Instant::now();
        drop(guard);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!budget.interrupt_handle().load(Ordering::SeqCst));
    }

    #[cfg(unix)]
    #[test]
    fn thread_cpu_clock_is_available() {
        assert!(thread_cpu_time().is_some());
    }
}
