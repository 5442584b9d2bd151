//! Tick loop
//!
//! Calls the scheduler once per buffer period, either as fast as possible
//! (offline rendering) or paced against a monotonic clock. Tick errors go
//! through an [`ErrorPolicy`]; the graph is torn down when the run ends
//! either way.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::scheduler::{Scheduler, TeardownReport, TickError};

/// How ticks are spaced in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Back to back, for rendering to files
    #[default]
    Offline,
    /// One tick per buffer period of wall-clock time
    Realtime,
}

/// What the driver does when a tick fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop at the first failed tick
    #[default]
    Halt,
    /// Log it and render the next tick
    Skip,
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "halt" => Ok(ErrorPolicy::Halt),
            "skip" => Ok(ErrorPolicy::Skip),
            other => Err(format!("unknown error policy `{}` (expected halt or skip)", other)),
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Halt => write!(f, "halt"),
            ErrorPolicy::Skip => write!(f, "skip"),
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Default)]
pub struct DriverReport {
    pub ticks_rendered: u64,
    pub ticks_failed: u64,
    /// Realtime ticks that finished after their deadline
    pub late_ticks: u64,
    pub elapsed: Duration,
    /// The error that stopped a halting run
    pub halted: Option<TickError>,
    pub teardown: TeardownReport,
}

impl DriverReport {
    /// Turn a halted run or an unclean teardown into an error.
    pub fn into_result(mut self) -> anyhow::Result<Self> {
        if let Some(error) = self.halted.take() {
            let tick = error.tick;
            return Err(anyhow::Error::new(error).context(format!("render halted at tick {}", tick)));
        }
        if let Some((node, error)) = self.teardown.failures.first() {
            anyhow::bail!(
                "teardown failed for {} node(s), first `{}`: {}",
                self.teardown.failures.len(),
                node,
                error
            );
        }
        Ok(self)
    }
}

/// Runs a scheduler for a number of ticks, or until stopped.
pub struct Driver {
    scheduler: Scheduler,
    pacing: Pacing,
    policy: ErrorPolicy,
    stop: Arc<AtomicBool>,
}

impl Driver {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            pacing: Pacing::default(),
            policy: ErrorPolicy::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Setting the flag ends the run after the current tick.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Ticks needed to cover `duration`, rounded up
    pub fn ticks_for(&self, duration: Duration) -> u64 {
        let ctx = self.scheduler.context();
        let samples = (duration.as_secs_f64() * ctx.sample_rate as f64).ceil();
        (samples / ctx.buffer_size as f64).ceil() as u64
    }

    /// Run `ticks` ticks (forever when `None`), then tear down.
    pub fn run(mut self, ticks: Option<u64>) -> DriverReport {
        let mut report = DriverReport::default();
        let ctx = self.scheduler.context();
        let period = Duration::from_secs_f64(ctx.buffer_size as f64 / ctx.sample_rate as f64);

        tracing::info!(
            ticks = ?ticks,
            pacing = ?self.pacing,
            policy = %self.policy,
            sample_rate = ctx.sample_rate,
            buffer_size = ctx.buffer_size,
            "driver starting"
        );

        let start = Instant::now();
        let mut done = 0u64;
        while ticks.map_or(true, |n| done < n) && !self.stop.load(Ordering::Acquire) {
            match self.scheduler.render_tick() {
                Ok(_) => report.ticks_rendered += 1,
                Err(e) => {
                    report.ticks_failed += 1;
                    match self.policy {
                        ErrorPolicy::Halt => {
                            report.halted = Some(e);
                            break;
                        }
                        ErrorPolicy::Skip => {
                            tracing::warn!(node = %e.node, tick = e.tick, "skipping failed tick");
                        }
                    }
                }
            }
            done += 1;

            if self.pacing == Pacing::Realtime {
                let deadline = start + period.mul_f64(done as f64);
                let now = Instant::now();
                if now < deadline {
                    std::thread::sleep(deadline - now);
                } else {
                    report.late_ticks += 1;
                }
            }
        }

        report.elapsed = start.elapsed();
        report.teardown = self.scheduler.teardown();

        tracing::info!(
            rendered = report.ticks_rendered,
            failed = report.ticks_failed,
            late = report.late_ticks,
            elapsed = ?report.elapsed,
            "driver finished"
        );
        report
    }
}
