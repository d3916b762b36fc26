//! Periodic timeout scan
//!
//! Runs [`EscalationEngine::tick`] on a fixed interval until cancelled. The
//! engine talks to SQLite synchronously, so each pass runs on the blocking
//! pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{EscalationEngine, TickReport};

pub struct EscalationTicker {
    engine: Arc<EscalationEngine>,
    interval: Duration,
}

impl EscalationTicker {
    pub fn new(engine: Arc<EscalationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Run one pass off the async runtime.
    pub async fn tick_once(&self) -> Option<TickReport> {
        let engine = Arc::clone(&self.engine);
        match tokio::task::spawn_blocking(move || engine.tick()).await {
            Ok(Ok(report)) => {
                if report.advanced > 0 || report.errors > 0 {
                    info!(
                        scanned = report.scanned,
                        advanced = report.advanced,
                        conflicts = report.conflicts,
                        errors = report.errors,
                        "Escalation tick"
                    );
                } else {
                    debug!(scanned = report.scanned, "Escalation tick");
                }
                Some(report)
            }
            Ok(Err(e)) => {
                warn!("Escalation tick failed: {}", e);
                None
            }
            Err(e) => {
                warn!(error = %e, "Escalation tick panicked");
                None
            }
        }
    }

    /// Tick until `cancel` fires. Returns the number of completed passes.
    pub async fn run(self, cancel: CancellationToken) -> usize {
        let mut interval = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = 0;

        info!(interval_ms = self.interval.as_millis() as u64, "Escalation ticker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.tick_once().await.is_some() {
                        passes += 1;
                    }
                }
            }
        }
        info!(passes, "Escalation ticker stopped");
        passes
    }
}
