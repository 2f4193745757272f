use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SegmentStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: Vec<String>,
    pub failures: Vec<String>,
}

/// Deletes segments older than the retention window on a fixed interval,
/// independently of whatever the encoder is doing.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    store: SegmentStore,
    window: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: SegmentStore, window: Duration, interval: Duration) -> Self {
        Self {
            store,
            window,
            interval,
        }
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = now.checked_sub(self.window).unwrap_or(SystemTime::UNIX_EPOCH);
        let segments = match self.store.segments() {
            Ok(segments) => segments,
            Err(err) if err.is_not_found() => return report,
            Err(err) => {
                warn!(dir = %self.store.dir().display(), error = %err, "failed to list segments");
                report.failures.push(err.to_string());
                return report;
            }
        };
        report.scanned = segments.len();
        for segment in segments {
            if segment.modified >= cutoff {
                continue;
            }
            match self.store.remove(&segment) {
                Ok(()) => report.removed.push(segment.name),
                // already pruned by the encoder's rolling window
                Err(err) if err.is_not_found() => {
                    debug!(segment = %segment.name, "segment vanished before removal");
                }
                Err(err) => {
                    warn!(error = %err, "failed to remove segment");
                    report.failures.push(err.to_string());
                }
            }
        }
        report
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            window_secs = self.window.as_secs(),
            interval_secs = self.interval.as_secs(),
            "retention sweeper started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep();
                    debug!(
                        scanned = report.scanned,
                        removed = report.removed.len(),
                        failures = report.failures.len(),
                        "retention sweep finished"
                    );
                }
            }
        }
        info!("retention sweeper stopped");
    }
}
