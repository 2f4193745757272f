use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::Analytics;
use crate::catalog::{CatalogError, VideoCatalog, VideoEntry};
use crate::channel::{ChannelStateCell, StateSummary};
use crate::config::LivestreamConfig;
use crate::hub::BroadcastHub;
use crate::segments::{Readiness, SegmentStore};

use super::{EncodeJob, EncoderError, EncoderLauncher, EncoderProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Idle,
    Selecting,
    Backoff,
    Encoding,
    Draining,
}

impl fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SupervisorPhase::Idle => "idle",
            SupervisorPhase::Selecting => "selecting",
            SupervisorPhase::Backoff => "backoff",
            SupervisorPhase::Encoding => "encoding",
            SupervisorPhase::Draining => "draining",
        };
        f.write_str(label)
    }
}

/// The single in-flight encode. `pid` is unset between reservation and
/// spawn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodeHandle {
    pub pid: Option<u32>,
    pub video: VideoEntry,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub backoffs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Failed,
    Backoff,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    pub backoff: Duration,
    pub cooldown: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
}

impl SupervisorTimings {
    pub fn from_config(config: &LivestreamConfig) -> Self {
        Self {
            backoff: config.supervisor.backoff(),
            cooldown: config.supervisor.cooldown(),
            readiness_timeout: config.segments.readiness_timeout(),
            readiness_poll: config.segments.readiness_poll(),
        }
    }
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            cooldown: Duration::from_secs(1),
            readiness_timeout: Duration::from_secs(30),
            readiness_poll: Duration::from_secs(1),
        }
    }
}

/// Rotates videos through exactly one encoder process at a time.
///
/// Each cycle selects a video, publishes it as the live state, runs the
/// encoder until it exits, announces the state and pauses briefly. Failures
/// only end the current cycle; the loop stops on cancellation alone.
pub struct EncoderSupervisor {
    catalog: Arc<VideoCatalog>,
    store: SegmentStore,
    launcher: Arc<dyn EncoderLauncher>,
    analytics: Arc<Analytics>,
    hub: Arc<BroadcastHub>,
    state: ChannelStateCell,
    timings: SupervisorTimings,
    phase: Mutex<SupervisorPhase>,
    slot: Mutex<Option<EncodeHandle>>,
    stats: Mutex<SupervisorStats>,
}

impl fmt::Debug for EncoderSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderSupervisor")
            .field("store", &self.store)
            .field("timings", &self.timings)
            .field("phase", &self.phase())
            .finish()
    }
}

impl EncoderSupervisor {
    pub fn new(
        catalog: Arc<VideoCatalog>,
        store: SegmentStore,
        launcher: Arc<dyn EncoderLauncher>,
        analytics: Arc<Analytics>,
        hub: Arc<BroadcastHub>,
        state: ChannelStateCell,
        timings: SupervisorTimings,
    ) -> Self {
        Self {
            catalog,
            store,
            launcher,
            analytics,
            hub,
            state,
            timings,
            phase: Mutex::new(SupervisorPhase::Idle),
            slot: Mutex::new(None),
            stats: Mutex::new(SupervisorStats::default()),
        }
    }

    pub fn phase(&self) -> SupervisorPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_encode(&self) -> Option<EncodeHandle> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> SupervisorStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: SupervisorPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        debug!(%phase, "supervisor phase");
    }

    fn record(&self, outcome: CycleOutcome) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            CycleOutcome::Completed => stats.cycles_completed += 1,
            CycleOutcome::Failed => stats.cycles_failed += 1,
            CycleOutcome::Backoff => stats.backoffs += 1,
            CycleOutcome::Cancelled => {}
        }
    }

    fn reserve(&self, video: &VideoEntry, started_at: DateTime<Utc>) -> Result<(), EncoderError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            return Err(EncoderError::Busy {
                video: existing.video.name.clone(),
            });
        }
        *slot = Some(EncodeHandle {
            pid: None,
            video: video.clone(),
            started_at,
        });
        Ok(())
    }

    fn attach_pid(&self, pid: Option<u32>) {
        if let Some(handle) = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            handle.pid = pid;
        }
    }

    fn release(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Broadcasts what is live now to every viewer.
    pub fn announce(&self) {
        let summary = StateSummary::from_state(&self.state.current(), &self.analytics);
        let delivered = self.hub.broadcast_state(&summary);
        debug!(delivered, "broadcasted state update");
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(dir = %self.store.dir().display(), "encoder supervisor started");
        if let Err(err) = self.store.ensure_dir() {
            warn!(error = %err, "failed to create output directory");
        }
        while !cancel.is_cancelled() {
            if self.run_cycle(&cancel).await == CycleOutcome::Cancelled {
                break;
            }
        }
        self.set_phase(SupervisorPhase::Idle);
        info!("encoder supervisor stopped");
    }

    /// Runs one selection-to-cooldown cycle.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        self.set_phase(SupervisorPhase::Selecting);
        let video = match self.catalog.pick_next() {
            Ok(video) => video,
            Err(CatalogError::Empty) | Err(CatalogError::Io { .. }) => {
                warn!("no videos found in the video list");
                self.set_phase(SupervisorPhase::Backoff);
                self.record(CycleOutcome::Backoff);
                if !pause(self.timings.backoff, cancel).await {
                    return CycleOutcome::Cancelled;
                }
                self.set_phase(SupervisorPhase::Idle);
                return CycleOutcome::Backoff;
            }
        };

        let outcome = self.encode(video, cancel).await;
        if outcome == CycleOutcome::Cancelled {
            return outcome;
        }
        self.record(outcome);

        self.set_phase(SupervisorPhase::Draining);
        self.announce();
        if !pause(self.timings.cooldown, cancel).await {
            return CycleOutcome::Cancelled;
        }
        self.set_phase(SupervisorPhase::Idle);
        outcome
    }

    async fn encode(&self, video: VideoEntry, cancel: &CancellationToken) -> CycleOutcome {
        self.set_phase(SupervisorPhase::Encoding);
        let started_at = Utc::now();
        if let Err(err) = self.reserve(&video, started_at) {
            error!(video = %video.name, error = %err, "refusing concurrent encode");
            return CycleOutcome::Failed;
        }
        self.state.begin(video.clone(), started_at);
        let plays = self.analytics.record_play(&video.name);
        info!(video = %video.name, plays, "starting stream");

        let job = EncodeJob {
            video: video.clone(),
            output_dir: self.store.dir().to_path_buf(),
        };
        let mut process = match self.launcher.launch(&job).await {
            Ok(process) => process,
            Err(err) => {
                error!(video = %video.name, error = %err, "failed to launch encoder");
                self.release();
                return CycleOutcome::Failed;
            }
        };
        self.attach_pid(process.pid());
        info!(video = %video.name, pid = ?process.pid(), "encoder process started");

        let outcome = self.monitor(&video, process.as_mut(), cancel).await;
        self.release();
        outcome
    }

    async fn monitor(
        &self,
        video: &VideoEntry,
        process: &mut dyn EncoderProcess,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let readiness = self
            .store
            .wait_until_ready(self.timings.readiness_timeout, self.timings.readiness_poll);
        tokio::pin!(readiness);
        let mut awaiting_readiness = true;

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                result = &mut readiness, if awaiting_readiness => {
                    awaiting_readiness = false;
                    match result {
                        Readiness::Ready => {
                            info!(video = %video.name, "HLS files generated");
                            self.announce();
                        }
                        Readiness::TimedOut => {
                            warn!(
                                video = %video.name,
                                timeout_secs = self.timings.readiness_timeout.as_secs(),
                                "timeout waiting for HLS files"
                            );
                        }
                    }
                }
                exit = process.wait() => break Some(exit),
            }
        };

        match exit {
            None => {
                if let Err(err) = process.terminate().await {
                    warn!(video = %video.name, error = %err, "failed to terminate encoder");
                }
                CycleOutcome::Cancelled
            }
            Some(Ok(exit)) => match exit.into_result() {
                Ok(()) => {
                    info!(video = %video.name, "encoder completed");
                    CycleOutcome::Completed
                }
                Err(err) => {
                    error!(video = %video.name, error = %err, "encoder failed");
                    CycleOutcome::Failed
                }
            },
            Some(Err(err)) => {
                error!(video = %video.name, error = %err, "error waiting on encoder");
                if let Err(err) = process.terminate().await {
                    warn!(video = %video.name, error = %err, "failed to terminate encoder");
                }
                CycleOutcome::Failed
            }
        }
    }
}

/// Sleeps unless cancelled first. Returns false on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
