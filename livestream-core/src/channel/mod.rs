mod state;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::{Analytics, AnalyticsSnapshot};
use crate::catalog::{VideoCatalog, VideoEntry};
use crate::config::LivestreamConfig;
use crate::encoder::{
    EncodeHandle, EncoderLauncher, EncoderSupervisor, FfmpegLauncher, SupervisorPhase,
    SupervisorStats, SupervisorTimings,
};
use crate::hub::{BroadcastHub, ChatMessage, ConnectionHandle, ConnectionId};
use crate::segments::{RetentionSweeper, SegmentStore, SweepReport};

pub use state::{ChannelState, ChannelStateCell, StateSummary};

/// Identifies an attached viewer for detaching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewerKey {
    pub session_id: String,
    pub connection: ConnectionId,
}

/// An attached viewer: its key plus the queue of events to push to it.
#[derive(Debug)]
pub struct Viewer {
    pub key: ViewerKey,
    pub connection: ConnectionHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelOverview {
    pub state: StateSummary,
    pub started_at: Option<DateTime<Utc>>,
    pub phase: SupervisorPhase,
    pub encode: Option<EncodeHandle>,
    pub stats: SupervisorStats,
    pub videos: Vec<VideoEntry>,
    pub analytics: AnalyticsSnapshot,
    pub connections: usize,
    pub chat_messages: usize,
}

struct RunningTasks {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Owns every channel component and is the only surface the web layer
/// talks to.
pub struct Orchestrator {
    catalog: Arc<VideoCatalog>,
    store: SegmentStore,
    analytics: Arc<Analytics>,
    hub: Arc<BroadcastHub>,
    state: ChannelStateCell,
    supervisor: Arc<EncoderSupervisor>,
    sweeper: RetentionSweeper,
    tasks: Mutex<Option<RunningTasks>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("catalog", &self.catalog)
            .field("store", &self.store)
            .field("supervisor", &self.supervisor)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(config: &LivestreamConfig) -> Self {
        Self::with_launcher(config, Arc::new(FfmpegLauncher::from_config(config)))
    }

    pub fn with_launcher(config: &LivestreamConfig, launcher: Arc<dyn EncoderLauncher>) -> Self {
        let catalog = Arc::new(VideoCatalog::load(
            config.media_dir(),
            config.catalog.extension.clone(),
        ));
        let store = SegmentStore::from_config(config);
        let analytics = Arc::new(Analytics::new());
        let hub = Arc::new(BroadcastHub::new(
            config.hub.chat_history,
            config.hub.outbound_buffer,
        ));
        let state = ChannelStateCell::new();
        let supervisor = Arc::new(EncoderSupervisor::new(
            Arc::clone(&catalog),
            store.clone(),
            launcher,
            Arc::clone(&analytics),
            Arc::clone(&hub),
            state.clone(),
            SupervisorTimings::from_config(config),
        ));
        let sweeper = RetentionSweeper::new(
            store.clone(),
            config.retention.window(),
            config.retention.interval(),
        );
        Self {
            catalog,
            store,
            analytics,
            hub,
            state,
            supervisor,
            sweeper,
            tasks: Mutex::new(None),
        }
    }

    /// Spawns the supervisor and sweeper loops. Returns false if they are
    /// already running. Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_some() {
            warn!("channel already started");
            return false;
        }
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(Arc::clone(&self.supervisor).run(cancel.child_token()));
        let sweeper = tokio::spawn(self.sweeper.clone().run(cancel.child_token()));
        *tasks = Some(RunningTasks {
            cancel,
            supervisor,
            sweeper,
        });
        info!(videos = self.catalog.len(), "channel started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Cancels both loops and waits for them. The supervisor terminates any
    /// in-flight encoder before its task finishes. Viewer connections are
    /// left to close on their own.
    pub async fn shutdown(&self) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(tasks) = tasks else {
            debug!("channel not running");
            return;
        };
        tasks.cancel.cancel();
        if let Err(err) = tasks.supervisor.await {
            warn!(error = %err, "supervisor task ended abnormally");
        }
        if let Err(err) = tasks.sweeper.await {
            warn!(error = %err, "sweeper task ended abnormally");
        }
        info!("channel stopped");
    }

    pub fn current_state(&self) -> StateSummary {
        StateSummary::from_state(&self.state.current(), &self.analytics)
    }

    pub fn channel_state(&self) -> ChannelState {
        self.state.current()
    }

    pub fn analytics_snapshot(&self) -> AnalyticsSnapshot {
        self.analytics.snapshot()
    }

    /// Rebuilds the catalog after media files were added or removed.
    pub fn reload_catalog(&self) -> usize {
        self.catalog.reload()
    }

    pub fn videos(&self) -> Arc<Vec<VideoEntry>> {
        self.catalog.snapshot()
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.supervisor.phase()
    }

    pub fn current_encode(&self) -> Option<EncodeHandle> {
        self.supervisor.current_encode()
    }

    pub fn supervisor_stats(&self) -> SupervisorStats {
        self.supervisor.stats()
    }

    pub fn sweep_now(&self) -> SweepReport {
        self.sweeper.sweep()
    }

    /// Joins a viewer to the hub and starts its analytics session. A fresh
    /// session id is minted when none is supplied.
    pub fn attach_viewer(&self, session_id: Option<String>) -> Viewer {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection = self.hub.join();
        self.analytics.session_start(&session_id);
        info!(session_id = %session_id, connection = %connection.id(), "viewer attached");
        Viewer {
            key: ViewerKey {
                session_id,
                connection: connection.id(),
            },
            connection,
        }
    }

    /// Removes the viewer from the hub and credits its watch time to the
    /// video live at this moment. Safe to call more than once.
    pub fn detach_viewer(&self, key: &ViewerKey) {
        self.hub.leave(key.connection);
        let live = self.state.current_video_name();
        if let Some(elapsed) = self.analytics.session_end(&key.session_id, live.as_deref()) {
            info!(
                session_id = %key.session_id,
                watched_secs = elapsed.as_secs_f64(),
                "viewer detached"
            );
        }
    }

    pub fn post_chat(&self, username: impl Into<String>, message: impl Into<String>) -> ChatMessage {
        self.hub.post_chat(username, message)
    }

    /// Feeds a viewer's inbound payloads to the hub until the stream ends,
    /// then detaches the viewer.
    pub async fn serve_viewer<S>(&self, key: ViewerKey, inbound: S)
    where
        S: Stream<Item = String>,
    {
        futures::pin_mut!(inbound);
        while let Some(raw) = inbound.next().await {
            self.hub.handle_inbound(key.connection, &raw);
        }
        self.detach_viewer(&key);
    }

    pub fn overview(&self) -> ChannelOverview {
        let channel = self.state.current();
        let hub_chat = self.hub.chat_history().len();
        ChannelOverview {
            state: StateSummary::from_state(&channel, &self.analytics),
            started_at: channel.started_at,
            phase: self.supervisor.phase(),
            encode: self.supervisor.current_encode(),
            stats: self.supervisor.stats(),
            videos: self.catalog.snapshot().as_ref().clone(),
            analytics: self.analytics.snapshot(),
            connections: self.hub.connection_count(),
            chat_messages: hub_chat,
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(tasks) = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            tasks.cancel.cancel();
        }
    }
}
