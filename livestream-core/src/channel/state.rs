use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::analytics::Analytics;
use crate::catalog::VideoEntry;

/// What is live right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelState {
    pub current_video: Option<VideoEntry>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ChannelState {
    pub fn current_video_name(&self) -> Option<&str> {
        self.current_video.as_ref().map(|video| video.name.as_str())
    }
}

/// Single-writer cell for [`ChannelState`]. Each update replaces the whole
/// value, so readers never see a half-written state.
#[derive(Debug, Clone)]
pub struct ChannelStateCell {
    sender: Arc<watch::Sender<ChannelState>>,
}

impl Default for ChannelStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelStateCell {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ChannelState::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn begin(&self, video: VideoEntry, started_at: DateTime<Utc>) {
        self.sender.send_replace(ChannelState {
            current_video: Some(video),
            started_at: Some(started_at),
        });
    }

    pub fn current(&self) -> ChannelState {
        self.sender.borrow().clone()
    }

    pub fn current_video_name(&self) -> Option<String> {
        self.sender
            .borrow()
            .current_video_name()
            .map(str::to_string)
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.sender.subscribe()
    }
}

/// The `state` payload viewers receive: empty until a video has started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub play_count: Option<u64>,
}

impl StateSummary {
    pub fn live(video: impl Into<String>, play_count: u64) -> Self {
        Self {
            current_video: Some(video.into()),
            play_count: Some(play_count),
        }
    }

    pub fn from_state(state: &ChannelState, analytics: &Analytics) -> Self {
        match (&state.current_video, state.started_at) {
            (Some(video), Some(_)) => Self::live(&video.name, analytics.play_count(&video.name)),
            _ => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_video.is_none()
    }
}
