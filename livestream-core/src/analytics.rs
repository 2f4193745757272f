use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// Bucket for watch time accumulated while nothing is live.
pub const UNATTRIBUTED_VIDEO: &str = "Unknown";

#[derive(Debug, Default)]
struct AnalyticsState {
    play_counts: HashMap<String, u64>,
    view_durations: HashMap<String, f64>,
    peak_viewers: usize,
    current_viewers: usize,
    sessions: HashMap<String, Instant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticsSnapshot {
    pub play_counts: BTreeMap<String, u64>,
    /// Accumulated seconds, rounded to two decimals.
    pub view_durations: BTreeMap<String, f64>,
    pub peak_viewers: usize,
    pub current_viewers: usize,
}

/// Play counts, watch time and viewer counts for the lifetime of the process.
#[derive(Debug, Default)]
pub struct Analytics {
    inner: Mutex<AnalyticsState>,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AnalyticsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increments and returns the lifetime play count of `video`.
    pub fn record_play(&self, video: &str) -> u64 {
        let mut state = self.state();
        let count = state.play_counts.entry(video.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn play_count(&self, video: &str) -> u64 {
        self.state().play_counts.get(video).copied().unwrap_or(0)
    }

    /// Registers a viewer. Returns false if the session is already active,
    /// in which case nothing is counted twice.
    pub fn session_start(&self, session_id: &str) -> bool {
        let mut state = self.state();
        if state.sessions.contains_key(session_id) {
            debug!(session_id, "session already active");
            return false;
        }
        state.sessions.insert(session_id.to_string(), Instant::now());
        state.current_viewers += 1;
        state.peak_viewers = state.peak_viewers.max(state.current_viewers);
        true
    }

    /// Ends a viewer session and credits its duration to `live_video`, the
    /// video live when the session ends rather than when it started.
    /// Unknown sessions are ignored.
    pub fn session_end(&self, session_id: &str, live_video: Option<&str>) -> Option<Duration> {
        let mut state = self.state();
        let joined = state.sessions.remove(session_id)?;
        let elapsed = joined.elapsed();
        let video = live_video.unwrap_or(UNATTRIBUTED_VIDEO).to_string();
        *state.view_durations.entry(video).or_insert(0.0) += elapsed.as_secs_f64();
        state.current_viewers = state.current_viewers.saturating_sub(1);
        Some(elapsed)
    }

    pub fn current_viewers(&self) -> usize {
        self.state().current_viewers
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        let state = self.state();
        AnalyticsSnapshot {
            play_counts: state
                .play_counts
                .iter()
                .map(|(name, count)| (name.clone(), *count))
                .collect(),
            view_durations: state
                .view_durations
                .iter()
                .map(|(name, secs)| (name.clone(), round_hundredths(*secs)))
                .collect(),
            peak_viewers: state.peak_viewers,
            current_viewers: state.current_viewers,
        }
    }
}

fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
