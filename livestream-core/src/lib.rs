pub mod analytics;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod encoder;
pub mod error;
pub mod hub;
pub mod segments;

pub use analytics::{Analytics, AnalyticsSnapshot, UNATTRIBUTED_VIDEO};
pub use catalog::{CatalogError, VideoCatalog, VideoEntry};
pub use channel::{
    ChannelOverview, ChannelState, ChannelStateCell, Orchestrator, StateSummary, Viewer,
    ViewerKey,
};
pub use config::{load_livestream_config, LivestreamConfig};
pub use encoder::{
    probe_encoder, EncodeHandle, EncodeJob, EncoderError, EncoderExit, EncoderLauncher,
    EncoderProcess, EncoderSupervisor, FfmpegLauncher, SupervisorPhase, SupervisorStats,
};
pub use error::{ConfigError, Result};
pub use hub::{BroadcastHub, ChatMessage, ConnectionHandle, ConnectionId, HubError, HubEvent};
pub use segments::{Readiness, RetentionSweeper, SegmentStore, SweepReport};
