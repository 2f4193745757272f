use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hub::ConnectionId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no eligible videos in catalog")]
    Empty,
    #[error("failed to list media directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: walkdir::Error,
    },
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("failed to create segment directory {dir}: {source}")]
    CreateDir { dir: PathBuf, source: io::Error },
    #[error("failed to list segment directory {dir}: {source}")]
    List { dir: PathBuf, source: io::Error },
    #[error("failed to remove segment {name}: {source}")]
    Remove { name: String, source: io::Error },
}

impl SegmentError {
    /// True when the underlying file or directory no longer exists.
    pub fn is_not_found(&self) -> bool {
        let source = match self {
            SegmentError::CreateDir { source, .. }
            | SegmentError::List { source, .. }
            | SegmentError::Remove { source, .. } => source,
        };
        source.kind() == io::ErrorKind::NotFound
    }
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to launch encoder {program}: {source}")]
    Launch { program: String, source: io::Error },
    #[error("encoder exited with status {status:?}: {stderr}")]
    Runtime { status: Option<i32>, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encoder already running for {video}")]
    Busy { video: String },
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unsupported message type: {0}")]
    UnsupportedKind(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("connection {0} not found")]
    UnknownConnection(ConnectionId),
    #[error("outbound queue for connection {0} is full")]
    QueueFull(ConnectionId),
}
