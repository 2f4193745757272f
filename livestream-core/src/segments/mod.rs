pub mod retention;

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::LivestreamConfig;
use crate::error::SegmentError;

pub use retention::{RetentionSweeper, SweepReport};

// roughly 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Directory holding the live manifest and its rolling media segments.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    manifest_name: String,
    segment_extension: String,
}

impl SegmentStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        manifest_name: impl Into<String>,
        segment_extension: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            manifest_name: manifest_name.into(),
            segment_extension: segment_extension.into(),
        }
    }

    pub fn from_config(config: &LivestreamConfig) -> Self {
        Self::new(
            config.output_dir(),
            config.segments.manifest_name.clone(),
            config.segments.segment_extension.clone(),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(&self.manifest_name)
    }

    pub fn ensure_dir(&self) -> Result<(), SegmentError> {
        fs::create_dir_all(&self.dir).map_err(|source| SegmentError::CreateDir {
            dir: self.dir.clone(),
            source,
        })
    }

    pub fn has_manifest(&self) -> bool {
        self.manifest_path().is_file()
    }

    fn is_segment(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext == self.segment_extension.as_str())
            .unwrap_or(false)
    }

    pub fn has_segment(&self) -> bool {
        match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .any(|entry| self.is_segment(&entry.path())),
            Err(_) => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.has_manifest() && self.has_segment()
    }

    /// Lists segment files with their modification times. Entries that
    /// vanish between listing and stat are skipped.
    pub fn segments(&self) -> Result<Vec<SegmentFile>, SegmentError> {
        let list_error = |source| SegmentError::List {
            dir: self.dir.clone(),
            source,
        };
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(list_error)? {
            let entry = entry.map_err(list_error)?;
            let path = entry.path();
            if !self.is_segment(&path) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(list_error(err)),
            };
            if !metadata.is_file() {
                continue;
            }
            segments.push(SegmentFile {
                name: entry.file_name().to_string_lossy().to_string(),
                path,
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    pub fn remove(&self, segment: &SegmentFile) -> Result<(), SegmentError> {
        fs::remove_file(&segment.path).map_err(|source| SegmentError::Remove {
            name: segment.name.clone(),
            source,
        })
    }

    /// Polls until the manifest and at least one segment exist, or the
    /// timeout elapses.
    pub async fn wait_until_ready(&self, timeout: Duration, poll: Duration) -> Readiness {
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        loop {
            if self.is_ready() {
                debug!(dir = %self.dir.display(), "segment store ready");
                return Readiness::Ready;
            }
            let now = Instant::now();
            if now >= deadline {
                return Readiness::TimedOut;
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    /// Maps a requested file name onto the store. Only bare file names of
    /// existing files resolve.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let candidate = Path::new(name);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => {
                warn!(name, "rejected segment lookup");
                return None;
            }
        }
        let path = self.dir.join(candidate);
        path.is_file().then_some(path)
    }
}
