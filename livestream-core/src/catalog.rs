use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub use crate::error::CatalogError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoEntry {
    pub name: String,
    pub path: PathBuf,
}

impl VideoEntry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Videos eligible for rotation. Reloads swap the whole list, so readers
/// always observe either the old or the new listing.
pub struct VideoCatalog {
    media_dir: PathBuf,
    extension: String,
    entries: RwLock<Arc<Vec<VideoEntry>>>,
}

impl fmt::Debug for VideoCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoCatalog")
            .field("media_dir", &self.media_dir)
            .field("extension", &self.extension)
            .field("len", &self.len())
            .finish()
    }
}

impl VideoCatalog {
    pub fn new(media_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            media_dir: media_dir.into(),
            extension: extension.into(),
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn load(media_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        let catalog = Self::new(media_dir, extension);
        catalog.reload();
        catalog
    }

    /// Rebuilds the listing from disk and returns the number of entries.
    /// An unreadable directory leaves the catalog empty.
    pub fn reload(&self) -> usize {
        let entries = match scan_media_dir(&self.media_dir, &self.extension) {
            Ok(entries) => {
                info!(
                    count = entries.len(),
                    dir = %self.media_dir.display(),
                    "loaded videos"
                );
                entries
            }
            Err(err) => {
                error!(error = %err, "error loading video list");
                Vec::new()
            }
        };
        let count = entries.len();
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(entries);
        count
    }

    pub fn snapshot(&self) -> Arc<Vec<VideoEntry>> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn pick_next(&self) -> Result<VideoEntry, CatalogError> {
        self.pick_with(&mut rand::thread_rng())
    }

    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<VideoEntry, CatalogError> {
        self.snapshot()
            .choose(rng)
            .cloned()
            .ok_or(CatalogError::Empty)
    }
}

pub fn scan_media_dir(dir: &Path, extension: &str) -> Result<Vec<VideoEntry>, CatalogError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) if source.depth() == 0 => {
                return Err(CatalogError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
            Err(err) => {
                warn!(error = %err, "skipping unreadable media entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !path.extension().map(|ext| ext == extension).unwrap_or(false) {
            debug!(path = %path.display(), "ignoring non-media file");
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        entries.push(VideoEntry::new(name, path));
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
