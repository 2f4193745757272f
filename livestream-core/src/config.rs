use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LivestreamConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub segments: SegmentsSection,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub hub: HubSection,
    /// Directory relative paths are resolved against. Set by the loader.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl LivestreamConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        match &self.base_dir {
            Some(base) if !path.is_absolute() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn media_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.media_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.output_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub media_dir: String,
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogSection {
    pub extension: String,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            extension: "mp4".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub ffmpeg: String,
    pub log_level: String,
    pub video_codec: String,
    pub preset: String,
    pub tune: String,
    pub audio_codec: String,
    pub audio_sample_rate: u32,
    pub audio_bitrate: String,
    pub audio_channels: u8,
    pub extra_args: Vec<String>,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            log_level: "error".into(),
            video_codec: "libx264".into(),
            preset: "veryfast".into(),
            tune: "zerolatency".into(),
            audio_codec: "aac".into(),
            audio_sample_rate: 44_100,
            audio_bitrate: "128k".into(),
            audio_channels: 2,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentsSection {
    pub manifest_name: String,
    pub segment_pattern: String,
    pub segment_extension: String,
    pub segment_duration_secs: u32,
    pub list_size: u32,
    pub readiness_timeout_secs: u64,
    pub readiness_poll_ms: u64,
}

impl SegmentsSection {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms.max(1))
    }
}

impl Default for SegmentsSection {
    fn default() -> Self {
        Self {
            manifest_name: "playlist.m3u8".into(),
            segment_pattern: "segment%03d.ts".into(),
            segment_extension: "ts".into(),
            segment_duration_secs: 4,
            list_size: 20,
            readiness_timeout_secs: 30,
            readiness_poll_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub window_secs: u64,
    pub interval_secs: u64,
}

impl RetentionSection {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for RetentionSection {
    fn default() -> Self {
        // 0.005 days
        Self {
            window_secs: 432,
            interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub backoff_secs: u64,
    pub cooldown_secs: u64,
}

impl SupervisorSection {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs.max(1))
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            backoff_secs: 5,
            cooldown_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub chat_history: usize,
    pub outbound_buffer: usize,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            chat_history: 100,
            outbound_buffer: 256,
        }
    }
}

/// Loads the channel config and records the file's directory as the base
/// for relative paths.
pub fn load_livestream_config<P: AsRef<Path>>(path: P) -> Result<LivestreamConfig> {
    let path = path.as_ref();
    let mut config: LivestreamConfig = load_toml(path)?;
    config.base_dir = path.parent().map(Path::to_path_buf);
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
