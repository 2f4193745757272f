pub mod ffmpeg;
pub mod supervisor;

use std::path::PathBuf;

use crate::catalog::VideoEntry;

pub use crate::error::EncoderError;

pub use ffmpeg::{hls_args, probe_encoder, FfmpegLauncher, FfmpegProcess};
pub use supervisor::{
    CycleOutcome, EncodeHandle, EncoderSupervisor, SupervisorPhase, SupervisorStats,
    SupervisorTimings,
};

#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub video: VideoEntry,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderExit {
    pub status: Option<i32>,
    pub stderr: String,
}

impl EncoderExit {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn into_result(self) -> Result<(), EncoderError> {
        if self.success() {
            Ok(())
        } else {
            Err(EncoderError::Runtime {
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

/// Starts one transcoding process for a job.
#[async_trait::async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn launch(&self, job: &EncodeJob) -> Result<Box<dyn EncoderProcess>, EncoderError>;
}

/// A running transcoding process.
#[async_trait::async_trait]
pub trait EncoderProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Waits for the process to exit. Must be cancel safe: dropping the
    /// future and calling again resumes the wait.
    async fn wait(&mut self) -> Result<EncoderExit, EncoderError>;

    /// Stops the process and reaps it. A no-op once it has exited.
    async fn terminate(&mut self) -> Result<(), EncoderError>;
}
