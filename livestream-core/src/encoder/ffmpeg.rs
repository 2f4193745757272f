use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{EncoderSection, LivestreamConfig, SegmentsSection};

use super::{EncodeJob, EncoderError, EncoderExit, EncoderLauncher, EncoderProcess};

const STDERR_TAIL_LINES: usize = 40;

/// Arguments for a real-time HLS encode of `input` into `output_dir`.
pub fn hls_args(
    encoder: &EncoderSection,
    segments: &SegmentsSection,
    input: &Path,
    output_dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-loglevel".to_string(),
        encoder.log_level.clone(),
        "-re".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-c:v".to_string(),
        encoder.video_codec.clone(),
        "-preset".to_string(),
        encoder.preset.clone(),
    ];
    if !encoder.tune.is_empty() {
        args.push("-tune".to_string());
        args.push(encoder.tune.clone());
    }
    args.extend([
        "-c:a".to_string(),
        encoder.audio_codec.clone(),
        "-ar".to_string(),
        encoder.audio_sample_rate.to_string(),
        "-b:a".to_string(),
        encoder.audio_bitrate.clone(),
        "-ac".to_string(),
        encoder.audio_channels.to_string(),
    ]);
    args.extend(encoder.extra_args.iter().cloned());
    args.extend([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        segments.segment_duration_secs.to_string(),
        "-hls_list_size".to_string(),
        segments.list_size.to_string(),
        "-hls_flags".to_string(),
        "delete_segments+append_list+omit_endlist".to_string(),
        "-hls_segment_filename".to_string(),
        output_dir
            .join(&segments.segment_pattern)
            .to_string_lossy()
            .to_string(),
        "-hls_playlist_type".to_string(),
        "event".to_string(),
        output_dir
            .join(&segments.manifest_name)
            .to_string_lossy()
            .to_string(),
    ]);
    args
}

/// Runs `<ffmpeg> -version` and returns the first line of its output.
pub async fn probe_encoder(program: &Path) -> Result<String, EncoderError> {
    let output = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| EncoderError::Launch {
            program: program.display().to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(EncoderError::Runtime {
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string())
}

#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: PathBuf,
    encoder: EncoderSection,
    segments: SegmentsSection,
}

impl FfmpegLauncher {
    pub fn new(program: PathBuf, encoder: EncoderSection, segments: SegmentsSection) -> Self {
        Self {
            program,
            encoder,
            segments,
        }
    }

    pub fn from_config(config: &LivestreamConfig) -> Self {
        Self::new(
            PathBuf::from(&config.encoder.ffmpeg),
            config.encoder.clone(),
            config.segments.clone(),
        )
    }

    pub fn args_for(&self, job: &EncodeJob) -> Vec<String> {
        hls_args(
            &self.encoder,
            &self.segments,
            &job.video.path,
            &job.output_dir,
        )
    }
}

#[async_trait::async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(&self, job: &EncodeJob) -> Result<Box<dyn EncoderProcess>, EncoderError> {
        let args = self.args_for(job);
        debug!(program = %self.program.display(), args = %args.join(" "), "spawning encoder");
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| EncoderError::Launch {
            program: self.program.display().to_string(),
            source,
        })?;
        Ok(Box::new(FfmpegProcess::new(child)))
    }
}

pub struct FfmpegProcess {
    child: Child,
    pid: Option<u32>,
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<String>>,
}

impl fmt::Debug for FfmpegProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfmpegProcess")
            .field("pid", &self.pid)
            .finish()
    }
}

impl FfmpegProcess {
    fn new(mut child: Child) -> Self {
        let pid = child.id();
        let stdout = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            })
        });
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(tail_lines(stderr)));
        Self {
            child,
            pid,
            stdout,
            stderr,
        }
    }
}

/// Keeps the last lines of a stream so a long-running encoder cannot grow
/// the diagnostic buffer without bound.
async fn tail_lines<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[async_trait::async_trait]
impl EncoderProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<EncoderExit, EncoderError> {
        let status = self.child.wait().await?;
        let mut stderr = String::new();
        if let Some(task) = self.stderr.as_mut() {
            stderr = task.await.unwrap_or_default();
            self.stderr = None;
        }
        if let Some(task) = self.stdout.take() {
            task.abort();
        }
        Ok(EncoderExit {
            status: status.code(),
            stderr,
        })
    }

    async fn terminate(&mut self) -> Result<(), EncoderError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        info!(pid = ?self.pid, "encoder process terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VideoEntry;

    #[test]
    fn hls_args_follow_config() {
        let encoder = EncoderSection::default();
        let segments = SegmentsSection::default();
        let args = hls_args(
            &encoder,
            &segments,
            Path::new("/media/a.mp4"),
            Path::new("/srv/hls"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-re -i /media/a.mp4"));
        assert!(joined.contains("-c:v libx264 -preset veryfast -tune zerolatency"));
        assert!(joined.contains("-hls_time 4 -hls_list_size 20"));
        assert!(joined.contains("-hls_flags delete_segments+append_list+omit_endlist"));
        assert!(joined.contains("-hls_segment_filename /srv/hls/segment%03d.ts"));
        assert_eq!(args.last().map(String::as_str), Some("/srv/hls/playlist.m3u8"));
    }

    #[test]
    fn empty_tune_is_omitted() {
        let encoder = EncoderSection {
            tune: String::new(),
            extra_args: vec!["-g".into(), "48".into()],
            ..EncoderSection::default()
        };
        let args = hls_args(
            &encoder,
            &SegmentsSection::default(),
            Path::new("a.mp4"),
            Path::new("out"),
        );
        assert!(!args.contains(&"-tune".to_string()));
        let joined = args.join(" ");
        assert!(joined.contains("-ac 2 -g 48 -f hls"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let launcher = FfmpegLauncher::new(
            PathBuf::from("/nonexistent/ffmpeg-binary"),
            EncoderSection::default(),
            SegmentsSection::default(),
        );
        let job = EncodeJob {
            video: VideoEntry::new("a.mp4", "/media/a.mp4"),
            output_dir: PathBuf::from("/tmp"),
        };
        let err = launcher.launch(&job).await.err().expect("launch should fail");
        assert!(matches!(err, EncoderError::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stderr_and_exit_status() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("echo working; echo 'bad input' >&2; exit 1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut process = FfmpegProcess::new(child);
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.status, Some(1));
        assert_eq!(exit.stderr, "bad input");
        assert!(matches!(
            exit.into_result(),
            Err(EncoderError::Runtime { status: Some(1), .. })
        ));
        process.terminate().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut process = FfmpegProcess::new(child);
        assert!(process.pid().is_some());
        process.terminate().await.unwrap();
        let exit = process.wait().await.unwrap();
        assert!(!exit.success());
    }
}
