use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use livestream_core::catalog::scan_media_dir;
use livestream_core::{
    load_livestream_config, probe_encoder, ChannelOverview, LivestreamConfig, Orchestrator,
    RetentionSweeper, SegmentStore, SweepReport, VideoEntry,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] livestream_core::ConfigError),
    #[error("catalog error: {0}")]
    Catalog(#[from] livestream_core::CatalogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Single-channel HLS livestream control interface", long_about = None)]
pub struct Cli {
    /// Path to livestream.toml
    #[arg(long, default_value = "configs/livestream.toml")]
    pub config: PathBuf,
    /// Overrides paths.media_dir
    #[arg(long)]
    pub media_dir: Option<PathBuf>,
    /// Overrides paths.output_dir
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the channel until interrupted
    Run(RunArgs),
    /// Lists the videos eligible for rotation
    Catalog,
    /// Removes expired segments once
    Sweep,
    /// Checks config, directories and the encoder binary
    Check,
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Stops after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "livestreamctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Run(args) => {
            let overview = context.run_channel(args)?;
            render(&overview, cli.format)?;
        }
        Commands::Catalog => {
            let catalog = context.catalog()?;
            render(&catalog, cli.format)?;
        }
        Commands::Sweep => {
            let report = context.sweep();
            render(&report, cli.format)?;
        }
        Commands::Check => {
            let report = context.health_check()?;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config_path: PathBuf,
    config: LivestreamConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_livestream_config(&config_path)?;
        if let Some(dir) = &cli.media_dir {
            config.paths.media_dir = absolute(dir)?.to_string_lossy().to_string();
        }
        if let Some(dir) = &cli.output_dir {
            config.paths.output_dir = absolute(dir)?.to_string_lossy().to_string();
        }
        Ok(Self {
            config_path,
            config,
        })
    }

    fn runtime(&self) -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?)
    }

    fn run_channel(&self, args: &RunArgs) -> Result<ChannelOverview> {
        self.runtime()?.block_on(async {
            let orchestrator = Orchestrator::new(&self.config);
            if orchestrator.videos().is_empty() {
                warn!(
                    dir = %self.config.media_dir().display(),
                    "no videos yet; the channel will retry until some appear"
                );
            }
            orchestrator.start();

            let observer = orchestrator.attach_viewer(Some("livestreamctl".to_string()));
            let key = observer.key.clone();
            let mut outbound = observer.connection;
            let logger = tokio::spawn(async move {
                while let Some(payload) = outbound.recv().await {
                    log_event(&payload);
                }
            });

            match args.duration_secs {
                Some(secs) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                        signal = tokio::signal::ctrl_c() => signal?,
                    }
                }
                None => tokio::signal::ctrl_c().await?,
            }
            info!("shutting down channel");

            orchestrator.shutdown().await;
            orchestrator.detach_viewer(&key);
            if let Err(err) = logger.await {
                warn!(error = %err, "event logger ended abnormally");
            }
            Ok::<_, AppError>(orchestrator.overview())
        })
    }

    fn catalog(&self) -> Result<CatalogReport> {
        let media_dir = self.config.media_dir();
        let videos = scan_media_dir(&media_dir, &self.config.catalog.extension)?;
        Ok(CatalogReport { media_dir, videos })
    }

    fn sweep(&self) -> SweepReport {
        let sweeper = RetentionSweeper::new(
            SegmentStore::from_config(&self.config),
            self.config.retention.window(),
            self.config.retention.interval(),
        );
        sweeper.sweep()
    }

    fn health_check(&self) -> Result<Vec<HealthEntry>> {
        let mut results = Vec::new();
        results.push(self.check_path("livestream.toml", &self.config_path));

        let media_dir = self.config.media_dir();
        let media = self.check_directory("media_dir", &media_dir);
        let media_ok = matches!(media.status, CheckStatus::Ok);
        results.push(media);
        if media_ok {
            results.push(
                match scan_media_dir(&media_dir, &self.config.catalog.extension) {
                    Ok(videos) if videos.is_empty() => HealthEntry::warn(
                        "catalog",
                        format!("no .{} files", self.config.catalog.extension),
                    ),
                    Ok(videos) => HealthEntry::ok("catalog", format!("{} videos", videos.len())),
                    Err(err) => HealthEntry::error("catalog", err.to_string()),
                },
            );
        }

        let store = SegmentStore::from_config(&self.config);
        results.push(self.check_directory("output_dir", store.dir()));
        results.push(if store.has_manifest() {
            HealthEntry::ok("manifest", store.manifest_path().display().to_string())
        } else {
            HealthEntry::warn(
                "manifest",
                format!("{} not generated yet", store.manifest_path().display()),
            )
        });

        let program = PathBuf::from(&self.config.encoder.ffmpeg);
        let probe = self.runtime()?.block_on(probe_encoder(&program));
        results.push(match probe {
            Ok(version) => HealthEntry::ok("encoder", version),
            Err(err) => HealthEntry::error("encoder", err.to_string()),
        });

        Ok(results)
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn log_event(payload: &str) {
    let Ok(event) = serde_json::from_str::<Value>(payload) else {
        warn!(payload, "unreadable channel event");
        return;
    };
    match event["type"].as_str() {
        Some("state_update") => match event["state"]["current_video"].as_str() {
            Some(video) => info!(
                video,
                play_count = event["state"]["play_count"].as_u64().unwrap_or_default(),
                "now playing"
            ),
            None => info!("nothing playing"),
        },
        Some("chat") => info!(
            username = event["username"].as_str().unwrap_or_default(),
            message = event["message"].as_str().unwrap_or_default(),
            "chat"
        ),
        _ => warn!(payload, "unexpected channel event"),
    }
}

#[derive(Debug, Serialize)]
pub struct CatalogReport {
    pub media_dir: PathBuf,
    pub videos: Vec<VideoEntry>,
}

impl DisplayFallback for CatalogReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} videos in {}",
            self.videos.len(),
            self.media_dir.display()
        )];
        for video in &self.videos {
            lines.push(format!("  - {}", video.name));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SweepReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Scanned {} segments, removed {}",
            self.scanned,
            self.removed.len()
        )];
        for name in &self.removed {
            lines.push(format!("  - {name}"));
        }
        for failure in &self.failures {
            lines.push(format!("  ! {failure}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for ChannelOverview {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        match (&self.state.current_video, self.started_at) {
            (Some(video), Some(started)) => lines.push(format!(
                "Last video: {video} (started {})",
                started.format("%Y-%m-%d %H:%M:%S UTC")
            )),
            _ => lines.push("Last video: none".to_string()),
        }
        lines.push(format!("Phase: {}", self.phase));
        lines.push(format!(
            "Cycles: {} completed, {} failed, {} backoffs",
            self.stats.cycles_completed, self.stats.cycles_failed, self.stats.backoffs
        ));
        lines.push(format!(
            "Viewers: peak {}, current {}",
            self.analytics.peak_viewers, self.analytics.current_viewers
        ));
        if !self.analytics.play_counts.is_empty() {
            lines.push("Plays:".to_string());
            for (video, count) in &self.analytics.play_counts {
                lines.push(format!("  - {video}: {count}"));
            }
        }
        if !self.analytics.view_durations.is_empty() {
            lines.push("Watch time:".to_string());
            for (video, secs) in &self.analytics.view_durations {
                lines.push(format!("  - {video}: {secs:.2} s"));
            }
        }
        lines.push(format!("Chat messages: {}", self.chat_messages));
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| entry.display())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn prepare_test_context(command: Commands) -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::write(
            configs_dir.join("livestream.toml"),
            r#"
[paths]
media_dir = "../mp4-files"
output_dir = "../hls_output"

[encoder]
ffmpeg = "/nonexistent/ffmpeg"
"#,
        )
        .unwrap();

        let media_dir = root.join("mp4-files");
        fs::create_dir_all(&media_dir).unwrap();
        for name in ["b.mp4", "a.mp4", "notes.txt"] {
            fs::write(media_dir.join(name), b"data").unwrap();
        }

        let cli = Cli {
            config: configs_dir.join("livestream.toml"),
            media_dir: None,
            output_dir: None,
            format: OutputFormat::Json,
            verbose: false,
            command,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[test]
    fn catalog_lists_sorted_videos() {
        let (_temp, context) = prepare_test_context(Commands::Catalog).unwrap();
        let report = context.catalog().unwrap();
        let names: Vec<_> = report.videos.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["a.mp4", "b.mp4"]);
        assert!(report.display().starts_with("2 videos"));
    }

    #[test]
    fn overrides_replace_config_paths() {
        let (temp, _) = prepare_test_context(Commands::Catalog).unwrap();
        let other = temp.path().join("elsewhere");
        fs::create_dir_all(&other).unwrap();
        let cli = Cli {
            config: temp.path().join("configs/livestream.toml"),
            media_dir: Some(other.clone()),
            output_dir: None,
            format: OutputFormat::Text,
            verbose: false,
            command: Commands::Catalog,
        };
        let context = AppContext::new(&cli).unwrap();
        assert_eq!(context.config.media_dir(), other);
        assert!(context.catalog().unwrap().videos.is_empty());
    }

    #[test]
    fn sweep_removes_expired_segments() {
        let (temp, context) = prepare_test_context(Commands::Sweep).unwrap();
        let output = temp.path().join("hls_output");
        fs::create_dir_all(&output).unwrap();
        let old = File::create(output.join("segment000.ts")).unwrap();
        old.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        File::create(output.join("segment001.ts")).unwrap();

        let report = context.sweep();
        assert_eq!(report.removed, vec!["segment000.ts"]);
        assert!(output.join("segment001.ts").exists());
    }

    #[test]
    fn health_check_flags_missing_encoder() {
        let (_temp, context) = prepare_test_context(Commands::Check).unwrap();
        let report = context.health_check().unwrap();
        let status = |name: &str| {
            report
                .iter()
                .find(|entry| entry.name == name)
                .map(|entry| entry.status.to_string())
        };
        assert_eq!(status("livestream.toml").as_deref(), Some("OK"));
        assert_eq!(status("catalog").as_deref(), Some("OK"));
        assert_eq!(status("output_dir").as_deref(), Some("WARN"));
        assert_eq!(status("manifest").as_deref(), Some("WARN"));
        assert_eq!(status("encoder").as_deref(), Some("ERROR"));
    }

    #[test]
    fn missing_config_is_reported() {
        let cli = Cli {
            config: PathBuf::from("/nonexistent/livestream.toml"),
            media_dir: None,
            output_dir: None,
            format: OutputFormat::Text,
            verbose: false,
            command: Commands::Check,
        };
        assert!(matches!(AppContext::new(&cli), Err(AppError::Config(_))));
    }
}
