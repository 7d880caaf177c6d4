#![forbid(unsafe_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use quiztube_tools::{
    config::{
        DEFAULT_ENV_PATH, RuntimeConfig, RuntimeOverrides, resolve_runtime_config,
        upsert_env_value,
    },
    logging, open_store,
    pipeline::{
        ProgressSink, RunPhase, RunRequest, RunSummary, Services, SpreadsheetExporter,
        export_playlist, run_playlist,
    },
    quiz::QuizClient,
    settings::SettingsStore,
    sheets::SheetsClient,
    store::PlaylistSummary,
    youtube::YoutubeClient,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "quizgen", about = "Generate quizzes from YouTube playlists")]
struct Cli {
    /// Env file holding credentials.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Hosted libSQL database URL; overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create and publish quizzes for every video of a playlist.
    Run {
        url: String,
        /// Skip the spreadsheet export at the end.
        #[arg(long)]
        no_export: bool,
    },
    /// Export the stored links of a playlist to a new spreadsheet.
    Export { playlist_id: String },
    /// List stored playlists.
    List,
    /// Verify credentials and database access.
    Check,
    /// Store a new quiz-platform session in the env file.
    Login {
        #[arg(long)]
        cookie: String,
        #[arg(long)]
        csrf: String,
    },
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_dir: self.data_dir.clone(),
            database_url: self.database_url.clone(),
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }

    fn env_path(&self) -> PathBuf {
        self.env_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH))
    }
}

/// Logs each phase change once and every progress update at debug level.
struct LogProgress {
    cancel: Arc<AtomicBool>,
    last_phase: Mutex<Option<RunPhase>>,
}

impl LogProgress {
    fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            last_phase: Mutex::new(None),
        }
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, phase: RunPhase, progress: u8, message: &str) {
        let mut last = self.last_phase.lock();
        if *last != Some(phase) {
            *last = Some(phase);
            info!(progress, "{phase:?}: {message}");
        } else {
            tracing::debug!(progress, "{message}");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    if let Command::Login { cookie, csrf } = &cli.command {
        return login(&cli.env_path(), cookie, csrf);
    }

    let config = resolve_runtime_config(cli.overrides())?;
    match &cli.command {
        Command::Run { url, no_export } => run(&config, url, !no_export).await,
        Command::Export { playlist_id } => export(&config, playlist_id).await,
        Command::List => list(&config).await,
        Command::Check => check(&config).await,
        Command::Login { .. } => Ok(()),
    }
}

async fn run(config: &RuntimeConfig, url: &str, export: bool) -> Result<()> {
    let store = open_store(config).await.context("opening database")?;
    let settings = SettingsStore::load(&config.data_dir).get();
    let services = Services::from_config(config, &settings.pacing)?;
    if export && services.sheets.is_none() {
        warn!("SHEETS_ACCESS_TOKEN not set; skipping spreadsheet export");
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancelling after the current step");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let request = RunRequest {
        playlist_url: url.to_string(),
        export,
    };
    let progress = LogProgress::new(cancel);
    let summary = run_playlist(&request, &services, &store, &settings, &progress).await?;
    println!("{}", describe_summary(&summary));
    Ok(())
}

async fn export(config: &RuntimeConfig, playlist_id: &str) -> Result<()> {
    let Some(credentials) = config.sheets.clone() else {
        bail!("SHEETS_ACCESS_TOKEN not set");
    };
    let store = open_store(config).await.context("opening database")?;
    let settings = SettingsStore::load(&config.data_dir).get();
    let exporter: Arc<dyn SpreadsheetExporter> = Arc::new(SheetsClient::new(
        credentials,
        settings.pacing.retry_policy(),
    )?);
    let exported = export_playlist(&store, exporter, playlist_id).await?;
    println!("{}", exported.url);
    Ok(())
}

async fn list(config: &RuntimeConfig) -> Result<()> {
    let store = open_store(config).await.context("opening database")?;
    let playlists = store.list_playlists().await?;
    if playlists.is_empty() {
        println!("No playlists stored yet");
        return Ok(());
    }
    for playlist in &playlists {
        println!("{}", describe_playlist(playlist));
    }
    Ok(())
}

async fn check(config: &RuntimeConfig) -> Result<()> {
    let retry = SettingsStore::load(&config.data_dir)
        .get()
        .pacing
        .retry_policy();
    let mut report = CheckReport::default();

    let database = match open_store(config).await {
        Ok(store) => store.data_version().await.map(|_| ()),
        Err(err) => Err(err),
    };
    report.record("database", database.map(|()| "ok".to_string()));

    let youtube = match config.youtube_api_key.clone() {
        Some(key) => blocking_check(move || YoutubeClient::new(key)?.verify_key())
            .await
            .map(|()| "key accepted".to_string()),
        None => Err(anyhow!("YOUTUBE_API_KEY not set")),
    };
    report.record("youtube", youtube);

    let quiz = match config.quiz.clone() {
        Some(credentials) => blocking_check(move || QuizClient::new(credentials, retry)?.ping())
            .await
            .map(|()| "session accepted".to_string()),
        None => Err(anyhow!("QUIZ_SESSION_COOKIE or QUIZ_CSRF_TOKEN not set")),
    };
    report.record("quiz platform", quiz);

    if config.sheets.is_some() {
        println!("sheets: token configured");
    } else {
        println!("sheets: not configured, export disabled");
    }

    if report.problems > 0 {
        bail!("{} check(s) failed", report.problems);
    }
    Ok(())
}

async fn blocking_check<F>(task: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("check panicked")?
}

#[derive(Debug, Default)]
struct CheckReport {
    problems: usize,
}

impl CheckReport {
    /// Prints one line per check; failures are counted instead of aborting.
    fn record(&mut self, name: &str, outcome: Result<String>) {
        match outcome {
            Ok(detail) => println!("{name}: {detail}"),
            Err(err) => {
                self.problems += 1;
                println!("{name}: {err:#}");
            }
        }
    }
}

fn login(env_path: &Path, cookie: &str, csrf: &str) -> Result<()> {
    if cookie.trim().is_empty() || csrf.trim().is_empty() {
        bail!("cookie and csrf token must not be empty");
    }
    upsert_env_value(env_path, "QUIZ_SESSION_COOKIE", cookie.trim())?;
    upsert_env_value(env_path, "QUIZ_CSRF_TOKEN", csrf.trim())?;
    info!(path = %env_path.display(), "quiz session saved");
    Ok(())
}

fn describe_summary(summary: &RunSummary) -> String {
    let mut text = format!(
        "{} ({}): {} videos, {} published, {} failed, {} pending, {} reused",
        summary.title,
        summary.playlist_id,
        summary.videos,
        summary.published,
        summary.failed,
        summary.pending,
        summary.reused,
    );
    if let Some(url) = &summary.spreadsheet_url {
        text.push_str(&format!("\nspreadsheet: {url}"));
    }
    text
}

fn describe_playlist(summary: &PlaylistSummary) -> String {
    let playlist = &summary.playlist;
    let mut line = format!(
        "{}  {}  videos={} published={} failed={}",
        playlist.playlist_id,
        playlist.title,
        summary.video_count,
        summary.published_count,
        summary.failed_count,
    );
    if let Some(url) = &playlist.spreadsheet_url {
        line.push_str(&format!("  {url}"));
    }
    line
}
