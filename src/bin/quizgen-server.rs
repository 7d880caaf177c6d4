#![forbid(unsafe_code)]

//! Axum server behind the playlist page: starts pipeline runs, reports their
//! progress, exposes what is stored in the database and serves the static
//! front end from `WWW_ROOT`.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use parking_lot::{Mutex, RwLock};
use quiztube_tools::{
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    logging, open_store,
    pipeline::{
        CANCELLED_MESSAGE, ProgressSink, RunPhase, RunRequest, RunSummary, Services,
        SpreadsheetExporter, export_playlist, run_playlist,
    },
    settings::{Pacing, RunSettings, SettingsStore},
    sheets::{ExportedSheet, SheetsClient, sheet_rows},
    store::{PlaylistRecord, PlaylistSummary, ResourceRecord, Store, now_timestamp},
    youtube::{PlaylistVideo, parse_playlist_url},
};
use serde::Serialize;
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Parser)]
#[command(name = "quizgen-server", about = "Serve the playlist quiz generator")]
struct ServerArgs {
    /// Directory with the front-end pages.
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Directory for the local database and settings.toml.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// Hosted libSQL database URL; overrides DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            www_root: self.www_root.clone(),
            data_dir: self.data_dir.clone(),
            port: self.port,
            host: self.host.clone(),
            database_url: self.database_url.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/QUIZGEN_HOST")
}

type ServiceFactory = Arc<dyn Fn(&RunSettings) -> Result<Services> + Send + Sync>;
type ExporterFactory =
    Arc<dyn Fn(&Pacing) -> Result<Arc<dyn SpreadsheetExporter>> + Send + Sync>;

/// Finished runs kept for `GET /api/runs`; older ones are dropped on the next start.
const MAX_FINISHED_RUNS: usize = 50;

#[derive(Clone)]
struct RunManager {
    inner: Arc<RunManagerInner>,
}

struct RunManagerInner {
    jobs: Mutex<HashMap<String, RunJob>>,
    counter: AtomicUsize,
    store: Store,
    settings: Arc<SettingsStore>,
    services: ServiceFactory,
}

#[derive(Clone)]
struct RunJob {
    id: String,
    playlist_url: String,
    playlist_id: String,
    phase: RunPhase,
    progress: u8,
    message: String,
    summary: Option<RunSummary>,
    started_at: String,
    finished_at: Option<String>,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunStatus {
    id: String,
    playlist_url: String,
    playlist_id: String,
    phase: RunPhase,
    progress: u8,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<RunSummary>,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<String>,
}

impl From<&RunJob> for RunStatus {
    fn from(job: &RunJob) -> Self {
        Self {
            id: job.id.clone(),
            playlist_url: job.playlist_url.clone(),
            playlist_id: job.playlist_id.clone(),
            phase: job.phase,
            progress: job.progress,
            message: job.message.clone(),
            summary: job.summary.clone(),
            started_at: job.started_at.clone(),
            finished_at: job.finished_at.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCreated {
    id: String,
}

/// Writes pipeline progress straight into the job table.
struct JobProgress {
    inner: Arc<RunManagerInner>,
    job_id: String,
    cancel: Arc<AtomicBool>,
}

impl ProgressSink for JobProgress {
    fn report(&self, phase: RunPhase, progress: u8, message: &str) {
        update_job(&self.inner, &self.job_id, |job| {
            job.phase = phase;
            job.progress = progress.min(100);
            job.message = message.to_string();
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

fn update_job(inner: &RunManagerInner, job_id: &str, apply: impl FnOnce(&mut RunJob)) {
    if let Some(job) = inner.jobs.lock().get_mut(job_id) {
        apply(job);
    }
}

impl RunManager {
    fn new(store: Store, settings: Arc<SettingsStore>, services: ServiceFactory) -> Self {
        Self {
            inner: Arc::new(RunManagerInner {
                jobs: Mutex::new(HashMap::new()),
                counter: AtomicUsize::new(1),
                store,
                settings,
                services,
            }),
        }
    }

    /// Validates the request and spawns the pipeline. Only one active run per
    /// playlist is allowed.
    fn start(&self, request: RunRequest) -> ApiResult<String> {
        let playlist = parse_playlist_url(&request.playlist_url)
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        let settings = self.inner.settings.get();
        let services = (self.inner.services)(&settings)
            .map_err(|err| ApiError::bad_request(format!("cannot start run: {err:#}")))?;

        let job_id = {
            let mut jobs = self.inner.jobs.lock();
            if jobs
                .values()
                .any(|job| job.playlist_id == playlist.id && !job.phase.is_terminal())
            {
                return Err(ApiError::conflict("a run for this playlist is already active"));
            }
            prune_finished(&mut jobs, MAX_FINISHED_RUNS);
            let job_id = self.next_job_id();
            jobs.insert(
                job_id.clone(),
                RunJob {
                    id: job_id.clone(),
                    playlist_url: request.playlist_url.clone(),
                    playlist_id: playlist.id.clone(),
                    phase: RunPhase::Queued,
                    progress: 0,
                    message: "Queued".to_string(),
                    summary: None,
                    started_at: now_timestamp(),
                    finished_at: None,
                    cancel: Arc::new(AtomicBool::new(false)),
                },
            );
            job_id
        };
        info!(run = job_id.as_str(), playlist_id = playlist.id.as_str(), "run queued");

        let inner = self.inner.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            let cancel = inner
                .jobs
                .lock()
                .get(&id)
                .map(|job| job.cancel.clone())
                .unwrap_or_default();
            let progress = JobProgress {
                inner: inner.clone(),
                job_id: id.clone(),
                cancel,
            };
            let result =
                run_playlist(&request, &services, &inner.store, &settings, &progress).await;
            match result {
                Ok(summary) => update_job(&inner, &id, |job| {
                    job.phase = RunPhase::Completed;
                    job.progress = 100;
                    job.summary = Some(summary);
                    job.finished_at = Some(now_timestamp());
                }),
                Err(err) => {
                    let message = format!("{err:#}");
                    if message == CANCELLED_MESSAGE {
                        info!(run = id.as_str(), "run cancelled");
                    } else {
                        error!(run = id.as_str(), "run failed: {message}");
                    }
                    update_job(&inner, &id, |job| {
                        job.phase = RunPhase::Failed;
                        job.message = message;
                        job.finished_at = Some(now_timestamp());
                    });
                }
            }
        });

        Ok(job_id)
    }

    fn get_status(&self, job_id: &str) -> Option<RunStatus> {
        self.inner.jobs.lock().get(job_id).map(RunStatus::from)
    }

    fn list(&self) -> Vec<RunStatus> {
        let jobs = self.inner.jobs.lock();
        let mut runs: Vec<RunStatus> = jobs.values().map(RunStatus::from).collect();
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| job_number(&b.id).cmp(&job_number(&a.id)))
        });
        runs
    }

    fn cancel(&self, job_id: &str) -> Option<RunStatus> {
        let jobs = self.inner.jobs.lock();
        let job = jobs.get(job_id)?;
        if !job.phase.is_terminal() {
            job.cancel.store(true, Ordering::Relaxed);
        }
        Some(RunStatus::from(job))
    }

    fn is_active(&self, playlist_id: &str) -> bool {
        self.inner
            .jobs
            .lock()
            .values()
            .any(|job| job.playlist_id == playlist_id && !job.phase.is_terminal())
    }

    fn next_job_id(&self) -> String {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("run-{id}")
    }
}

fn prune_finished(jobs: &mut HashMap<String, RunJob>, keep: usize) {
    let mut finished: Vec<(usize, String)> = jobs
        .values()
        .filter(|job| job.phase.is_terminal())
        .map(|job| (job_number(&job.id), job.id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

fn job_number(id: &str) -> usize {
    id.strip_prefix("run-")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
struct Integrations {
    youtube: bool,
    quiz_platform: bool,
    spreadsheet: bool,
}

impl Integrations {
    fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            youtube: config.youtube_api_key.is_some(),
            quiz_platform: config.quiz.is_some(),
            spreadsheet: config.sheets.is_some(),
        }
    }
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    store: Store,
    cache: Arc<ApiCache>,
    www_root: Arc<PathBuf>,
    settings: Arc<SettingsStore>,
    runs: RunManager,
    /// Built per export so settings changes reach the retry policy.
    exporter: Option<ExporterFactory>,
    integrations: Integrations,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetail {
    #[serde(flatten)]
    video: PlaylistVideo,
    resources: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistDetail {
    #[serde(flatten)]
    playlist: PlaylistRecord,
    videos: Vec<VideoDetail>,
}

/// Read cache for the listing and detail endpoints, dropped whenever the
/// database reports a new data version.
struct ApiCache {
    playlists: RwLock<Option<Vec<PlaylistSummary>>>,
    details: RwLock<HashMap<String, Arc<PlaylistDetail>>>,
    last_db_version: RwLock<Option<i64>>,
}

impl ApiCache {
    fn new() -> Self {
        Self {
            playlists: RwLock::new(None),
            details: RwLock::new(HashMap::new()),
            last_db_version: RwLock::new(None),
        }
    }

    fn clear(&self) {
        self.playlists.write().take();
        self.details.write().clear();
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/runs", get(list_runs).post(start_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/playlists", get(list_playlists))
        .route(
            "/api/playlists/{id}",
            get(get_playlist).delete(delete_playlist),
        )
        .route("/api/playlists/{id}/rows", get(playlist_rows))
        .route("/api/playlists/{id}/export", post(export_playlist_sheet))
        .fallback(static_fallback)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");
    let args = ServerArgs::parse();
    let config = resolve_runtime_config(args.overrides())?;
    let host = parse_host_arg(&config.host)?;

    let store = open_store(&config).await.context("opening database")?;
    let settings = Arc::new(SettingsStore::load(&config.data_dir));
    let integrations = Integrations::from_config(&config);
    if !integrations.youtube || !integrations.quiz_platform {
        warn!("YouTube key or quiz session missing; runs will be rejected until configured");
    }

    let exporter = config.sheets.clone().map(|credentials| {
        Arc::new(move |pacing: &Pacing| -> Result<Arc<dyn SpreadsheetExporter>> {
            let client = SheetsClient::new(credentials.clone(), pacing.retry_policy())?;
            Ok(Arc::new(client) as Arc<dyn SpreadsheetExporter>)
        }) as ExporterFactory
    });
    let factory_config = config.clone();
    let services: ServiceFactory = Arc::new(move |settings: &RunSettings| {
        Services::from_config(&factory_config, &settings.pacing)
    });

    let state = AppState {
        store: store.clone(),
        cache: Arc::new(ApiCache::new()),
        www_root: Arc::new(config.www_root.clone()),
        settings: settings.clone(),
        runs: RunManager::new(store, settings, services),
        exporter,
        integrations,
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthPayload {
    status: &'static str,
    integrations: Integrations,
}

async fn health(State(state): State<AppState>) -> Json<HealthPayload> {
    Json(HealthPayload {
        status: "ok",
        integrations: state.integrations,
    })
}

async fn get_settings(State(state): State<AppState>) -> Json<RunSettings> {
    Json(state.settings.get())
}

async fn update_settings(
    State(state): State<AppState>,
    Json(payload): Json<RunSettings>,
) -> ApiResult<Json<RunSettings>> {
    payload
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let updated = state.settings.update(payload)?;
    Ok(Json(updated))
}

async fn start_run(
    State(state): State<AppState>,
    Json(payload): Json<RunRequest>,
) -> ApiResult<(StatusCode, Json<RunCreated>)> {
    let id = state.runs.start(payload)?;
    Ok((StatusCode::ACCEPTED, Json(RunCreated { id })))
}

async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunStatus>> {
    Json(state.runs.list())
}

async fn get_run(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<RunStatus>> {
    state
        .runs
        .get_status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("run not found"))
}

async fn cancel_run(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<RunStatus>> {
    state
        .runs
        .cancel(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("run not found"))
}

async fn list_playlists(State(state): State<AppState>) -> ApiResult<Json<Vec<PlaylistSummary>>> {
    Ok(Json(state.get_playlists().await?))
}

async fn get_playlist(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<PlaylistDetail>> {
    let detail = state.get_playlist_detail(&id).await?;
    Ok(Json((*detail).clone()))
}

async fn delete_playlist(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    if state.runs.is_active(&id) {
        return Err(ApiError::conflict("playlist has an active run"));
    }
    if state.store.delete_playlist(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("playlist not found"))
    }
}

async fn playlist_rows(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Vec<Vec<String>>>> {
    let detail = state.get_playlist_detail(&id).await?;
    let videos: Vec<PlaylistVideo> = detail.videos.iter().map(|v| v.video.clone()).collect();
    let resources: Vec<ResourceRecord> = detail
        .videos
        .iter()
        .flat_map(|v| v.resources.iter().cloned())
        .collect();
    Ok(Json(sheet_rows(&videos, &resources)))
}

async fn export_playlist_sheet(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ExportedSheet>> {
    let factory = state
        .exporter
        .clone()
        .ok_or_else(|| ApiError::bad_request("spreadsheet export is not configured"))?;
    if state.store.get_playlist(&id).await?.is_none() {
        return Err(ApiError::not_found("playlist not found"));
    }
    let exporter = factory(&state.settings.get().pacing)?;
    let exported = export_playlist(&state.store, exporter, &id).await?;
    Ok(Json(exported))
}

impl AppState {
    async fn ensure_fresh_cache(&self) -> ApiResult<()> {
        let version = self.store.data_version().await?;
        let mut last = self.cache.last_db_version.write();
        if let Some(previous) = *last
            && version != previous
        {
            self.cache.clear();
        }
        *last = Some(version);
        Ok(())
    }

    async fn get_playlists(&self) -> ApiResult<Vec<PlaylistSummary>> {
        self.ensure_fresh_cache().await?;
        if let Some(cached) = self.cache.playlists.read().clone() {
            return Ok(cached);
        }
        let playlists = self.store.list_playlists().await?;
        self.cache.playlists.write().replace(playlists.clone());
        Ok(playlists)
    }

    async fn get_playlist_detail(&self, playlist_id: &str) -> ApiResult<Arc<PlaylistDetail>> {
        self.ensure_fresh_cache().await?;
        if let Some(cached) = self.cache.details.read().get(playlist_id).cloned() {
            return Ok(cached);
        }

        let playlist = self
            .store
            .get_playlist(playlist_id)
            .await?
            .ok_or_else(|| ApiError::not_found("playlist not found"))?;
        let videos = self.store.playlist_videos(playlist_id).await?;
        let mut resources: HashMap<String, Vec<ResourceRecord>> = HashMap::new();
        for resource in self.store.playlist_resources(playlist_id).await? {
            resources
                .entry(resource.video_id.clone())
                .or_default()
                .push(resource);
        }
        let videos = videos
            .into_iter()
            .map(|video| VideoDetail {
                resources: resources.remove(&video.video_id).unwrap_or_default(),
                video,
            })
            .collect();

        let detail = Arc::new(PlaylistDetail { playlist, videos });
        self.cache
            .details
            .write()
            .insert(playlist_id.to_string(), detail.clone());
        Ok(detail)
    }
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes (no extension) get the page; missing assets get a 404.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use axum::body::to_bytes;
    use quiztube_tools::{
        pipeline::{PlaylistSource, QuizPlatform},
        quiz::{DraftStatus, PublishedQuiz, QuizOptions, ResourceKind},
        youtube::PlaylistSnapshot,
    };
    use serde_json::Value;
    use tempfile::tempdir;

    const PLAYLIST_ID: &str = "PLserverplaylist01";

    struct StaticPlaylist;

    impl PlaylistSource for StaticPlaylist {
        fn fetch_playlist(&self, playlist_id: &str) -> Result<PlaylistSnapshot> {
            Ok(PlaylistSnapshot {
                id: playlist_id.to_string(),
                title: "Chemistry".into(),
                channel_title: None,
                videos: vec![sample_video("v1", 0), sample_video("v2", 1)],
            })
        }
    }

    struct InstantQuiz;

    impl QuizPlatform for InstantQuiz {
        fn create(
            &self,
            kind: ResourceKind,
            video: &PlaylistVideo,
            _options: &QuizOptions,
        ) -> Result<String> {
            Ok(format!("{}-{kind}", video.video_id))
        }

        fn fetch_draft(&self, _quiz_id: &str) -> Result<DraftStatus> {
            Ok(DraftStatus::Ready { question_count: 5 })
        }

        fn publish(&self, quiz_id: &str) -> Result<PublishedQuiz> {
            Ok(PublishedQuiz {
                quiz_id: quiz_id.to_string(),
                share_url: format!("https://quiz.test/{quiz_id}"),
            })
        }
    }

    #[derive(Default)]
    struct CountingSheets {
        exports: Mutex<usize>,
    }

    impl SpreadsheetExporter for CountingSheets {
        fn export(&self, _title: &str, rows: &[Vec<String>]) -> Result<ExportedSheet> {
            let mut exports = self.exports.lock();
            *exports += 1;
            Ok(ExportedSheet {
                spreadsheet_id: format!("s{}", *exports),
                url: format!("https://sheets.test/{}/{}", *exports, rows.len()),
            })
        }
    }

    fn sample_video(id: &str, position: i64) -> PlaylistVideo {
        PlaylistVideo {
            video_id: id.into(),
            position,
            title: format!("Video {id}"),
            description: String::new(),
            channel_title: None,
            thumbnail_url: None,
            published_at: None,
            duration_seconds: Some(61),
        }
    }

    struct ServerTestContext {
        _temp: tempfile::TempDir,
        state: AppState,
        www_root: PathBuf,
        export_retries: Arc<Mutex<Vec<u32>>>,
    }

    impl ServerTestContext {
        async fn new(factory: ServiceFactory) -> Self {
            let temp = tempdir().unwrap();
            let store = Store::open_local(&temp.path().join("quiztube.db"))
                .await
                .unwrap();
            let settings = Arc::new(SettingsStore::load(temp.path()));
            let mut immediate = settings.get();
            immediate.pacing = Pacing::immediate();
            settings.update(immediate).unwrap();

            let www_root = temp.path().join("www");
            std::fs::create_dir_all(www_root.join("assets")).unwrap();
            std::fs::write(www_root.join("index.html"), "<html>quiz</html>").unwrap();
            std::fs::write(www_root.join("assets").join("app.js"), "console.log(1)").unwrap();

            let sheets = Arc::new(CountingSheets::default());
            let export_retries = Arc::new(Mutex::new(Vec::new()));
            let seen = export_retries.clone();
            let exporter: ExporterFactory =
                Arc::new(move |pacing: &Pacing| -> Result<Arc<dyn SpreadsheetExporter>> {
                    seen.lock().push(pacing.rate_limit_retries);
                    Ok(sheets.clone() as Arc<dyn SpreadsheetExporter>)
                });

            Self {
                state: AppState {
                    store: store.clone(),
                    cache: Arc::new(ApiCache::new()),
                    www_root: Arc::new(www_root.clone()),
                    settings: settings.clone(),
                    runs: RunManager::new(store, settings, factory),
                    exporter: Some(exporter),
                    integrations: Integrations {
                        youtube: true,
                        quiz_platform: true,
                        spreadsheet: true,
                    },
                },
                www_root,
                export_retries,
                _temp: temp,
            }
        }

        async fn with_fakes() -> Self {
            Self::new(Arc::new(|_settings: &RunSettings| -> Result<Services> {
                Ok(Services {
                    playlists: Arc::new(StaticPlaylist),
                    quiz: Arc::new(InstantQuiz),
                    sheets: Some(Arc::new(CountingSheets::default())),
                })
            }))
            .await
        }

        async fn wait_for_run(&self, id: &str) -> RunStatus {
            for _ in 0..500 {
                let status = self.state.runs.get_status(id).expect("run exists");
                if status.phase.is_terminal() {
                    return status;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("run {id} did not finish");
        }

        fn insert_active_job(&self, playlist_id: &str) -> String {
            let id = self.state.runs.next_job_id();
            self.state.runs.inner.jobs.lock().insert(
                id.clone(),
                RunJob {
                    id: id.clone(),
                    playlist_url: format!("https://www.youtube.com/playlist?list={playlist_id}"),
                    playlist_id: playlist_id.to_string(),
                    phase: RunPhase::Creating,
                    progress: 10,
                    message: "Creating".into(),
                    summary: None,
                    started_at: now_timestamp(),
                    finished_at: None,
                    cancel: Arc::new(AtomicBool::new(false)),
                },
            );
            id
        }
    }

    fn run_request() -> RunRequest {
        RunRequest {
            playlist_url: format!("https://www.youtube.com/playlist?list={PLAYLIST_ID}"),
            export: true,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn server_args_parse_overrides() {
        let args = ServerArgs::try_parse_from([
            "quizgen-server",
            "--port",
            "9000",
            "--host",
            "0.0.0.0",
            "--www-root",
            "/srv/www",
            "--database-url",
            "libsql://db.example",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.www_root, Some(PathBuf::from("/srv/www")));
        assert_eq!(overrides.database_url.as_deref(), Some("libsql://db.example"));
        assert!(ServerArgs::try_parse_from(["quizgen-server", "--port", "nope"]).is_err());
    }

    #[test]
    fn host_arg_must_be_ip() {
        assert!(parse_host_arg("127.0.0.1").is_ok());
        assert!(parse_host_arg("::1").is_ok());
        assert!(parse_host_arg("localhost").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_completes_and_is_listed() {
        let ctx = ServerTestContext::with_fakes().await;
        let (status, Json(created)) = start_run(State(ctx.state.clone()), Json(run_request()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let finished = ctx.wait_for_run(&created.id).await;
        assert_eq!(finished.phase, RunPhase::Completed, "{}", finished.message);
        let summary = finished.summary.expect("summary");
        assert_eq!(summary.published, 4);
        assert!(summary.spreadsheet_url.is_some());

        let Json(playlists) = list_playlists(State(ctx.state.clone())).await.unwrap();
        assert_eq!(playlists.len(), 1);
        assert_eq!(playlists[0].published_count, 4);

        let Json(detail) = get_playlist(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
            .await
            .unwrap();
        assert_eq!(detail.videos.len(), 2);
        assert_eq!(detail.videos[0].resources.len(), 2);

        let Json(rows) = playlist_rows(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][4], "https://quiz.test/v1-assessment");

        let Json(runs) = list_runs(State(ctx.state.clone())).await;
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn invalid_url_is_bad_request() {
        let ctx = ServerTestContext::with_fakes().await;
        let err = start_run(
            State(ctx.state.clone()),
            Json(RunRequest {
                playlist_url: "https://example.com".into(),
                export: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_credentials_reject_run() {
        let ctx = ServerTestContext::new(Arc::new(|_settings: &RunSettings| -> Result<Services> {
            bail!("YOUTUBE_API_KEY not set")
        }))
        .await;
        let err = ctx.state.runs.start(run_request()).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("YOUTUBE_API_KEY"));
        assert!(ctx.state.runs.list().is_empty());
    }

    #[tokio::test]
    async fn duplicate_active_run_conflicts() {
        let ctx = ServerTestContext::with_fakes().await;
        ctx.insert_active_job(PLAYLIST_ID);
        let err = ctx.state.runs.start(run_request()).unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = delete_playlist(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cancel_flags_active_run() {
        let ctx = ServerTestContext::with_fakes().await;
        let id = ctx.insert_active_job(PLAYLIST_ID);
        let Json(status) = cancel_run(State(ctx.state.clone()), AxumPath(id.clone()))
            .await
            .unwrap();
        assert_eq!(status.id, id);
        let jobs = ctx.state.runs.inner.jobs.lock();
        assert!(jobs[&id].cancel.load(Ordering::Relaxed));
        drop(jobs);

        let err = cancel_run(State(ctx.state.clone()), AxumPath("run-999".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn playlist_cache_refreshes_after_writes() {
        let ctx = ServerTestContext::with_fakes().await;
        let first = ctx.state.get_playlists().await.unwrap();
        assert!(first.is_empty());

        ctx.state
            .store
            .upsert_playlist(PLAYLIST_ID, "Chemistry", None, "u")
            .await
            .unwrap();
        let second = ctx.state.get_playlists().await.unwrap();
        assert_eq!(second.len(), 1);

        let Json(detail) = get_playlist(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
            .await
            .unwrap();
        assert!(detail.videos.is_empty());

        ctx.state
            .store
            .replace_playlist_videos(PLAYLIST_ID, &[sample_video("v1", 0)])
            .await
            .unwrap();
        let refreshed = ctx.state.get_playlist_detail(PLAYLIST_ID).await.unwrap();
        assert_eq!(refreshed.videos.len(), 1);

        let status = delete_playlist(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = get_playlist(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn export_endpoint_requires_playlist_and_exporter() {
        let mut ctx = ServerTestContext::with_fakes().await;
        let err = export_playlist_sheet(State(ctx.state.clone()), AxumPath("missing".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        ctx.state
            .store
            .upsert_playlist(PLAYLIST_ID, "Chemistry", None, "u")
            .await
            .unwrap();
        let Json(exported) =
            export_playlist_sheet(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
                .await
                .unwrap();
        assert_eq!(exported.url, "https://sheets.test/1/1");
        let stored = ctx.state.store.get_playlist(PLAYLIST_ID).await.unwrap().unwrap();
        assert_eq!(stored.spreadsheet_url.as_deref(), Some("https://sheets.test/1/1"));

        ctx.state.exporter = None;
        let err = export_playlist_sheet(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn export_uses_current_retry_settings() {
        let ctx = ServerTestContext::with_fakes().await;
        ctx.state
            .store
            .upsert_playlist(PLAYLIST_ID, "Chemistry", None, "u")
            .await
            .unwrap();

        let mut settings = ctx.state.settings.get();
        settings.pacing.rate_limit_retries = 7;
        update_settings(State(ctx.state.clone()), Json(settings))
            .await
            .unwrap();
        export_playlist_sheet(State(ctx.state.clone()), AxumPath(PLAYLIST_ID.into()))
            .await
            .unwrap();

        assert_eq!(*ctx.export_retries.lock(), vec![7]);
    }

    #[test]
    fn bundled_page_accepts_bare_playlist_ids() {
        let page = include_str!("../../www/index.html");
        assert!(page.contains(r#"<input type="text" id="playlist-url""#));
        assert!(!page.contains(r#"type="url""#));
    }

    #[tokio::test]
    async fn finished_runs_are_pruned_oldest_first() {
        let ctx = ServerTestContext::with_fakes().await;
        let active = ctx.insert_active_job("PLstillrunning001");
        let mut finished = Vec::new();
        for index in 0..5 {
            let id = ctx.insert_active_job(&format!("PLfinished{index:08}"));
            ctx.state.runs.inner.jobs.lock().get_mut(&id).unwrap().phase = RunPhase::Completed;
            finished.push(id);
        }

        let mut jobs = ctx.state.runs.inner.jobs.lock();
        prune_finished(&mut jobs, 2);
        assert_eq!(jobs.len(), 3);
        assert!(jobs.contains_key(&active));
        assert!(jobs.contains_key(&finished[3]));
        assert!(jobs.contains_key(&finished[4]));
        assert!(!jobs.contains_key(&finished[0]));
    }

    #[tokio::test]
    async fn settings_update_validates() {
        let ctx = ServerTestContext::with_fakes().await;
        let Json(mut settings) = get_settings(State(ctx.state.clone())).await;
        settings.quiz.question_count = 0;
        let err = update_settings(State(ctx.state.clone()), Json(settings.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        settings.quiz.question_count = 20;
        let Json(updated) = update_settings(State(ctx.state.clone()), Json(settings))
            .await
            .unwrap();
        assert_eq!(updated.quiz.question_count, 20);
        assert_eq!(ctx.state.settings.get().quiz.question_count, 20);
    }

    #[tokio::test]
    async fn health_reports_integrations() {
        let ctx = ServerTestContext::with_fakes().await;
        let Json(payload) = health(State(ctx.state.clone())).await;
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["integrations"]["quizPlatform"], true);
    }

    #[tokio::test]
    async fn static_files_and_spa_fallback() {
        let ctx = ServerTestContext::with_fakes().await;

        let index = serve_www_path(&ctx.www_root, "/").await.unwrap();
        assert_eq!(
            index.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
        let js = serve_www_path(&ctx.www_root, "/assets/app.js").await.unwrap();
        let bytes = to_bytes(js.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"console.log(1)");

        let spa = serve_www_path(&ctx.www_root, "/playlists/PL123").await.unwrap();
        let bytes = to_bytes(spa.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"<html>quiz</html>");

        let missing = serve_www_path(&ctx.www_root, "/assets/missing.css")
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert!(resolve_www_path(&ctx.www_root, "/../secret").is_err());
    }

    #[tokio::test]
    async fn unknown_api_routes_return_json_404() {
        let ctx = ServerTestContext::with_fakes().await;
        let request = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let response = static_fallback(State(ctx.state.clone()), request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "endpoint not found");
    }
}
