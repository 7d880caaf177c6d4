#![forbid(unsafe_code)]

//! The playlist workflow: fetch the playlist, create every quiz resource,
//! give the platform time to generate them, collect the drafts, publish,
//! persist and export.
//!
//! Steps run strictly one after another with fixed pauses between quiz
//! platform calls. The external clients are blocking, so each call is pushed
//! onto `spawn_blocking`; the store is async and called directly.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::quiz::{DraftStatus, PublishedQuiz, QuizClient, QuizOptions, ResourceKind};
use crate::settings::{Pacing, RunSettings};
use crate::sheets::{ExportedSheet, SheetsClient, sheet_rows, sheet_title};
use crate::store::{ResourceRecord, ResourceStatus, Store, now_timestamp};
use crate::youtube::{
    PlaylistSnapshot, PlaylistVideo, YoutubeClient, parse_playlist_url, playlist_url,
};

const CANCEL_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const CANCELLED_MESSAGE: &str = "cancelled";

pub trait PlaylistSource: Send + Sync {
    fn fetch_playlist(&self, playlist_id: &str) -> Result<PlaylistSnapshot>;
}

pub trait QuizPlatform: Send + Sync {
    fn create(
        &self,
        kind: ResourceKind,
        video: &PlaylistVideo,
        options: &QuizOptions,
    ) -> Result<String>;
    fn fetch_draft(&self, quiz_id: &str) -> Result<DraftStatus>;
    fn publish(&self, quiz_id: &str) -> Result<PublishedQuiz>;
}

pub trait SpreadsheetExporter: Send + Sync {
    fn export(&self, title: &str, rows: &[Vec<String>]) -> Result<ExportedSheet>;
}

impl PlaylistSource for YoutubeClient {
    fn fetch_playlist(&self, playlist_id: &str) -> Result<PlaylistSnapshot> {
        YoutubeClient::fetch_playlist(self, playlist_id)
    }
}

impl QuizPlatform for QuizClient {
    fn create(
        &self,
        kind: ResourceKind,
        video: &PlaylistVideo,
        options: &QuizOptions,
    ) -> Result<String> {
        QuizClient::create(self, kind, video, options)
    }

    fn fetch_draft(&self, quiz_id: &str) -> Result<DraftStatus> {
        QuizClient::fetch_draft(self, quiz_id)
    }

    fn publish(&self, quiz_id: &str) -> Result<PublishedQuiz> {
        QuizClient::publish(self, quiz_id)
    }
}

impl SpreadsheetExporter for SheetsClient {
    fn export(&self, title: &str, rows: &[Vec<String>]) -> Result<ExportedSheet> {
        SheetsClient::export(self, title, rows)
    }
}

/// The external services one run talks to.
#[derive(Clone)]
pub struct Services {
    pub playlists: Arc<dyn PlaylistSource>,
    pub quiz: Arc<dyn QuizPlatform>,
    pub sheets: Option<Arc<dyn SpreadsheetExporter>>,
}

impl Services {
    /// Builds the real clients. Fails when YouTube or quiz credentials are
    /// missing; Sheets is optional and simply disables export.
    pub fn from_config(config: &RuntimeConfig, pacing: &Pacing) -> Result<Self> {
        let youtube = YoutubeClient::new(config.require_youtube_key()?.clone())?;
        let quiz = QuizClient::new(config.require_quiz()?.clone(), pacing.retry_policy())?;
        let sheets = match &config.sheets {
            Some(credentials) => Some(Arc::new(SheetsClient::new(
                credentials.clone(),
                pacing.retry_policy(),
            )?) as Arc<dyn SpreadsheetExporter>),
            None => None,
        };
        Ok(Self {
            playlists: Arc::new(youtube),
            quiz: Arc::new(quiz),
            sheets,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    FetchingPlaylist,
    Creating,
    Waiting,
    Collecting,
    Publishing,
    Exporting,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Receives status updates while a run progresses. The server keeps them in
/// memory for polling; the CLI logs them.
pub trait ProgressSink: Send + Sync {
    fn report(&self, phase: RunPhase, progress: u8, message: &str);

    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub playlist_url: String,
    #[serde(default = "default_export")]
    pub export: bool,
}

fn default_export() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub playlist_id: String,
    pub title: String,
    pub videos: usize,
    pub published: usize,
    pub failed: usize,
    pub pending: usize,
    pub reused: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spreadsheet_url: Option<String>,
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("external call panicked")?
}

fn ensure_not_cancelled(progress: &dyn ProgressSink) -> Result<()> {
    if progress.is_cancelled() {
        bail!(CANCELLED_MESSAGE);
    }
    Ok(())
}

/// Sleeps in short slices so a cancel request does not wait out a long pause.
async fn pause(duration: Duration, progress: &dyn ProgressSink) -> Result<()> {
    let mut remaining = duration;
    while !remaining.is_zero() {
        ensure_not_cancelled(progress)?;
        let slice = remaining.min(CANCEL_CHECK_INTERVAL);
        tokio::time::sleep(slice).await;
        remaining -= slice;
    }
    ensure_not_cancelled(progress)
}

fn scaled(start: u8, span: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return start + span;
    }
    let done = done.min(total);
    start + ((span as usize * done) / total) as u8
}

fn error_text(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

/// Runs the full workflow for one playlist. Per-resource failures are stored
/// and counted; only playlist lookup, persistence and export abort the run.
pub async fn run_playlist(
    request: &RunRequest,
    services: &Services,
    store: &Store,
    settings: &RunSettings,
    progress: &dyn ProgressSink,
) -> Result<RunSummary> {
    let pacing = &settings.pacing;
    let kinds = settings.quiz.enabled_kinds();
    if kinds.is_empty() {
        bail!("no resource kinds enabled");
    }

    progress.report(RunPhase::FetchingPlaylist, 0, "Fetching playlist");
    let playlist_ref = parse_playlist_url(&request.playlist_url)?;
    let playlist_id = playlist_ref.id.clone();
    let source = services.playlists.clone();
    let snapshot = blocking(move || source.fetch_playlist(&playlist_ref.id)).await?;
    store
        .upsert_playlist(
            &snapshot.id,
            &snapshot.title,
            snapshot.channel_title.as_deref(),
            &playlist_url(&snapshot.id),
        )
        .await?;
    store
        .replace_playlist_videos(&snapshot.id, &snapshot.videos)
        .await?;
    info!(
        playlist_id = playlist_id.as_str(),
        videos = snapshot.videos.len(),
        "playlist stored"
    );
    progress.report(
        RunPhase::FetchingPlaylist,
        5,
        &format!("Found {} videos", snapshot.videos.len()),
    );

    // Creation
    let total = snapshot.videos.len() * kinds.len();
    let mut records: Vec<ResourceRecord> = Vec::with_capacity(total);
    let mut reused = 0;
    let mut created_any = false;
    let mut called_platform = false;
    for (index, (video, kind)) in snapshot
        .videos
        .iter()
        .flat_map(|video| kinds.iter().copied().map(move |kind| (video, kind)))
        .enumerate()
    {
        ensure_not_cancelled(progress)?;
        let cached = store.cached_resource(&video.video_id, kind).await?;
        let record = match cached {
            Some(record) if record.status == ResourceStatus::Published => {
                reused += 1;
                record
            }
            Some(record) if record.status != ResourceStatus::Failed && record.quiz_id.is_some() => {
                reused += 1;
                record
            }
            _ => {
                if called_platform {
                    pause(pacing.step_gap(), progress).await?;
                }
                called_platform = true;
                let quiz = services.quiz.clone();
                let options = settings.quiz.clone();
                let target = video.clone();
                let outcome = blocking(move || quiz.create(kind, &target, &options)).await;
                let record = match outcome {
                    Ok(quiz_id) => {
                        created_any = true;
                        ResourceRecord {
                            quiz_id: Some(quiz_id),
                            ..ResourceRecord::new(&video.video_id, kind, ResourceStatus::Created)
                        }
                    }
                    Err(err) => {
                        warn!(video_id = video.video_id.as_str(), %kind, "create failed: {err:#}");
                        ResourceRecord::failed(&video.video_id, kind, error_text(&err))
                    }
                };
                store.upsert_resource(&record).await?;
                record
            }
        };
        records.push(record);
        progress.report(
            RunPhase::Creating,
            scaled(5, 35, index + 1, total),
            &format!("Created {} of {total} resources", index + 1),
        );
    }

    // Waiting
    if created_any {
        progress.report(
            RunPhase::Waiting,
            40,
            &format!(
                "Waiting {}s for the platform to generate content",
                pacing.processing_wait_secs
            ),
        );
        pause(pacing.processing_wait(), progress).await?;
    }
    progress.report(RunPhase::Collecting, 50, "Collecting generated content");

    // Collecting
    let to_collect: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, record)| {
            matches!(
                record.status,
                ResourceStatus::Created | ResourceStatus::Processing
            )
        })
        .map(|(index, _)| index)
        .collect();
    for (done, &index) in to_collect.iter().enumerate() {
        if done > 0 {
            pause(pacing.step_gap(), progress).await?;
        }
        let record = &mut records[index];
        collect_draft(record, services, pacing, progress).await?;
        record.updated_at = now_timestamp();
        store.upsert_resource(record).await?;
        progress.report(
            RunPhase::Collecting,
            scaled(50, 25, done + 1, to_collect.len()),
            &format!("Collected {} of {}", done + 1, to_collect.len()),
        );
    }

    // Publishing
    let to_publish: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, record)| record.status == ResourceStatus::Ready)
        .map(|(index, _)| index)
        .collect();
    for (done, &index) in to_publish.iter().enumerate() {
        if done > 0 {
            pause(pacing.step_gap(), progress).await?;
        }
        let record = &mut records[index];
        let Some(quiz_id) = record.quiz_id.clone() else {
            continue;
        };
        let quiz = services.quiz.clone();
        match blocking(move || quiz.publish(&quiz_id)).await {
            Ok(published) => {
                record.status = ResourceStatus::Published;
                record.share_url = Some(published.share_url);
                record.error = None;
            }
            Err(err) => {
                warn!(
                    video_id = record.video_id.as_str(),
                    kind = %record.kind,
                    "publish failed: {err:#}"
                );
                record.status = ResourceStatus::Failed;
                record.error = Some(error_text(&err));
            }
        }
        record.updated_at = now_timestamp();
        store.upsert_resource(record).await?;
        progress.report(
            RunPhase::Publishing,
            scaled(75, 15, done + 1, to_publish.len()),
            &format!("Published {} of {}", done + 1, to_publish.len()),
        );
    }

    // Exporting
    let mut spreadsheet_url = None;
    if request.export {
        match &services.sheets {
            Some(exporter) => {
                ensure_not_cancelled(progress)?;
                progress.report(RunPhase::Exporting, 90, "Exporting spreadsheet");
                let exported = export_playlist(store, exporter.clone(), &snapshot.id).await?;
                spreadsheet_url = Some(exported.url);
            }
            None => info!(
                playlist_id = playlist_id.as_str(),
                "spreadsheet export not configured, skipping"
            ),
        }
    }

    let count = |status: ResourceStatus| {
        records
            .iter()
            .filter(|record| record.status == status)
            .count()
    };
    let published = count(ResourceStatus::Published);
    let failed = count(ResourceStatus::Failed);
    let summary = RunSummary {
        playlist_id: snapshot.id.clone(),
        title: snapshot.title.clone(),
        videos: snapshot.videos.len(),
        published,
        failed,
        pending: records.len() - published - failed,
        reused,
        spreadsheet_url,
    };
    info!(
        playlist_id = summary.playlist_id.as_str(),
        published = summary.published,
        failed = summary.failed,
        pending = summary.pending,
        "run finished"
    );
    progress.report(
        RunPhase::Completed,
        100,
        &format!(
            "Published {} of {} resources",
            summary.published,
            records.len()
        ),
    );
    Ok(summary)
}

/// Polls one draft until it is ready, failed, or the poll budget runs out.
/// A draft that is still processing keeps its quiz id so a later run can
/// pick it up again.
async fn collect_draft(
    record: &mut ResourceRecord,
    services: &Services,
    pacing: &Pacing,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let Some(quiz_id) = record.quiz_id.clone() else {
        record.status = ResourceStatus::Failed;
        record.error = Some("resource has no quiz id".to_string());
        return Ok(());
    };

    for attempt in 0..pacing.poll_attempts {
        if attempt > 0 {
            pause(pacing.poll_interval(), progress).await?;
        }
        let quiz = services.quiz.clone();
        let id = quiz_id.clone();
        match blocking(move || quiz.fetch_draft(&id)).await {
            Ok(DraftStatus::Processing) => {
                record.status = ResourceStatus::Processing;
            }
            Ok(DraftStatus::Ready { question_count }) => {
                record.status = ResourceStatus::Ready;
                record.question_count = Some(question_count);
                record.error = None;
                return Ok(());
            }
            Ok(DraftStatus::Failed { reason }) => {
                record.status = ResourceStatus::Failed;
                record.error = Some(reason);
                return Ok(());
            }
            Err(err) => {
                warn!(quiz_id = quiz_id.as_str(), "draft fetch failed: {err:#}");
                record.status = ResourceStatus::Failed;
                record.error = Some(error_text(&err));
                return Ok(());
            }
        }
    }

    record.status = ResourceStatus::Processing;
    record.error = Some(format!(
        "still processing after {} polls",
        pacing.poll_attempts
    ));
    Ok(())
}

/// Builds the sheet from stored data and exports it, remembering the URL on
/// the playlist.
pub async fn export_playlist(
    store: &Store,
    exporter: Arc<dyn SpreadsheetExporter>,
    playlist_id: &str,
) -> Result<ExportedSheet> {
    let playlist = store
        .get_playlist(playlist_id)
        .await?
        .ok_or_else(|| anyhow!("playlist not found: {playlist_id}"))?;
    let videos = store.playlist_videos(playlist_id).await?;
    let resources = store.playlist_resources(playlist_id).await?;
    let rows = sheet_rows(&videos, &resources);
    let title = sheet_title(&playlist);

    let exported = blocking(move || exporter.export(&title, &rows))
        .await
        .context("exporting spreadsheet")?;
    store.set_spreadsheet_url(playlist_id, &exported.url).await?;
    Ok(exported)
}
