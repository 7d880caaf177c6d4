//! Persistence for playlists, their videos and the quiz resources generated
//! for them.
//!
//! The `resources` table doubles as the creation cache: resources are keyed by
//! `(video_id, kind)` so a video that shows up again (same playlist re-run or a
//! different playlist) reuses whatever was already generated for it.

use std::{
    fmt,
    path::Path,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};
use tokio::sync::Mutex;
use serde::{Deserialize, Serialize};

use crate::quiz::ResourceKind;
use crate::youtube::PlaylistVideo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistRecord {
    pub playlist_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_title: Option<String>,
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spreadsheet_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Listing row: the playlist plus cheap aggregate counts for the overview page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSummary {
    #[serde(flatten)]
    pub playlist: PlaylistRecord,
    pub video_count: i64,
    pub published_count: i64,
    pub failed_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Created,
    Processing,
    Ready,
    Published,
    Failed,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "created" => Ok(Self::Created),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown resource status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub video_id: String,
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiz_id: Option<String>,
    pub status: ResourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: String,
}

impl ResourceRecord {
    pub fn new(video_id: &str, kind: ResourceKind, status: ResourceStatus) -> Self {
        Self {
            video_id: video_id.to_string(),
            kind,
            quiz_id: None,
            status,
            share_url: None,
            question_count: None,
            error: None,
            updated_at: now_timestamp(),
        }
    }

    pub fn failed(video_id: &str, kind: ResourceKind, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(video_id, kind, ResourceStatus::Failed)
        }
    }
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

async fn configure_local_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS playlists (
            playlist_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            channel_title TEXT,
            source_url TEXT NOT NULL,
            spreadsheet_url TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            playlist_id TEXT NOT NULL,
            video_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            title TEXT NOT NULL,
            description TEXT DEFAULT '',
            channel_title TEXT,
            thumbnail_url TEXT,
            published_at TEXT,
            duration_seconds INTEGER,
            PRIMARY KEY (playlist_id, video_id)
        );

        CREATE TABLE IF NOT EXISTS resources (
            video_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            quiz_id TEXT,
            status TEXT NOT NULL,
            share_url TEXT,
            question_count INTEGER,
            error TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (video_id, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_videos_video_id ON videos(video_id);
        "#,
    )
    .await?;
    Ok(())
}

/// Handle to the libSQL database, either a local file or a hosted instance.
#[derive(Clone)]
pub struct Store {
    /// One statement or transaction at a time; clones share the connection.
    conn: Arc<Mutex<Connection>>,
    remote: bool,
    writes: Arc<AtomicI64>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (and if necessary creates) the local database file.
    pub async fn open_local(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        let conn = db.connect()?;
        configure_local_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            remote: false,
            writes: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Connects to a hosted libSQL database over HTTP.
    pub async fn open_remote(url: &str, auth_token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await
            .with_context(|| format!("connecting to hosted database {url}"))?;
        let conn = db.connect()?;
        ensure_schema(&conn)
            .await
            .context("creating schema on hosted database")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            remote: true,
            writes: Arc::new(AtomicI64::new(0)),
        })
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Changes whenever this process writes or, for local files, whenever
    /// another connection commits. Used to invalidate read caches.
    pub async fn data_version(&self) -> Result<i64> {
        let local_writes = self.writes.load(Ordering::Relaxed);
        if self.remote {
            return Ok(local_writes);
        }
        let conn = self.conn.lock().await;
        let mut rows = conn.query("PRAGMA data_version", params![]).await?;
        let row = rows.next().await?.context("missing data_version row")?;
        let external: i64 = row.get(0)?;
        Ok(external + local_writes)
    }

    /// Inserts or refreshes a playlist. The creation time and any exported
    /// spreadsheet URL survive re-runs.
    pub async fn upsert_playlist(
        &self,
        playlist_id: &str,
        title: &str,
        channel_title: Option<&str>,
        source_url: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO playlists (
                playlist_id, title, channel_title, source_url, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(playlist_id) DO UPDATE SET
                title = excluded.title,
                channel_title = excluded.channel_title,
                source_url = excluded.source_url,
                updated_at = excluded.updated_at
            "#,
            params![playlist_id, title, channel_title, source_url, now],
        )
        .await
        .with_context(|| format!("saving playlist {playlist_id}"))?;
        self.bump();
        Ok(())
    }

    /// Replaces the stored video list in one transaction so removed videos do
    /// not linger next to the new order.
    pub async fn replace_playlist_videos(
        &self,
        playlist_id: &str,
        videos: &[PlaylistVideo],
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await?;
        tx.execute(
            "DELETE FROM videos WHERE playlist_id = ?1",
            params![playlist_id],
        )
        .await?;

        for video in videos {
            tx.execute(
                r#"
                INSERT INTO videos (
                    playlist_id, video_id, position, title, description,
                    channel_title, thumbnail_url, published_at, duration_seconds
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    playlist_id,
                    video.video_id.as_str(),
                    video.position,
                    video.title.as_str(),
                    video.description.as_str(),
                    video.channel_title.as_deref(),
                    video.thumbnail_url.as_deref(),
                    video.published_at.as_deref(),
                    video.duration_seconds,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        self.bump();
        Ok(())
    }

    pub async fn upsert_resource(&self, record: &ResourceRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO resources (
                video_id, kind, quiz_id, status, share_url,
                question_count, error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(video_id, kind) DO UPDATE SET
                quiz_id = excluded.quiz_id,
                status = excluded.status,
                share_url = excluded.share_url,
                question_count = excluded.question_count,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
            params![
                record.video_id.as_str(),
                record.kind.as_str(),
                record.quiz_id.as_deref(),
                record.status.as_str(),
                record.share_url.as_deref(),
                record.question_count,
                record.error.as_deref(),
                record.updated_at.as_str(),
            ],
        )
        .await
        .with_context(|| format!("saving {} for {}", record.kind, record.video_id))?;
        self.bump();
        Ok(())
    }

    pub async fn cached_resource(
        &self,
        video_id: &str,
        kind: ResourceKind,
    ) -> Result<Option<ResourceRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT video_id, kind, quiz_id, status, share_url,
                       question_count, error, updated_at
                FROM resources
                WHERE video_id = ?1 AND kind = ?2
                "#,
                params![video_id, kind.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_resource(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn set_spreadsheet_url(&self, playlist_id: &str, url: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE playlists SET spreadsheet_url = ?2, updated_at = ?3 WHERE playlist_id = ?1",
                params![playlist_id, url, now_timestamp()],
            )
            .await?;
        if changed == 0 {
            return Err(anyhow!("playlist not found: {playlist_id}"));
        }
        self.bump();
        Ok(())
    }

    pub async fn list_playlists(&self) -> Result<Vec<PlaylistSummary>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT p.playlist_id, p.title, p.channel_title, p.source_url,
                       p.spreadsheet_url, p.created_at, p.updated_at,
                       (SELECT COUNT(*) FROM videos v WHERE v.playlist_id = p.playlist_id),
                       (SELECT COUNT(*) FROM resources r
                          JOIN videos v ON v.video_id = r.video_id
                         WHERE v.playlist_id = p.playlist_id AND r.status = 'published'),
                       (SELECT COUNT(*) FROM resources r
                          JOIN videos v ON v.video_id = r.video_id
                         WHERE v.playlist_id = p.playlist_id AND r.status = 'failed')
                FROM playlists p
                ORDER BY p.updated_at DESC, p.rowid DESC
                "#,
                params![],
            )
            .await?;

        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await? {
            summaries.push(PlaylistSummary {
                playlist: row_to_playlist(&row)?,
                video_count: row.get(7)?,
                published_count: row.get(8)?,
                failed_count: row.get(9)?,
            });
        }
        Ok(summaries)
    }

    pub async fn get_playlist(&self, playlist_id: &str) -> Result<Option<PlaylistRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT playlist_id, title, channel_title, source_url,
                       spreadsheet_url, created_at, updated_at
                FROM playlists
                WHERE playlist_id = ?1
                "#,
                params![playlist_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_playlist(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn playlist_videos(&self, playlist_id: &str) -> Result<Vec<PlaylistVideo>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT video_id, position, title, description, channel_title,
                       thumbnail_url, published_at, duration_seconds
                FROM videos
                WHERE playlist_id = ?1
                ORDER BY position ASC
                "#,
                params![playlist_id],
            )
            .await?;

        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(PlaylistVideo {
                video_id: row.get(0)?,
                position: row.get(1)?,
                title: row.get(2)?,
                description: row.get::<Option<String>>(3)?.unwrap_or_default(),
                channel_title: row.get(4)?,
                thumbnail_url: row.get(5)?,
                published_at: row.get(6)?,
                duration_seconds: row.get(7)?,
            });
        }
        Ok(videos)
    }

    /// Every cached resource attached to one of the playlist's videos, in
    /// playlist order.
    pub async fn playlist_resources(&self, playlist_id: &str) -> Result<Vec<ResourceRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT r.video_id, r.kind, r.quiz_id, r.status, r.share_url,
                       r.question_count, r.error, r.updated_at
                FROM resources r
                JOIN videos v ON v.video_id = r.video_id
                WHERE v.playlist_id = ?1
                ORDER BY v.position ASC, r.kind ASC
                "#,
                params![playlist_id],
            )
            .await?;

        let mut resources = Vec::new();
        while let Some(row) = rows.next().await? {
            resources.push(row_to_resource(&row)?);
        }
        Ok(resources)
    }

    /// Drops the playlist and its video list. Resources stay because other
    /// playlists may share the same videos.
    pub async fn delete_playlist(&self, playlist_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await?;
        tx.execute(
            "DELETE FROM videos WHERE playlist_id = ?1",
            params![playlist_id],
        )
        .await?;
        let removed = tx
            .execute(
                "DELETE FROM playlists WHERE playlist_id = ?1",
                params![playlist_id],
            )
            .await?;
        tx.commit().await?;
        self.bump();
        Ok(removed > 0)
    }
}

// Column order must match the SELECT statements above.
fn row_to_playlist(row: &Row) -> Result<PlaylistRecord> {
    Ok(PlaylistRecord {
        playlist_id: row.get(0)?,
        title: row.get(1)?,
        channel_title: row.get(2)?,
        source_url: row.get(3)?,
        spreadsheet_url: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_resource(row: &Row) -> Result<ResourceRecord> {
    let kind: String = row.get(1)?;
    let status: String = row.get(3)?;
    Ok(ResourceRecord {
        video_id: row.get(0)?,
        kind: kind.parse()?,
        quiz_id: row.get(2)?,
        status: status.parse()?,
        share_url: row.get(4)?,
        question_count: row.get(5)?,
        error: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
