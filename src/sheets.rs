#![forbid(unsafe_code)]

//! Spreadsheet export: turns a processed playlist into rows and pushes them to
//! a new Google Sheet, optionally shared with anyone holding the link.

use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::SheetsCredentials;
use crate::http::{self, RetryPolicy};
use crate::quiz::ResourceKind;
use crate::store::{PlaylistRecord, ResourceRecord, ResourceStatus};
use crate::youtube::{PlaylistVideo, watch_url};

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SHEET_NAME: &str = "Sheet1";

pub const HEADER: [&str; 7] = [
    "Position",
    "Video title",
    "Video URL",
    "Duration",
    "Assessment link",
    "Interactive video link",
    "Status",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSheet {
    pub spreadsheet_id: String,
    pub url: String,
}

pub fn sheet_title(playlist: &PlaylistRecord) -> String {
    format!("{} - quizzes", playlist.title)
}

fn format_duration(seconds: Option<i64>) -> String {
    let Some(seconds) = seconds.filter(|value| *value >= 0) else {
        return String::new();
    };
    let (hours, minutes, secs) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

fn row_status(resources: &[&ResourceRecord]) -> String {
    if resources.is_empty() {
        return "pending".to_string();
    }
    if let Some(failed) = resources
        .iter()
        .find(|resource| resource.status == ResourceStatus::Failed)
    {
        return format!(
            "failed: {}",
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }
    let published = resources
        .iter()
        .filter(|resource| resource.status == ResourceStatus::Published)
        .count();
    if published == resources.len() {
        "published".to_string()
    } else if published > 0 {
        "partial".to_string()
    } else {
        "pending".to_string()
    }
}

/// Header plus one row per video in playlist order.
pub fn sheet_rows(videos: &[PlaylistVideo], resources: &[ResourceRecord]) -> Vec<Vec<String>> {
    let mut by_video: HashMap<&str, Vec<&ResourceRecord>> = HashMap::new();
    for resource in resources {
        by_video
            .entry(resource.video_id.as_str())
            .or_default()
            .push(resource);
    }

    let mut ordered: Vec<&PlaylistVideo> = videos.iter().collect();
    ordered.sort_by_key(|video| video.position);

    let mut rows = Vec::with_capacity(ordered.len() + 1);
    rows.push(HEADER.iter().map(|cell| cell.to_string()).collect());
    for video in ordered {
        let attached = by_video
            .get(video.video_id.as_str())
            .cloned()
            .unwrap_or_default();
        let link = |kind: ResourceKind| {
            attached
                .iter()
                .find(|resource| {
                    resource.kind == kind && resource.status == ResourceStatus::Published
                })
                .and_then(|resource| resource.share_url.clone())
                .unwrap_or_default()
        };
        rows.push(vec![
            (video.position + 1).to_string(),
            video.title.clone(),
            watch_url(&video.video_id),
            format_duration(video.duration_seconds),
            link(ResourceKind::Assessment),
            link(ResourceKind::InteractiveVideo),
            row_status(&attached),
        ]);
    }
    rows
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSpreadsheet {
    spreadsheet_id: String,
    spreadsheet_url: Option<String>,
}

pub struct SheetsClient {
    agent: ureq::Agent,
    credentials: SheetsCredentials,
    retry: RetryPolicy,
    sheets_base: String,
    drive_base: String,
}

impl SheetsClient {
    pub fn new(credentials: SheetsCredentials, retry: RetryPolicy) -> Result<Self> {
        Self::with_endpoints(credentials, retry, SHEETS_API_BASE, DRIVE_API_BASE)
    }

    pub fn with_endpoints(
        credentials: SheetsCredentials,
        retry: RetryPolicy,
        sheets_base: impl Into<String>,
        drive_base: impl Into<String>,
    ) -> Result<Self> {
        if credentials.access_token.expose().trim().is_empty() {
            bail!("Sheets access token is empty");
        }
        Ok(Self {
            agent: http::agent(REQUEST_TIMEOUT),
            credentials,
            retry,
            sheets_base: sheets_base.into(),
            drive_base: drive_base.into(),
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.credentials.access_token.expose())
    }

    /// Creates a spreadsheet, writes `rows` starting at A1 and shares it.
    pub fn export(&self, title: &str, rows: &[Vec<String>]) -> Result<ExportedSheet> {
        let created: CreatedSpreadsheet = http::with_rate_limit_retry(
            self.retry,
            "sheets.create",
            std::thread::sleep,
            || {
                http::call_json(
                    self.agent
                        .post(&format!("{}/spreadsheets", self.sheets_base))
                        .set("Authorization", &self.bearer())
                        .send_json(json!({
                            "properties": { "title": title },
                            "sheets": [{ "properties": { "title": SHEET_NAME } }],
                        })),
                )
            },
        )
        .context("creating spreadsheet")?;

        let range = format!("{SHEET_NAME}!A1");
        let _: serde_json::Value = http::with_rate_limit_retry(
            self.retry,
            "sheets.values",
            std::thread::sleep,
            || {
                http::call_json(
                    self.agent
                        .put(&format!(
                            "{}/spreadsheets/{}/values/{}",
                            self.sheets_base, created.spreadsheet_id, range
                        ))
                        .query("valueInputOption", "RAW")
                        .set("Authorization", &self.bearer())
                        .send_json(json!({
                            "range": range,
                            "majorDimension": "ROWS",
                            "values": rows,
                        })),
                )
            },
        )
        .context("writing spreadsheet rows")?;

        if self.credentials.share_public {
            let _: serde_json::Value = http::with_rate_limit_retry(
                self.retry,
                "drive.permissions",
                std::thread::sleep,
                || {
                    http::call_json(
                        self.agent
                            .post(&format!(
                                "{}/files/{}/permissions",
                                self.drive_base, created.spreadsheet_id
                            ))
                            .set("Authorization", &self.bearer())
                            .send_json(json!({ "role": "reader", "type": "anyone" })),
                    )
                },
            )
            .context("sharing spreadsheet")?;
        }

        let url = created.spreadsheet_url.unwrap_or_else(|| {
            format!(
                "https://docs.google.com/spreadsheets/d/{}/edit",
                created.spreadsheet_id
            )
        });
        info!(
            spreadsheet_id = created.spreadsheet_id.as_str(),
            rows = rows.len(),
            "exported spreadsheet"
        );
        Ok(ExportedSheet {
            spreadsheet_id: created.spreadsheet_id,
            url,
        })
    }
}
