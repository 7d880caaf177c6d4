#![forbid(unsafe_code)]

//! Typed wrapper around the parts of the YouTube Data API v3 the pipeline
//! needs: playlist title, playlist items and per-video durations.

use std::{collections::HashSet, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize, de::IgnoredAny};
use tracing::{debug, info};
use url::Url;

use crate::config::Secret;
use crate::http::{self, HttpError};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: usize = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// Hard stop for pathological playlists; YouTube caps playlists at 5000 items.
const MAX_PAGES: usize = 100;
// Any public video works; only the key is being checked.
const KEY_CHECK_VIDEO_ID: &str = "dQw4w9WgXcQ";
const PLAYLIST_ID_PREFIXES: &[&str] = &["PL", "UU", "OL", "FL", "RD", "LL"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRef {
    pub id: String,
}

/// Accepts the usual shapes a user pastes: playlist pages, watch links that
/// carry a `list` parameter, short links, or a bare playlist id.
pub fn parse_playlist_url(input: &str) -> Result<PlaylistRef> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("playlist URL is empty");
    }

    if looks_like_playlist_id(trimmed) {
        return Ok(PlaylistRef {
            id: trimmed.to_string(),
        });
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&with_scheme).with_context(|| format!("invalid URL: {trimmed}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("URL has no host: {trimmed}"))?
        .to_ascii_lowercase();
    let known_host = matches!(
        host.as_str(),
        "youtube.com" | "www.youtube.com" | "m.youtube.com" | "music.youtube.com" | "youtu.be"
    );
    if !known_host {
        bail!("not a YouTube URL: {trimmed}");
    }

    let list = url
        .query_pairs()
        .find(|(key, _)| key == "list")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| anyhow!("URL has no playlist (missing list parameter): {trimmed}"))?;
    if !looks_like_playlist_id(&list) {
        bail!("unsupported playlist id: {list}");
    }
    Ok(PlaylistRef { id: list })
}

fn looks_like_playlist_id(value: &str) -> bool {
    (13..=64).contains(&value.len())
        && PLAYLIST_ID_PREFIXES
            .iter()
            .any(|prefix| value.starts_with(prefix))
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

pub fn playlist_url(playlist_id: &str) -> String {
    format!("https://www.youtube.com/playlist?list={playlist_id}")
}

/// Parses ISO-8601 durations the API returns (`PT1H2M3S`, `P1DT2H`).
pub fn parse_iso8601_duration(value: &str) -> Option<u64> {
    let rest = value.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, time),
        None => (rest, ""),
    };

    let mut total = 0u64;
    let mut digits = String::new();
    for (part, in_time) in [(date_part, false), (time_part, true)] {
        for c in part.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let amount: u64 = digits.parse().ok()?;
            digits.clear();
            let unit = match (c, in_time) {
                ('D', false) => 86_400,
                ('W', false) => 7 * 86_400,
                ('H', true) => 3_600,
                ('M', true) => 60,
                ('S', true) => 1,
                _ => return None,
            };
            total += amount * unit;
        }
        if !digits.is_empty() {
            return None;
        }
    }
    Some(total)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistVideo {
    pub video_id: String,
    pub position: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSnapshot {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_title: Option<String>,
    pub videos: Vec<PlaylistVideo>,
}

// Raw API shapes. Only the fields we read are modeled.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistResource {
    snippet: PlaylistSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistSnippet {
    title: String,
    channel_title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    snippet: Option<ItemSnippet>,
    content_details: Option<ItemContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    video_owner_channel_title: Option<String>,
    #[serde(default)]
    thumbnails: Thumbnails,
    resource_id: Option<ResourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemContentDetails {
    video_id: Option<String>,
    video_published_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    maxres: Option<Thumbnail>,
    high: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

impl Thumbnails {
    fn best(&self) -> Option<String> {
        [&self.maxres, &self.high, &self.medium, &self.default]
            .into_iter()
            .flatten()
            .map(|thumb| thumb.url.clone())
            .next()
    }
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    id: String,
    content_details: Option<VideoContentDetails>,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}

/// Converts raw playlist items into pipeline videos. Deleted and private
/// entries are dropped, duplicates keep their first position, and positions
/// are renumbered so they stay dense.
fn collect_videos(items: Vec<PlaylistItem>) -> Vec<PlaylistVideo> {
    let mut seen = HashSet::new();
    let mut videos = Vec::new();
    for item in items {
        let Some(snippet) = item.snippet else {
            continue;
        };
        let video_id = item
            .content_details
            .as_ref()
            .and_then(|details| details.video_id.clone())
            .or_else(|| {
                snippet
                    .resource_id
                    .as_ref()
                    .and_then(|resource| resource.video_id.clone())
            });
        let Some(video_id) = video_id else {
            continue;
        };
        if matches!(snippet.title.as_str(), "Deleted video" | "Private video") {
            continue;
        }
        if !seen.insert(video_id.clone()) {
            continue;
        }
        videos.push(PlaylistVideo {
            position: videos.len() as i64,
            title: snippet.title,
            description: snippet.description,
            channel_title: snippet.video_owner_channel_title,
            thumbnail_url: snippet.thumbnails.best(),
            published_at: item
                .content_details
                .and_then(|details| details.video_published_at),
            duration_seconds: None,
            video_id,
        });
    }
    videos
}

pub struct YoutubeClient {
    agent: ureq::Agent,
    api_key: Secret,
    base_url: String,
}

impl YoutubeClient {
    pub fn new(api_key: Secret) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_API_BASE)
    }

    pub fn with_base_url(api_key: Secret, base_url: impl Into<String>) -> Result<Self> {
        if api_key.expose().trim().is_empty() {
            bail!("YouTube API key is empty");
        }
        Ok(Self {
            agent: http::agent(REQUEST_TIMEOUT),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, HttpError> {
        let mut request = self
            .agent
            .get(&format!("{}/{endpoint}", self.base_url))
            .query("key", self.api_key.expose());
        for (key, value) in query {
            request = request.query(key, value);
        }
        http::call_json(request.call())
    }

    /// One cheap `videos` lookup; fails when the key is invalid, expired or
    /// out of quota.
    pub fn verify_key(&self) -> Result<()> {
        let _: ListResponse<IgnoredAny> = self
            .get("videos", &[("part", "id"), ("id", KEY_CHECK_VIDEO_ID)])
            .context("YouTube rejected the API key")?;
        Ok(())
    }

    /// Lists every playable video of the playlist, in playlist order, with
    /// durations filled in.
    pub fn fetch_playlist(&self, playlist_id: &str) -> Result<PlaylistSnapshot> {
        let playlists: ListResponse<PlaylistResource> = self
            .get("playlists", &[("part", "snippet"), ("id", playlist_id)])
            .context("fetching playlist details")?;
        let playlist = playlists
            .items
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("playlist not found: {playlist_id}"))?;

        let page_size = PAGE_SIZE.to_string();
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        for page in 0..MAX_PAGES {
            let mut query = vec![
                ("part", "snippet,contentDetails"),
                ("maxResults", page_size.as_str()),
                ("playlistId", playlist_id),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let response: ListResponse<PlaylistItem> = self
                .get("playlistItems", &query)
                .with_context(|| format!("fetching playlist items page {page}"))?;
            debug!(playlist_id, page, count = response.items.len(), "playlist page");
            items.extend(response.items);
            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        let mut videos = collect_videos(items);
        if videos.is_empty() {
            bail!("playlist has no playable videos: {playlist_id}");
        }
        self.fill_durations(&mut videos)?;

        info!(
            playlist_id,
            title = playlist.snippet.title.as_str(),
            videos = videos.len(),
            "fetched playlist"
        );
        Ok(PlaylistSnapshot {
            id: playlist_id.to_string(),
            title: playlist.snippet.title,
            channel_title: playlist.snippet.channel_title,
            videos,
        })
    }

    fn fill_durations(&self, videos: &mut [PlaylistVideo]) -> Result<()> {
        for chunk in videos.chunks_mut(PAGE_SIZE) {
            let ids = chunk
                .iter()
                .map(|video| video.video_id.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let response: ListResponse<VideoResource> = self
                .get("videos", &[("part", "contentDetails"), ("id", ids.as_str())])
                .context("fetching video durations")?;
            for resource in response.items {
                let seconds = resource
                    .content_details
                    .and_then(|details| details.duration)
                    .and_then(|raw| parse_iso8601_duration(&raw))
                    .and_then(|secs| i64::try_from(secs).ok());
                for video in chunk.iter_mut().filter(|video| video.video_id == resource.id) {
                    video.duration_seconds = seconds;
                }
            }
        }
        Ok(())
    }
}
