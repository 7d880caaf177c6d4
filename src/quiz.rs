#![forbid(unsafe_code)]

//! Client for the quiz platform's internal web endpoints. The platform has no
//! public API, so we speak the same JSON the admin UI does, authenticated with
//! the browser session cookie plus its CSRF token.

use std::{fmt, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::QuizCredentials;
use crate::http::{self, HttpError, RetryPolicy};
use crate::youtube::{PlaylistVideo, watch_url};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const CREATE_ASSESSMENT_PATH: &str = "/_api/main/ai/video-quiz";
const CREATE_INTERACTIVE_PATH: &str = "/_api/main/interactive-video";
const USER_PATH: &str = "/_api/main/user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Assessment,
    InteractiveVideo,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Assessment, ResourceKind::InteractiveVideo];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assessment => "assessment",
            Self::InteractiveVideo => "interactive_video",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "assessment" => Ok(Self::Assessment),
            "interactive_video" => Ok(Self::InteractiveVideo),
            other => Err(anyhow!("unknown resource kind: {other}")),
        }
    }
}

/// Generation knobs forwarded to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuizOptions {
    pub language: String,
    pub question_count: u32,
    pub create_assessment: bool,
    pub create_interactive: bool,
}

impl Default for QuizOptions {
    fn default() -> Self {
        Self {
            language: "English".to_string(),
            question_count: 10,
            create_assessment: true,
            create_interactive: true,
        }
    }
}

impl QuizOptions {
    pub fn enabled_kinds(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                ResourceKind::Assessment => self.create_assessment,
                ResourceKind::InteractiveVideo => self.create_interactive,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftStatus {
    Processing,
    Ready { question_count: i64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedQuiz {
    pub quiz_id: String,
    pub share_url: String,
}

pub struct QuizClient {
    agent: ureq::Agent,
    credentials: QuizCredentials,
    retry: RetryPolicy,
}

impl QuizClient {
    pub fn new(credentials: QuizCredentials, retry: RetryPolicy) -> Result<Self> {
        if credentials.cookie.expose().trim().is_empty()
            || credentials.csrf_token.expose().trim().is_empty()
        {
            bail!("quiz platform session cookie and CSRF token are required");
        }
        Ok(Self {
            agent: http::agent(REQUEST_TIMEOUT),
            credentials,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.credentials.base_url)
    }

    fn authed(&self, request: ureq::Request) -> ureq::Request {
        request
            .set("Cookie", self.credentials.cookie.expose())
            .set("x-csrf-token", self.credentials.csrf_token.expose())
            .set("Accept", "application/json")
            .set("Origin", &self.credentials.base_url)
    }

    fn post(&self, label: &str, path: &str, body: &Value) -> Result<Value, HttpError> {
        let url = self.url(path);
        http::with_rate_limit_retry(self.retry, label, std::thread::sleep, || {
            let request = self.authed(self.agent.post(&url));
            let raw: Value = http::call_json(request.send_json(body))?;
            unwrap_envelope(raw)
        })
    }

    fn get(&self, label: &str, path: &str) -> Result<Value, HttpError> {
        let url = self.url(path);
        http::with_rate_limit_retry(self.retry, label, std::thread::sleep, || {
            let request = self.authed(self.agent.get(&url));
            let raw: Value = http::call_json(request.call())?;
            unwrap_envelope(raw)
        })
    }

    /// Confirms the session cookie is still accepted.
    pub fn ping(&self) -> Result<()> {
        self.get("user", USER_PATH)
            .context("quiz platform rejected the session")?;
        Ok(())
    }

    pub fn create(
        &self,
        kind: ResourceKind,
        video: &PlaylistVideo,
        options: &QuizOptions,
    ) -> Result<String> {
        let (path, body) = match kind {
            ResourceKind::Assessment => (
                CREATE_ASSESSMENT_PATH,
                json!({
                    "videoUrl": watch_url(&video.video_id),
                    "videoId": video.video_id,
                    "title": video.title,
                    "language": options.language,
                    "questionCount": options.question_count,
                    "type": "assessment",
                }),
            ),
            ResourceKind::InteractiveVideo => (
                CREATE_INTERACTIVE_PATH,
                json!({
                    "source": "youtube",
                    "videoId": video.video_id,
                    "videoUrl": watch_url(&video.video_id),
                    "title": video.title,
                    "duration": video.duration_seconds,
                    "language": options.language,
                    "autoGenerateQuestions": true,
                    "questionCount": options.question_count,
                }),
            ),
        };

        let data = self
            .post(kind.as_str(), path, &body)
            .with_context(|| format!("creating {kind} for {}", video.video_id))?;
        let quiz_id = extract_quiz_id(&data)
            .ok_or_else(|| anyhow!("{kind} response for {} had no quiz id", video.video_id))?;
        info!(
            video_id = video.video_id.as_str(),
            %kind,
            quiz_id = quiz_id.as_str(),
            "created resource"
        );
        Ok(quiz_id)
    }

    pub fn fetch_draft(&self, quiz_id: &str) -> Result<DraftStatus> {
        let data = self
            .get("draft", &format!("/_api/main/quiz/{quiz_id}/draft"))
            .with_context(|| format!("fetching draft {quiz_id}"))?;
        let status = parse_draft_status(&data);
        debug!(quiz_id, ?status, "draft status");
        Ok(status)
    }

    pub fn publish(&self, quiz_id: &str) -> Result<PublishedQuiz> {
        let data = self
            .post(
                "publish",
                &format!("/_api/main/quiz/{quiz_id}/publish"),
                &json!({ "quizId": quiz_id }),
            )
            .with_context(|| format!("publishing {quiz_id}"))?;
        let share_url = ["shareUrl", "shareLink", "url"]
            .iter()
            .find_map(|key| {
                data.get(*key)
                    .or_else(|| data.get("quiz").and_then(|quiz| quiz.get(*key)))
                    .and_then(Value::as_str)
            })
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/admin/quiz/{quiz_id}", self.credentials.base_url));
        Ok(PublishedQuiz {
            quiz_id: quiz_id.to_string(),
            share_url,
        })
    }
}

/// The admin endpoints wrap payloads as `{"success": bool, "data": …}`.
/// Unwrapped responses are passed through untouched.
fn unwrap_envelope(raw: Value) -> Result<Value, HttpError> {
    let Some(success) = raw.get("success").and_then(Value::as_bool) else {
        return Ok(raw);
    };
    if !success {
        let message = raw
            .get("error")
            .and_then(|error| {
                error
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| error.get("message").and_then(Value::as_str).map(str::to_string))
            })
            .or_else(|| raw.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "request rejected".to_string());
        return Err(HttpError::Status {
            code: 200,
            body: message,
        });
    }
    Ok(raw.get("data").cloned().unwrap_or(Value::Null))
}

fn extract_quiz_id(data: &Value) -> Option<String> {
    let candidates = [
        data.get("quizId"),
        data.get("quiz").and_then(|quiz| quiz.get("_id")),
        data.get("quiz").and_then(|quiz| quiz.get("id")),
        data.get("_id"),
        data.get("id"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|value| match value {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        })
}

fn parse_draft_status(data: &Value) -> DraftStatus {
    let quiz = data.get("quiz").unwrap_or(data);
    let status = quiz
        .get("status")
        .or_else(|| data.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("processing")
        .to_ascii_lowercase();
    let question_count = quiz
        .get("questions")
        .and_then(Value::as_array)
        .map(|questions| questions.len() as i64)
        .or_else(|| quiz.get("questionCount").and_then(Value::as_i64))
        .unwrap_or(0);

    match status.as_str() {
        "failed" | "error" => DraftStatus::Failed {
            reason: quiz
                .get("error")
                .or_else(|| quiz.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or("generation failed")
                .to_string(),
        },
        "ready" | "completed" | "complete" | "draft" if question_count > 0 => {
            DraftStatus::Ready { question_count }
        }
        "ready" | "completed" | "complete" => DraftStatus::Failed {
            reason: "generation finished without questions".to_string(),
        },
        _ => DraftStatus::Processing,
    }
}
