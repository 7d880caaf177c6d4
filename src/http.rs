#![forbid(unsafe_code)]

//! Blocking HTTP plumbing shared by the YouTube, quiz-platform and Sheets
//! clients. Every client is driven from `spawn_blocking`, so plain
//! `std::thread::sleep` is fine for backoff here.

use std::{io::Read, time::Duration};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

const USER_AGENT: &str = concat!("quiztube-tools/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: u64 = 2048;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl HttpError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { code: 404, .. })
    }
}

/// Builds the agent every client shares.
pub fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Turns a ureq failure into an [`HttpError`], pulling `Retry-After` out of
/// 429 responses.
pub fn classify(err: ureq::Error) -> HttpError {
    match err {
        ureq::Error::Status(429, response) => HttpError::RateLimited {
            retry_after: response
                .header("Retry-After")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        ureq::Error::Status(code, response) => HttpError::Status {
            code,
            body: read_error_body(response),
        },
        ureq::Error::Transport(transport) => HttpError::Transport(transport.to_string()),
    }
}

fn read_error_body(response: ureq::Response) -> String {
    let mut body = String::new();
    let _ = response
        .into_reader()
        .take(MAX_ERROR_BODY)
        .read_to_string(&mut body);
    body.trim().to_string()
}

/// Sends a prepared request and decodes its JSON body.
pub fn call_json<T: DeserializeOwned>(
    result: Result<ureq::Response, ureq::Error>,
) -> Result<T, HttpError> {
    let response = result.map_err(classify)?;
    response
        .into_json::<T>()
        .map_err(|err| HttpError::Decode(err.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Runs `op`, retrying only when the remote side answered 429. The wait is the
/// server's `Retry-After` when present, otherwise `backoff * attempt`.
pub fn with_rate_limit_retry<T>(
    policy: RetryPolicy,
    label: &str,
    mut sleep: impl FnMut(Duration),
    mut op: impl FnMut() -> Result<T, HttpError>,
) -> Result<T, HttpError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(HttpError::RateLimited { retry_after }) if attempt < policy.retries => {
                attempt += 1;
                let wait = retry_after.unwrap_or(policy.backoff * attempt);
                warn!(
                    call = label,
                    attempt,
                    wait_secs = wait.as_secs(),
                    "rate limited, backing off"
                );
                sleep(wait);
            }
            other => return other,
        }
    }
}
