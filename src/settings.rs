#![forbid(unsafe_code)]

//! Run settings: how the pipeline paces itself against the quiz platform and
//! what it asks the platform to generate. Persisted as `settings.toml` inside
//! the data directory and editable at runtime.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::http::RetryPolicy;
use crate::quiz::QuizOptions;

pub const SETTINGS_FILE: &str = "settings.toml";
const MAX_QUESTION_COUNT: u32 = 50;

/// Delays between quiz-platform calls. Generation is asynchronous on the
/// platform, so drafts are only collected after `processing_wait_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    pub processing_wait_secs: u64,
    pub step_gap_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_attempts: u32,
    pub rate_limit_retries: u32,
    pub rate_limit_backoff_secs: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            processing_wait_secs: 150,
            step_gap_secs: 2,
            poll_interval_secs: 30,
            poll_attempts: 5,
            rate_limit_retries: 3,
            rate_limit_backoff_secs: 10,
        }
    }
}

impl Pacing {
    /// No waiting at all; used by tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            processing_wait_secs: 0,
            step_gap_secs: 0,
            poll_interval_secs: 0,
            rate_limit_backoff_secs: 0,
            ..Self::default()
        }
    }

    pub fn processing_wait(&self) -> Duration {
        Duration::from_secs(self.processing_wait_secs)
    }

    pub fn step_gap(&self) -> Duration {
        Duration::from_secs(self.step_gap_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.rate_limit_retries,
            backoff: Duration::from_secs(self.rate_limit_backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub pacing: Pacing,
    pub quiz: QuizOptions,
}

impl RunSettings {
    pub fn validate(&self) -> Result<()> {
        if self.pacing.poll_attempts == 0 {
            bail!("pacing.poll_attempts must be at least 1");
        }
        if !(1..=MAX_QUESTION_COUNT).contains(&self.quiz.question_count) {
            bail!("quiz.question_count must be between 1 and {MAX_QUESTION_COUNT}");
        }
        if self.quiz.enabled_kinds().is_empty() {
            bail!("enable at least one of quiz.create_assessment or quiz.create_interactive");
        }
        if self.quiz.language.trim().is_empty() {
            bail!("quiz.language must not be empty");
        }
        Ok(())
    }
}

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<RunSettings>,
}

impl SettingsStore {
    /// Reads `settings.toml` from `data_dir`, falling back to defaults when the
    /// file is missing or unusable.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        let current = match fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str::<RunSettings>(&raw)
                .map_err(anyhow::Error::from)
                .and_then(|settings| settings.validate().map(|()| settings))
            {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(path = %path.display(), "ignoring invalid settings file: {err}");
                    RunSettings::default()
                }
            },
            Err(_) => RunSettings::default(),
        };

        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn get(&self) -> RunSettings {
        self.current.read().clone()
    }

    pub fn update(&self, settings: RunSettings) -> Result<RunSettings> {
        settings.validate()?;
        write_toml_atomic(&self.path, &settings)?;
        *self.current.write() = settings.clone();
        Ok(settings)
    }
}

fn write_toml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = toml::to_string_pretty(value).context("serializing settings")?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
