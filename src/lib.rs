#![forbid(unsafe_code)]

//! Turns a YouTube playlist into published quiz-platform resources, one
//! assessment and one interactive video per video, with a shareable
//! spreadsheet of links at the end.

pub mod config;
pub mod http;
pub mod logging;
pub mod pipeline;
pub mod quiz;
pub mod settings;
pub mod sheets;
pub mod store;
pub mod youtube;

use anyhow::Result;

use crate::config::{DatabaseTarget, RuntimeConfig};
use crate::store::Store;

/// Opens whichever database the configuration points at.
pub async fn open_store(config: &RuntimeConfig) -> Result<Store> {
    match &config.database {
        DatabaseTarget::Local(path) => Store::open_local(path).await,
        DatabaseTarget::Remote { url, auth_token } => {
            Store::open_remote(url, auth_token.expose()).await
        }
    }
}
