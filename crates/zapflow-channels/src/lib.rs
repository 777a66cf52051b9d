//! # Zapflow Channels
//! Gateway adapters (WAHA, Evolution API, Telegram) and the channel registry.

pub mod address;
pub mod evolution;
pub mod gateways;
pub mod registry;
pub mod telegram;
pub mod waha;

pub use gateways::Gateways;
pub use registry::{ChannelRegistry, spawn_health_monitor};

use std::time::Duration;
use zapflow_core::error::{Result, ZapflowError};

/// HTTP client with a bounded per-request timeout, so an unresponsive backend
/// cannot stall a dispatch job.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("⚠️ Falling back to default HTTP client: {e}");
            reqwest::Client::new()
        })
}

/// `base_url` with `segments` appended, each percent-encoded as one segment.
pub(crate) fn endpoint_url(base_url: &str, segments: &[&str]) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| ZapflowError::Channel(format!("invalid base URL {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ZapflowError::Channel(format!("base URL {base_url} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
