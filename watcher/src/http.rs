use bytes::Bytes;
use camwatch_common::config::StreamConfig;
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

use crate::WatchError;

pub type HttpBody = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

pub fn build_client(config: &StreamConfig) -> Result<reqwest::Client, WatchError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(WatchError::HttpConnect)
}

/// GET the camera URL and hand back the body once headers are in.
pub async fn open_stream(client: &reqwest::Client, url: &str) -> Result<HttpBody, WatchError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(WatchError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(WatchError::HttpStatus(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !is_mjpeg_content_type(&content_type) {
        warn!(content_type, "unexpected content type, scanning for JPEG markers anyway");
    }

    info!(status = %response.status(), content_type, "connected to MJPEG stream");
    Ok(Box::pin(response.bytes_stream()))
}

fn is_mjpeg_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("multipart/") || lower.starts_with("image/jpeg")
}
