// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shipping of transformed events to the log-ingestion service.
//!
//! ```text
//!   TransformedEvent
//!         │ enrich (type field), size check
//!         v
//!   ┌─────────────┐  bulk would exceed 1 MiB
//!   │    Bulk     │ ───────────────────────┐
//!   └──────┬──────┘                        │
//!          │ flush                         │
//!          v                               v
//!   ┌─────────────┐                 ┌─────────────┐
//!   │ gzip + POST │ <────────────── │ early flush │
//!   └──────┬──────┘                 └─────────────┘
//!          │
//!          v
//!   retry on 5xx / connection errors (3 attempts)
//! ```

use crate::config::Config;
use crate::error::ApiError;
use crate::http::get_client;
use crate::transformer::TransformedEvent;
use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const MAX_BULK_SIZE_BYTES: usize = 1024 * 1024;
pub const MAX_LOG_SIZE_BYTES: usize = 500 * 1000;
pub const FLUSH_RETRY_COUNT: u32 = 3;
pub const FLUSH_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const SINK_TIMEOUT: Duration = Duration::from_secs(5);

const RETRYABLE_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Sends the whole batch. An empty batch is a successful no-op.
    async fn ship(&self, events: &[TransformedEvent]) -> Result<(), ApiError>;
}

/// Batches line-delimited JSON records and posts them gzip-compressed.
#[derive(Debug)]
pub struct Shipper {
    client: reqwest::Client,
    endpoint: String,
    log_type: String,
    retry_backoff: Duration,
    logs: Vec<String>,
    bulk_size: usize,
}

impl Shipper {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Shipper {
            client: get_client(SINK_TIMEOUT),
            endpoint: format!("{}/?token={}", config.sink_url, config.sink_token),
            log_type: config.sink_log_type.clone(),
            retry_backoff: FLUSH_RETRY_BACKOFF,
            logs: Vec::new(),
            bulk_size: 0,
        }
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Queues one JSON record, flushing first if it would overflow the bulk.
    /// Records over [`MAX_LOG_SIZE_BYTES`] are dropped.
    pub async fn add(&mut self, record: &str) -> Result<(), ApiError> {
        let enriched = self.enrich(record)?;
        let size = enriched.len();

        if size > MAX_LOG_SIZE_BYTES {
            error!(
                "SINK | Dropping record of {size} bytes, larger than the {MAX_LOG_SIZE_BYTES} byte limit"
            );
            return Ok(());
        }

        if self.bulk_size + size > MAX_BULK_SIZE_BYTES {
            self.flush().await?;
        }
        self.logs.push(enriched);
        self.bulk_size += size;
        Ok(())
    }

    /// Sends the queued bulk. The bulk is cleared only when the send succeeds.
    pub async fn flush(&mut self) -> Result<(), ApiError> {
        if self.logs.is_empty() {
            return Ok(());
        }

        let body = self.compress()?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self
                .client
                .post(&self.endpoint)
                .headers(headers())
                .body(body.clone())
                .send()
                .await;

            let retryable = match &result {
                Ok(resp) => RETRYABLE_STATUSES.contains(&resp.status()),
                Err(e) => e.is_connect() || e.is_timeout(),
            };
            if retryable && attempts < FLUSH_RETRY_COUNT {
                warn!("SINK | Attempt {attempts} failed, retrying in {:?}", self.retry_backoff);
                tokio::time::sleep(self.retry_backoff * attempts).await;
                continue;
            }

            return match result {
                Ok(resp) if resp.status().is_success() => {
                    info!("SINK | Successfully sent bulk of {} bytes", self.bulk_size);
                    self.reset();
                    Ok(())
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    Err(classify_status(status, &body))
                }
                // The endpoint carries the token in its query string.
                Err(e) => Err(ApiError::Other(format!(
                    "failed to send logs after {attempts} attempts: {}",
                    e.without_url()
                ))),
            };
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.logs.len()
    }

    fn enrich(&self, record: &str) -> Result<String, ApiError> {
        let mut value: Value = serde_json::from_str(record)
            .map_err(|e| ApiError::Other(format!("record is not valid JSON: {e}")))?;
        let Some(fields) = value.as_object_mut() else {
            return Err(ApiError::Other("record is not a JSON object".to_string()));
        };
        fields.insert("type".to_string(), Value::String(self.log_type.clone()));
        Ok(value.to_string())
    }

    fn compress(&self) -> Result<Vec<u8>, ApiError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(self.logs.join("\n").as_bytes())
            .map_err(|e| ApiError::Other(format!("failed to compress logs: {e}")))?;
        encoder
            .finish()
            .map_err(|e| ApiError::Other(format!("failed to compress logs: {e}")))
    }

    fn reset(&mut self) {
        self.logs.clear();
        self.bulk_size = 0;
    }
}

fn headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    headers
}

/// Maps a non-2xx ingestion response to an [`ApiError`].
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> ApiError {
    match status {
        StatusCode::BAD_REQUEST => ApiError::BadRequest("badly formatted logs".to_string()),
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized("invalid token".to_string()),
        other => ApiError::unexpected_status(other, body),
    }
}

/// [`EventSink`] backed by a [`Shipper`].
#[allow(clippy::module_name_repetitions)]
pub struct IngestSinkClient {
    shipper: Mutex<Shipper>,
}

impl IngestSinkClient {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_shipper(Shipper::new(&config))
    }

    #[must_use]
    pub fn with_shipper(shipper: Shipper) -> Self {
        IngestSinkClient {
            shipper: Mutex::new(shipper),
        }
    }
}

#[async_trait]
impl EventSink for IngestSinkClient {
    async fn ship(&self, events: &[TransformedEvent]) -> Result<(), ApiError> {
        if events.is_empty() {
            info!("SINK | No events to ship");
            return Ok(());
        }

        let mut shipper = self.shipper.lock().await;
        // Leftovers from a failed cycle will be fetched again from the source.
        shipper.reset();
        for event in events {
            let line = event
                .to_json()
                .map_err(|e| ApiError::Other(format!("failed to serialize event: {e}")))?;
            shipper.add(&line).await?;
        }
        debug!("SINK | Flushing {} events", events.len());
        let result = shipper.flush().await;
        if result.is_err() {
            shipper.reset();
        }
        result
    }
}
