// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the directory-events API.

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::ApiError;
use crate::http::get_client;
use crate::transformer::RawEvent;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ORG_ID_HEADER: &str = "x-org-id";
pub const SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetches every event at or after `since`, in the order the API returns them.
    async fn fetch_since(&self, since: &Checkpoint) -> Result<Vec<RawEvent>, ApiError>;
}

#[derive(Debug, Serialize, PartialEq)]
pub struct EventsQuery<'a> {
    pub service: &'a [String],
    pub start_time: String,
}

/// Polls the events endpoint. No retries happen here; a failed poll is simply
/// repeated on the next cycle.
#[derive(Debug, Clone)]
pub struct DirectoryEventsClient {
    client: reqwest::Client,
    config: Arc<Config>,
    headers: HeaderMap,
}

impl DirectoryEventsClient {
    pub fn new(config: Arc<Config>) -> Result<Self, ApiError> {
        let headers = build_headers(&config)?;
        Ok(DirectoryEventsClient {
            client: get_client(SOURCE_TIMEOUT),
            config,
            headers,
        })
    }

    /// Replaces the request deadline, [`SOURCE_TIMEOUT`] by default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = get_client(timeout);
        self
    }

    fn query(&self, since: &Checkpoint) -> EventsQuery<'_> {
        EventsQuery {
            service: &self.config.services,
            start_time: since.to_string(),
        }
    }
}

fn build_headers(config: &Config) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let api_key = HeaderValue::from_str(&config.source_token)
        .map_err(|e| ApiError::Other(format!("API key is not a valid header value: {e}")))?;
    headers.insert(API_KEY_HEADER, api_key);
    if let Some(org_id) = &config.org_id {
        let org_id = HeaderValue::from_str(org_id).map_err(|e| {
            ApiError::Other(format!("organization id is not a valid header value: {e}"))
        })?;
        headers.insert(ORG_ID_HEADER, org_id);
    }
    Ok(headers)
}

#[async_trait]
impl EventSource for DirectoryEventsClient {
    async fn fetch_since(&self, since: &Checkpoint) -> Result<Vec<RawEvent>, ApiError> {
        debug!("SOURCE | Requesting events since {since}");
        let response = self
            .client
            .post(&self.config.source_url)
            .headers(self.headers.clone())
            .json(&self.query(since))
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(ApiError::from_transport)?;
            return serde_json::from_slice::<Vec<RawEvent>>(&body).map_err(|e| {
                ApiError::Other(format!("failed to decode events response: {e}"))
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Maps a non-2xx events API response to an [`ApiError`].
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized("invalid API key".to_string()),
        StatusCode::PAYMENT_REQUIRED => ApiError::Other(
            "directory insights is not enabled for your organization".to_string(),
        ),
        StatusCode::BAD_REQUEST => ApiError::BadRequest("invalid or unknown query body".to_string()),
        StatusCode::FORBIDDEN if body.to_ascii_lowercase().contains(ORG_ID_HEADER) => {
            ApiError::OrgRequired(format!(
                "the API requires the {ORG_ID_HEADER} header; set the organization id"
            ))
        }
        StatusCode::FORBIDDEN => ApiError::Forbidden(format!(
            "access denied; the {ORG_ID_HEADER} header may be missing or the credentials invalid"
        )),
        other => ApiError::unexpected_status(other, body),
    }
}
