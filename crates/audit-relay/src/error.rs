// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Classified outcome of a failed call to the events API or the ingestion service.
///
/// Every variant carries a human-readable message. Transport errors are mapped
/// into this set at the client boundary so the poller never sees `reqwest` types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Organization id required: {0}")]
    OrgRequired(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Short name of the variant, used as a structured log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::OrgRequired(_) => "org_required",
            Self::BadRequest(_) => "bad_request",
            Self::ConnectionFailure(_) => "connection_failure",
            Self::Timeout(_) => "timeout",
            Self::Other(_) => "other",
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::OrgRequired(msg)
            | Self::BadRequest(msg)
            | Self::ConnectionFailure(msg)
            | Self::Timeout(msg)
            | Self::Other(msg) => msg,
        }
    }

    /// Classifies a transport error that never produced an HTTP response.
    /// The request URL is stripped from the message since it may carry
    /// credentials in its query string.
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::ConnectionFailure(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }

    pub(crate) fn unexpected_status(status: StatusCode, body: &str) -> Self {
        if body.is_empty() {
            Self::Other(format!("unexpected status {status}"))
        } else {
            Self::Other(format!("unexpected status {status}: {body}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ApiError::Unauthorized("invalid API key".to_string());
        assert_eq!(error.to_string(), "Unauthorized: invalid API key");

        let error = ApiError::Other("boom".to_string());
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn test_kind_and_message() {
        let error = ApiError::Timeout("deadline exceeded".to_string());
        assert_eq!(error.kind(), "timeout");
        assert_eq!(error.message(), "deadline exceeded");

        let error = ApiError::OrgRequired("set x-org-id".to_string());
        assert_eq!(error.kind(), "org_required");
    }

    #[test]
    fn test_unexpected_status_keeps_body() {
        let error = ApiError::unexpected_status(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(
            error,
            ApiError::Other("unexpected status 502 Bad Gateway: upstream down".to_string())
        );

        let error = ApiError::unexpected_status(StatusCode::IM_A_TEAPOT, "");
        assert_eq!(
            error,
            ApiError::Other("unexpected status 418 I'm a teapot".to_string())
        );
    }
}
