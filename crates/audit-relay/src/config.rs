// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration loading and validation.
//!
//! The YAML file is extracted into a loosely-typed [`RawConfig`] where every field
//! is optional. [`Config::validate`] then applies the environment overrides and
//! produces the immutable [`Config`] used for the lifetime of the process.
//!
//! ```yaml
//! sink:
//!   url: https://listener.example.com:8071
//!   token: <sink token>
//! source:
//!   credentials:
//!     token: <api key>
//!     org_id: <organization id>
//!   settings:
//!     time_interval: 5
//!   start_date: 2024-01-01T00:00:00.000000Z
//! ```

use crate::checkpoint::Checkpoint;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tracing::debug;

pub const SINK_TOKEN_ENV: &str = "AUDIT_RELAY_SINK_TOKEN";
pub const SOURCE_TOKEN_ENV: &str = "AUDIT_RELAY_SOURCE_TOKEN";
pub const ORG_ID_ENV: &str = "AUDIT_RELAY_ORG_ID";

pub const DEFAULT_SOURCE_URL: &str = "https://api.jumpcloud.com/insights/directory/v1/events";
pub const DEFAULT_POLL_INTERVAL_MINUTES: u64 = 5;
pub const DEFAULT_LOG_TYPE: &str = "jumpcloud";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl FieldError {
    fn missing(field: &'static str) -> Self {
        FieldError {
            field,
            reason: "missing".to_string(),
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        FieldError {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Read(String),

    #[error("Invalid configuration: {}", join_reasons(.0))]
    Invalid(Vec<FieldError>),
}

impl ConfigError {
    /// Field-level reasons, empty when the file itself could not be read.
    #[must_use]
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ConfigError::Read(_) => &[],
            ConfigError::Invalid(errors) => errors,
        }
    }
}

fn join_reasons(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shape of the configuration file before validation.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct RawConfig {
    pub sink: Option<RawSinkConfig>,
    pub source: Option<RawSourceConfig>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawSinkConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub log_type: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawSourceConfig {
    pub url: Option<String>,
    pub credentials: Option<RawCredentials>,
    pub settings: Option<RawSettings>,
    pub start_date: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawCredentials {
    pub token: Option<String>,
    pub org_id: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    // Kept loose so that strings and numbers both reach validation.
    pub time_interval: Option<Value>,
    pub service: Option<Vec<String>>,
}

impl RawConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Read(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Figment::new()
            .merge(Yaml::file(path))
            .extract::<RawConfig>()
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))
    }
}

/// Credential values taken from the environment. They win over file values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CredentialOverrides {
    pub sink_token: Option<String>,
    pub source_token: Option<String>,
    pub org_id: Option<String>,
}

impl CredentialOverrides {
    #[must_use]
    pub fn from_env() -> Self {
        CredentialOverrides {
            sink_token: non_empty_env(SINK_TOKEN_ENV),
            source_token: non_empty_env(SOURCE_TOKEN_ENV),
            org_id: non_empty_env(ORG_ID_ENV),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}

/// Environment value first, then the file value.
fn resolve(env: Option<&String>, file: Option<&String>) -> Option<String> {
    non_empty(env).or_else(|| non_empty(file))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub sink_url: String,
    pub sink_token: String,
    pub sink_log_type: String,
    pub source_url: String,
    pub source_token: String,
    pub org_id: Option<String>,
    pub services: Vec<String>,
    pub poll_interval_minutes: u64,
    pub start_checkpoint: Option<Checkpoint>,
}

impl Config {
    /// Reads `path` and validates it against the current process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = RawConfig::from_file(path)?;
        Self::validate(&raw, &CredentialOverrides::from_env())
    }

    /// Builds a `Config` from the raw tree.
    ///
    /// Required sections are checked in order and the first missing one is
    /// reported on its own; value checks on the remaining fields are collected
    /// together.
    pub fn validate(raw: &RawConfig, env: &CredentialOverrides) -> Result<Self, ConfigError> {
        let sink = raw.sink.clone().unwrap_or_default();
        let Some(sink_url) = non_empty(sink.url.as_ref()) else {
            return Err(ConfigError::Invalid(vec![FieldError::missing("sink.url")]));
        };
        let Some(sink_token) = resolve(env.sink_token.as_ref(), sink.token.as_ref()) else {
            return Err(ConfigError::Invalid(vec![FieldError::missing(
                "sink.token",
            )]));
        };

        let source = raw.source.clone().unwrap_or_default();
        let Some(credentials) = source.credentials.as_ref() else {
            return Err(ConfigError::Invalid(vec![FieldError::missing(
                "source.credentials",
            )]));
        };
        let Some(source_token) = resolve(env.source_token.as_ref(), credentials.token.as_ref())
        else {
            return Err(ConfigError::Invalid(vec![FieldError::missing(
                "source.credentials.token",
            )]));
        };
        let Some(settings) = source.settings.as_ref() else {
            return Err(ConfigError::Invalid(vec![FieldError::missing(
                "source.settings",
            )]));
        };

        let mut errors = Vec::new();

        let start_checkpoint = match non_empty(source.start_date.as_ref()) {
            None => None,
            Some(start_date) => match Checkpoint::parse(&start_date) {
                Ok(checkpoint) => Some(checkpoint),
                Err(e) => {
                    errors.push(FieldError::invalid("source.start_date", e.to_string()));
                    None
                }
            },
        };

        let poll_interval_minutes = match parse_poll_interval(settings.time_interval.as_ref()) {
            Ok(minutes) => minutes,
            Err(reason) => {
                errors.push(FieldError::invalid("source.settings.time_interval", reason));
                DEFAULT_POLL_INTERVAL_MINUTES
            }
        };

        if let Err(reason) = check_url(&sink_url) {
            errors.push(FieldError::invalid("sink.url", reason));
        }

        let source_url =
            non_empty(source.url.as_ref()).unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
        if let Err(reason) = check_url(&source_url) {
            errors.push(FieldError::invalid("source.url", reason));
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        let services = match &settings.service {
            Some(services) if !services.is_empty() => services.clone(),
            _ => vec!["all".to_string()],
        };

        let config = Config {
            sink_url: sink_url.trim_end_matches('/').to_string(),
            sink_token,
            sink_log_type: non_empty(sink.log_type.as_ref())
                .unwrap_or_else(|| DEFAULT_LOG_TYPE.to_string()),
            source_url,
            source_token,
            org_id: resolve(env.org_id.as_ref(), credentials.org_id.as_ref()),
            services,
            poll_interval_minutes,
            start_checkpoint,
        };
        debug!(
            "CONFIG | Loaded configuration: sink={}, source={}, interval={}m",
            config.sink_url, config.source_url, config.poll_interval_minutes
        );
        Ok(config)
    }

    #[must_use]
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_minutes.saturating_mul(60))
    }
}

/// Largest interval whose length in seconds still fits in a `u64`.
const MAX_POLL_INTERVAL_MINUTES: u64 = u64::MAX / 60;

/// Absent or falsy values (null, 0, "", false) fall back to the default.
fn parse_poll_interval(value: Option<&Value>) -> Result<u64, String> {
    let invalid = |v: &dyn fmt::Display| format!("'{v}' is not a positive integer");
    let too_large = |v: &dyn fmt::Display| {
        format!("'{v}' is too large, the maximum is {MAX_POLL_INTERVAL_MINUTES} minutes")
    };
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(DEFAULT_POLL_INTERVAL_MINUTES),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(DEFAULT_POLL_INTERVAL_MINUTES),
            Some(minutes) if minutes > MAX_POLL_INTERVAL_MINUTES => Err(too_large(n)),
            Some(minutes) => Ok(minutes),
            None => Err(invalid(n)),
        },
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(DEFAULT_POLL_INTERVAL_MINUTES);
            }
            match trimmed.parse::<u64>() {
                Ok(0) => Ok(DEFAULT_POLL_INTERVAL_MINUTES),
                Ok(minutes) if minutes > MAX_POLL_INTERVAL_MINUTES => Err(too_large(s)),
                Ok(minutes) => Ok(minutes),
                Err(_) => Err(invalid(s)),
            }
        }
        Some(other) => Err(invalid(other)),
    }
}

fn check_url(url: &str) -> Result<(), String> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        Ok(parsed) => Err(format!(
            "'{url}' must be an http(s) URL with a host, got scheme '{}'",
            parsed.scheme()
        )),
        Err(e) => Err(format!("'{url}' is not a valid URL: {e}")),
    }
}
