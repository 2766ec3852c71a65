// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use std::error::Error;
use tracing::{debug, error};

pub const USER_AGENT: &str = concat!("audit-relay/", env!("CARGO_PKG_VERSION"));

/// Builds an HTTP client whose requests fail with a timeout after `timeout`.
///
/// `HTTPS_PROXY` and friends are honoured through reqwest's system proxy support.
/// If the builder fails the error is logged and a default client is returned so
/// the relay can keep polling.
#[must_use]
pub fn get_client(timeout: Duration) -> reqwest::Client {
    match build_client(timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to build HTTP client, falling back to defaults: {e}");
            reqwest::Client::new()
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, Box<dyn Error>> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .user_agent(USER_AGENT)
        .build()?;
    debug!("HTTP client built with a {}s timeout", timeout.as_secs());
    Ok(client)
}
