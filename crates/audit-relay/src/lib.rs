// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Audit Relay
//!
//! Periodically polls a directory-events API for new audit events and relays
//! them, reshaped, to a log-ingestion service. The position of the last shipped
//! event is persisted so that a restart resumes without losing events.
//!
//! ```text
//!   Poller ──> EventSource ──> transform ──> EventSink ──> CheckpointStore
//!     ^                                                          │
//!     └──────────────────────── sleep ───────────────────────────┘
//! ```
//!
//! - [`config`]: YAML configuration, environment overrides and validation
//! - [`checkpoint`]: the watermark timestamp and its file storage
//! - [`source`]: events API client
//! - [`transformer`]: event reshaping
//! - [`sink`]: batching shipper for the ingestion service
//! - [`poller`]: the loop and its failure policy

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod http;
pub mod poller;
pub mod sink;
pub mod source;
pub mod transformer;
