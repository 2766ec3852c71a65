// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reshapes directory events into records the ingestion service can index.
//!
//! The ingestion service takes one JSON object per line and cannot index nested
//! lists of objects, so the `changes` list is flattened into a single map and
//! carried as an encoded string.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// An event as returned by the events API.
pub type RawEvent = Map<String, Value>;

pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const PROMOTED_TIMESTAMP_FIELD: &str = "@timestamp";
pub const CHANGES_FIELD: &str = "changes";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TransformedEvent(Map<String, Value>);

impl TransformedEvent {
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<&str> {
        self.0.get(TIMESTAMP_FIELD).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }
}

#[must_use]
pub fn transform(event: &RawEvent) -> TransformedEvent {
    let mut fields = event.clone();

    if let Some(timestamp) = event.get(TIMESTAMP_FIELD) {
        fields.insert(PROMOTED_TIMESTAMP_FIELD.to_string(), timestamp.clone());
    }

    if let Some(Value::Array(changes)) = event.get(CHANGES_FIELD) {
        let flattened = Value::Object(flatten_changes(changes));
        fields.insert(CHANGES_FIELD.to_string(), Value::String(flattened.to_string()));
    }

    TransformedEvent(fields)
}

/// `{"field": f, "from": a, "to": b}` becomes `f_changed_to: b, f_was: a`.
/// A delta with neither side becomes `f: null`.
#[must_use]
pub fn flatten_changes(changes: &[Value]) -> Map<String, Value> {
    let mut flattened = Map::new();
    for change in changes {
        let Some(field) = change.get("field").and_then(Value::as_str) else {
            debug!("Skipping change without a field name: {change}");
            continue;
        };
        let to = change.get("to");
        let from = change.get("from");
        if to.is_none() && from.is_none() {
            flattened.insert(field.to_string(), Value::Null);
            continue;
        }
        if let Some(to) = to {
            flattened.insert(format!("{field}_changed_to"), to.clone());
        }
        if let Some(from) = from {
            flattened.insert(format!("{field}_was"), from.clone());
        }
    }
    flattened
}
