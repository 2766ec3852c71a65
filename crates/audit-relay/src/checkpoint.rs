// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Watermark timestamp marking the last shipped event, and its durable storage.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Fixed wire format: `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
pub const CHECKPOINT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

// Parsing accepts any number of fractional digits (including none).
const CHECKPOINT_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("'{input}' does not match the format YYYY-MM-DDTHH:MM:SS.ffffffZ")]
pub struct ParseCheckpointError {
    input: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to write checkpoint file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// A UTC instant rendered with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checkpoint(DateTime<Utc>);

impl Checkpoint {
    #[must_use]
    pub fn new(instant: DateTime<Utc>) -> Self {
        Checkpoint(instant)
    }

    #[must_use]
    pub fn now() -> Self {
        Checkpoint(Utc::now())
    }

    /// Strict parse under the fixed checkpoint format.
    pub fn parse(input: &str) -> Result<Self, ParseCheckpointError> {
        NaiveDateTime::parse_from_str(input.trim(), CHECKPOINT_PARSE_FORMAT)
            .map(|naive| Checkpoint(naive.and_utc()))
            .map_err(|_| ParseCheckpointError {
                input: input.to_string(),
            })
    }

    /// Parses an event `timestamp`, falling back to RFC 3339 for values carrying
    /// an explicit offset or nanosecond precision.
    #[must_use]
    pub fn from_event_timestamp(input: &str) -> Option<Self> {
        Self::parse(input).ok().or_else(|| {
            DateTime::parse_from_rfc3339(input.trim())
                .ok()
                .map(|dt| Checkpoint(dt.with_timezone(&Utc)))
        })
    }

    /// The checkpoint one second later. The events API filters `start_time`
    /// inclusively, so the next request must start past the last seen event.
    #[must_use]
    pub fn advanced(&self) -> Self {
        Checkpoint(self.0 + TimeDelta::seconds(1))
    }

    #[must_use]
    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CHECKPOINT_FORMAT))
    }
}

impl FromStr for Checkpoint {
    type Err = ParseCheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub trait CheckpointStore: Send + Sync {
    /// Returns the persisted checkpoint, or `None` when absent or unreadable.
    fn load(&self) -> Option<Checkpoint>;

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

/// Single-line file holding the last checkpoint.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCheckpointStore { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_atomically(&self, contents: &str) -> io::Result<()> {
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Option<Checkpoint> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("CHECKPOINT | No checkpoint file at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!(
                    "CHECKPOINT | Failed to read checkpoint file {}: {e}",
                    self.path.display()
                );
                return None;
            }
        };

        match Checkpoint::parse(contents.trim()) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(
                    "CHECKPOINT | Ignoring corrupt checkpoint file {}: {e}",
                    self.path.display()
                );
                None
            }
        }
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.write_atomically(&checkpoint.to_string())
            .map_err(|source| CheckpointError::Write {
                path: self.path.clone(),
                source,
            })?;
        debug!("CHECKPOINT | Saved {checkpoint} to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_has_six_fraction_digits() {
        let checkpoint = Checkpoint::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 7).unwrap());
        assert_eq!(checkpoint.to_string(), "2024-01-01T00:00:07.000000Z");
    }

    #[test]
    fn test_format_then_parse_is_equal() {
        let checkpoint = Checkpoint::parse("2023-06-15T12:34:56.789012Z").unwrap();
        let reparsed = Checkpoint::parse(&checkpoint.to_string()).unwrap();
        assert_eq!(checkpoint, reparsed);
        assert_eq!(reparsed.to_string(), "2023-06-15T12:34:56.789012Z");
    }

    #[test]
    fn test_parse_rejects_other_formats() {
        assert!(Checkpoint::parse("2024-01-01 00:00:00").is_err());
        assert!(Checkpoint::parse("2024-01-01T00:00:00+02:00").is_err());
        assert!(Checkpoint::parse("yesterday").is_err());
        assert!(Checkpoint::parse("").is_err());
    }

    #[test]
    fn test_parse_accepts_whole_seconds() {
        let checkpoint = Checkpoint::parse("2024-01-01T00:00:05Z").unwrap();
        assert_eq!(checkpoint.to_string(), "2024-01-01T00:00:05.000000Z");
    }

    #[test]
    fn test_advanced_adds_one_second() {
        let checkpoint = Checkpoint::parse("2024-01-01T23:59:59.500000Z").unwrap();
        assert_eq!(
            checkpoint.advanced().to_string(),
            "2024-01-02T00:00:00.500000Z"
        );
    }

    #[test]
    fn test_event_timestamp_with_offset() {
        let checkpoint = Checkpoint::from_event_timestamp("2024-01-01T02:00:06.123+02:00").unwrap();
        assert_eq!(checkpoint.to_string(), "2024-01-01T00:00:06.123000Z");
        assert!(Checkpoint::from_event_timestamp("not a time").is_none());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("last_time.txt"));
        assert_eq!(store.load(), None);

        let checkpoint = Checkpoint::parse("2024-01-01T00:00:07.000000Z").unwrap();
        store.save(&checkpoint).unwrap();

        assert_eq!(store.load(), Some(checkpoint));
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "2024-01-01T00:00:07.000000Z"
        );
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("last_time.txt"));
        store
            .save(&Checkpoint::parse("2024-01-01T00:00:07Z").unwrap())
            .unwrap();
        store
            .save(&Checkpoint::parse("2024-01-01T00:00:09Z").unwrap())
            .unwrap();
        assert_eq!(
            store.load().unwrap().to_string(),
            "2024-01-01T00:00:09.000000Z"
        );
    }

    #[test]
    fn test_file_store_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_time.txt");
        fs::write(&path, "garbage").unwrap();
        let store = FileCheckpointStore::new(path);
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_file_store_save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("missing").join("last_time.txt"));
        let result = store.save(&Checkpoint::now());
        assert!(matches!(result, Err(CheckpointError::Write { .. })));
    }
}
