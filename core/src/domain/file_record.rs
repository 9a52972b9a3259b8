// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! File-lifecycle data model.
//!
//! `FileRecord` is the primary entity of the metadata index (component B).
//! This module holds the aggregate and its invariants; persistence lives in
//! [`crate::infrastructure::index`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Composite primary key `(file_hash, chat_id, filename)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub file_hash: String,
    pub chat_id: String,
    pub filename: String,
}

impl FileKey {
    pub fn new(file_hash: impl Into<String>, chat_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            file_hash: file_hash.into(),
            chat_id: chat_id.into(),
            filename: filename.into(),
        }
    }
}

/// A tracked file: its remaining-download quota and optional expiry.
///
/// Invariants (spec §3):
/// - `remaining_downloads` is `None` for unlimited, `Some(n)` with `n >= 0` otherwise.
/// - A record is expired iff `remaining_downloads == Some(0)` or `expires_at <= now`.
/// - Records are never deleted; "expiry" sets `remaining_downloads` to `Some(0)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub key: FileKey,
    pub remaining_downloads: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The subset of `FileRecord` returned to API callers (upload/download responses).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadataView {
    pub remaining_downloads: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&FileRecord> for FileMetadataView {
    fn from(record: &FileRecord) -> Self {
        Self {
            remaining_downloads: record.remaining_downloads,
            expires_at: record.expires_at,
        }
    }
}
