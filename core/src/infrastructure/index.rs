// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! File-metadata index (component B).
//!
//! A durable, crash-consistent index over `(chat_id, file_hash, filename) ->
//! (remaining_downloads, expires_at)`, backed by an embedded SQLite database
//! at `<file_storage_path>/file_mgmt_db.sqlite3` (spec §6 "Persisted
//! state"), mirroring the schema of the original `file_meta.py` with an
//! added `expires_at` column for time-based expiry.
//!
//! `check_and_decrement` is the one operation spec §4.B and §5 require to be
//! atomic; it runs inside a single `sqlx::Transaction` so two concurrent
//! downloads of a record with `remaining_downloads = 1` can never both
//! succeed.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::domain::file_record::{FileKey, FileRecord};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("file not found: {0:?}")]
    NotFound(FileKey),

    #[error("file expired or over download quota: {0:?}")]
    Expired(FileKey),

    #[error("invalid expiry date")]
    InvalidDate,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct FileIndex {
    pool: SqlitePool,
}

impl FileIndex {
    /// Opens (creating if absent) the SQLite database at
    /// `<storage_root>/file_mgmt_db.sqlite3`, enables WAL journaling, and
    /// ensures the schema exists.
    pub async fn connect(storage_root: &Path) -> Result<Self, IndexError> {
        tokio::fs::create_dir_all(storage_root)
            .await
            .map_err(|e| IndexError::Database(sqlx::Error::Io(e)))?;

        let db_path = storage_root.join("file_mgmt_db.sqlite3");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .map_err(IndexError::Database)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                file_hash  TEXT NOT NULL,
                chat_id    TEXT NOT NULL,
                filename   TEXT NOT NULL,
                remaining  INTEGER,
                expires_at TEXT,
                PRIMARY KEY (file_hash, chat_id, filename)
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// In-memory database, for unit tests.
    pub async fn connect_in_memory() -> Result<Self, IndexError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                file_hash  TEXT NOT NULL,
                chat_id    TEXT NOT NULL,
                filename   TEXT NOT NULL,
                remaining  INTEGER,
                expires_at TEXT,
                PRIMARY KEY (file_hash, chat_id, filename)
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Upserts a record. `max_downloads == Some(0)` or `None` means
    /// unlimited; `expires_in` is resolved to an absolute timestamp once,
    /// at registration time.
    pub async fn register(
        &self,
        key: &FileKey,
        max_downloads: Option<u32>,
        expires_in: Option<Duration>,
    ) -> Result<(), IndexError> {
        let remaining = match max_downloads {
            None | Some(0) => None,
            Some(n) => Some(n as i64),
        };
        let expires_at = expires_in.map(|d| Utc::now() + d);

        sqlx::query(
            r#"
            INSERT INTO files (file_hash, chat_id, filename, remaining, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(file_hash, chat_id, filename) DO UPDATE SET
                remaining = excluded.remaining,
                expires_at = excluded.expires_at;
            "#,
        )
        .bind(&key.file_hash)
        .bind(&key.chat_id)
        .bind(&key.filename)
        .bind(remaining)
        .bind(expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomic check-and-decrement (spec §4.B).
    ///
    /// Expired-by-time and exhausted-by-quota both tombstone the record
    /// (`remaining := 0`) and return `Expired`; a missing key returns
    /// `NotFound`. The two are reported identically to HTTP clients (spec
    /// §7) but remain distinguishable here for callers, such as the
    /// reaper's tests, that care.
    pub async fn check_and_decrement(&self, key: &FileKey) -> Result<FileRecord, IndexError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<i64>, Option<String>)> = sqlx::query_as(
            "SELECT remaining, expires_at FROM files WHERE file_hash = ?1 AND chat_id = ?2 AND filename = ?3",
        )
        .bind(&key.file_hash)
        .bind(&key.chat_id)
        .bind(&key.filename)
        .fetch_optional(&mut *tx)
        .await?;

        let (remaining, expires_at_raw) = row.ok_or_else(|| IndexError::NotFound(key.clone()))?;
        let expires_at = parse_expiry(expires_at_raw.as_deref())?;

        let now = Utc::now();
        let time_expired = expires_at.map(|t| t <= now).unwrap_or(false);
        let quota_exhausted = matches!(remaining, Some(0));

        if time_expired || quota_exhausted {
            sqlx::query(
                "UPDATE files SET remaining = 0 WHERE file_hash = ?1 AND chat_id = ?2 AND filename = ?3",
            )
            .bind(&key.file_hash)
            .bind(&key.chat_id)
            .bind(&key.filename)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Err(IndexError::Expired(key.clone()));
        }

        let new_remaining = match remaining {
            None => None,
            Some(n) => {
                let decremented = n - 1;
                sqlx::query(
                    "UPDATE files SET remaining = ?1 WHERE file_hash = ?2 AND chat_id = ?3 AND filename = ?4",
                )
                .bind(decremented)
                .bind(&key.file_hash)
                .bind(&key.chat_id)
                .bind(&key.filename)
                .execute(&mut *tx)
                .await?;
                Some(decremented)
            }
        };

        tx.commit().await?;

        Ok(FileRecord {
            key: key.clone(),
            remaining_downloads: new_remaining,
            expires_at,
        })
    }

    /// Sets `remaining_downloads := 0`. Fails `NotFound` if the key doesn't exist.
    pub async fn expire(&self, key: &FileKey) -> Result<(), IndexError> {
        let result = sqlx::query(
            "UPDATE files SET remaining = 0 WHERE file_hash = ?1 AND chat_id = ?2 AND filename = ?3",
        )
        .bind(&key.file_hash)
        .bind(&key.chat_id)
        .bind(&key.filename)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IndexError::NotFound(key.clone()));
        }
        Ok(())
    }

    pub async fn get_info(&self, key: &FileKey) -> Result<FileRecord, IndexError> {
        let row: Option<(Option<i64>, Option<String>)> = sqlx::query_as(
            "SELECT remaining, expires_at FROM files WHERE file_hash = ?1 AND chat_id = ?2 AND filename = ?3",
        )
        .bind(&key.file_hash)
        .bind(&key.chat_id)
        .bind(&key.filename)
        .fetch_optional(&self.pool)
        .await?;

        let (remaining, expires_at_raw) = row.ok_or_else(|| IndexError::NotFound(key.clone()))?;
        Ok(FileRecord {
            key: key.clone(),
            remaining_downloads: remaining,
            expires_at: parse_expiry(expires_at_raw.as_deref())?,
        })
    }

    /// Sweeps every record with `expires_at <= now && remaining != 0` and
    /// tombstones it. Physical blob deletion is intentionally deferred
    /// (design note §9 item 2). Returns the number of records tombstoned.
    pub async fn cleanup_expired(&self) -> Result<u64, IndexError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE files SET remaining = 0 WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND (remaining IS NULL OR remaining != 0)",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn parse_expiry(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, IndexError> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| IndexError::InvalidDate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: &str) -> FileKey {
        FileKey::new(format!("hash-{n}"), "chat1", "file.txt")
    }

    #[tokio::test]
    async fn register_then_check_and_decrement_unlimited() {
        let index = FileIndex::connect_in_memory().await.unwrap();
        let k = key("1");
        index.register(&k, None, None).await.unwrap();

        let record = index.check_and_decrement(&k).await.unwrap();
        assert_eq!(record.remaining_downloads, None);
        // Unlimited never exhausts.
        index.check_and_decrement(&k).await.unwrap();
    }

    #[tokio::test]
    async fn quota_of_two_allows_exactly_two_downloads() {
        let index = FileIndex::connect_in_memory().await.unwrap();
        let k = key("2");
        index.register(&k, Some(2), None).await.unwrap();

        index.check_and_decrement(&k).await.unwrap();
        index.check_and_decrement(&k).await.unwrap();
        let err = index.check_and_decrement(&k).await.unwrap_err();
        assert!(matches!(err, IndexError::Expired(_)));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let index = FileIndex::connect_in_memory().await.unwrap();
        let err = index.check_and_decrement(&key("missing")).await.unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
    }

    #[tokio::test]
    async fn expire_tombstones_record() {
        let index = FileIndex::connect_in_memory().await.unwrap();
        let k = key("3");
        index.register(&k, None, None).await.unwrap();
        index.expire(&k).await.unwrap();

        let err = index.check_and_decrement(&k).await.unwrap_err();
        assert!(matches!(err, IndexError::Expired(_)));
    }

    #[tokio::test]
    async fn expire_missing_key_fails() {
        let index = FileIndex::connect_in_memory().await.unwrap();
        let err = index.expire(&key("missing")).await.unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
    }

    #[tokio::test]
    async fn time_based_expiry_blocks_download() {
        let index = FileIndex::connect_in_memory().await.unwrap();
        let k = key("4");
        index
            .register(&k, None, Some(Duration::milliseconds(1)))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = index.check_and_decrement(&k).await.unwrap_err();
        assert!(matches!(err, IndexError::Expired(_)));
    }

    #[tokio::test]
    async fn cleanup_expired_sweeps_time_based_records_without_touching_live_ones() {
        let index = FileIndex::connect_in_memory().await.unwrap();
        let expired_key = key("expired");
        let live_key = key("live");

        index
            .register(&expired_key, None, Some(Duration::milliseconds(1)))
            .await
            .unwrap();
        index
            .register(&live_key, None, Some(Duration::hours(1)))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let swept = index.cleanup_expired().await.unwrap();
        assert_eq!(swept, 1);

        let live = index.get_info(&live_key).await.unwrap();
        assert_eq!(live.remaining_downloads, None);
    }

    #[tokio::test]
    async fn concurrent_downloads_allow_exactly_min_n_k() {
        use std::sync::Arc;

        let index = Arc::new(FileIndex::connect_in_memory().await.unwrap());
        let k = key("concurrent");
        index.register(&k, Some(3), None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let index = index.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move { index.check_and_decrement(&k).await.is_ok() }));
        }

        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 3);
    }
}
