// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Content-addressed-by-handle object store (component C).
//!
//! Objects live at `<root>/<chat_id>/<handle>/<filename>`. The handle is a
//! random 256-bit value, hex-encoded — not a digest of the content — so two
//! uploads of identical bytes get distinct handles and distinct download
//! quotas. Quota/expiry enforcement is the metadata index's job
//! ([`crate::infrastructure::index`]); this module only moves bytes.

use std::path::PathBuf;

use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Bounded-memory streaming chunk size (spec §5: "chunked, default 8 KiB").
const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: chat={chat_id} handle={handle} filename={filename}")]
    NotFound {
        chat_id: String,
        handle: String,
        filename: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ObjectStore {
    root: PathBuf,
}

/// A write in progress under a freshly minted handle. Created by
/// [`ObjectStore::begin_put`]; callers stream chunks to it with
/// [`PendingWrite::write_chunk`] and either [`PendingWrite::finish`] or
/// [`PendingWrite::abort`] it, so partial writes never leave an orphaned
/// handle directory behind.
pub struct PendingWrite {
    handle: String,
    object_dir: PathBuf,
    file: tokio::fs::File,
}

impl PendingWrite {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ObjectStoreError> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<String, ObjectStoreError> {
        self.file.flush().await?;
        Ok(self.handle)
    }

    pub async fn abort(self) {
        let _ = tokio::fs::remove_dir_all(&self.object_dir).await;
    }
}

impl ObjectStore {
    /// Opens the store rooted at `root`, creating it (and verifying it's
    /// writable) if absent.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ObjectStoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let probe = root.join(".sandboxd-write-test");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;

        Ok(Self { root })
    }

    fn path_for(&self, chat_id: &str, handle: &str, filename: &str) -> PathBuf {
        self.root.join(chat_id).join(handle).join(filename)
    }

    /// Opens a streaming write under a freshly minted handle. The caller
    /// drives the chunking (e.g. a multipart field read loop); the handle
    /// directory is created up front so [`PendingWrite::abort`] always has
    /// something to clean up on a failed or rejected upload.
    pub async fn begin_put(&self, chat_id: &str, filename: &str) -> Result<PendingWrite, ObjectStoreError> {
        let handle = new_handle();
        let object_dir = self.root.join(chat_id).join(&handle);
        tokio::fs::create_dir_all(&object_dir).await?;

        let file_path = object_dir.join(filename);
        let file = tokio::fs::File::create(&file_path).await?;

        Ok(PendingWrite { handle, object_dir, file })
    }

    /// Streams `reader` to a freshly minted handle in bounded-memory chunks
    /// (spec §5) and returns it. Cleans up the partially written directory
    /// on failure so a store never accumulates orphaned handle directories.
    pub async fn put<R>(&self, chat_id: &str, filename: &str, reader: &mut R) -> Result<String, ObjectStoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut writer = self.begin_put(chat_id, filename).await?;
        let mut buf = [0u8; CHUNK_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    writer.abort().await;
                    return Err(ObjectStoreError::Io(e));
                }
            };

            if let Err(e) = writer.write_chunk(&buf[..n]).await {
                writer.abort().await;
                return Err(e);
            }
        }

        writer.finish().await
    }

    /// Opens the object for a bounded-memory streaming read, independent of
    /// any download-quota bookkeeping. Callers that must honor quota (the
    /// public download route, spec §7) call
    /// [`crate::infrastructure::index::FileIndex::check_and_decrement`]
    /// first; the execution pipeline's own read-back of files a sandbox just
    /// produced bypasses quota deliberately (design note §9).
    pub async fn read_for_pipeline(
        &self,
        chat_id: &str,
        handle: &str,
        filename: &str,
    ) -> Result<tokio::fs::File, ObjectStoreError> {
        let path = self.path_for(chat_id, handle, filename);
        tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::NotFound {
                    chat_id: chat_id.to_string(),
                    handle: handle.to_string(),
                    filename: filename.to_string(),
                }
            } else {
                ObjectStoreError::Io(e)
            }
        })
    }

    pub async fn exists(&self, chat_id: &str, handle: &str, filename: &str) -> bool {
        tokio::fs::try_exists(self.path_for(chat_id, handle, filename))
            .await
            .unwrap_or(false)
    }
}

fn new_handle() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
