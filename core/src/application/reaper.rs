// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Background reaper (component H): a supervised task that sweeps expired
//! file-metadata records on a fixed interval. Swallows errors rather than
//! panicking, per spec §4.H — a single failed sweep must not bring the
//! process down.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::infrastructure::index::FileIndex;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);

/// Runs `index.cleanup_expired()` every `interval` until the process exits.
/// Intended to be `tokio::spawn`ed once at startup (component I).
pub async fn run(index: Arc<FileIndex>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup doesn't race the
    // pool's initial replenish for I/O bandwidth.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        sweep_once(&index).await;
    }
}

async fn sweep_once(index: &FileIndex) {
    match index.cleanup_expired().await {
        Ok(count) if count > 0 => info!(swept = count, "reaper tombstoned expired file records"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "reaper sweep failed, will retry next interval"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::file_record::FileKey;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn sweep_once_tombstones_time_expired_records() {
        let index = Arc::new(FileIndex::connect_in_memory().await.unwrap());
        let key = FileKey::new("hash1", "chat1", "f.txt");
        index.register(&key, None, Some(ChronoDuration::milliseconds(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        sweep_once(&index).await;

        let record = index.get_info(&key).await.unwrap();
        assert_eq!(record.remaining_downloads, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_on_every_tick() {
        let index = Arc::new(FileIndex::connect_in_memory().await.unwrap());
        let key = FileKey::new("hash1", "chat1", "f.txt");
        index.register(&key, None, Some(ChronoDuration::milliseconds(1))).await.unwrap();

        let index_for_task = index.clone();
        let handle = tokio::spawn(async move {
            run(index_for_task, Duration::from_millis(10)).await;
        });

        tokio::time::advance(Duration::from_millis(15)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let record = index.get_info(&key).await.unwrap();
        assert_eq!(record.remaining_downloads, Some(0));

        handle.abort();
    }
}
