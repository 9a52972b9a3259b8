// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Executor pool manager (component E).
//!
//! Keeps a queue `Q` of Ready sandbox containers at a target depth `T`,
//! tracking an in-flight spawn counter `S` so concurrent replenishment never
//! overshoots the target (invariant P1: `|Q| + S <= T`). Containers only
//! enter the queue after `ClusterClient::wait` confirms `Condition::Ready`
//! (P2). Grounded in the original's `fill_executor_pod_queue` /
//! `spawn_executor_pod` / `executor_pod` trio.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::cluster::{ClusterClient, ClusterError, Condition};
use crate::domain::sandbox::{ContainerSpec, SandboxContainer};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

const READY_TIMEOUT: Duration = Duration::from_secs(60);
const SPAWN_RETRY_ATTEMPTS: u32 = 3;
const SPAWN_RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(4);
const SPAWN_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);

pub struct PoolManager {
    cluster: Arc<dyn ClusterClient>,
    queue: Mutex<VecDeque<SandboxContainer>>,
    spawning: AtomicU64,
    target_depth: u64,
    executor_image: String,
    name_prefix: String,
    owner: Option<String>,
}

impl PoolManager {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        target_depth: u64,
        executor_image: String,
        name_prefix: String,
        owner: Option<String>,
    ) -> Self {
        Self {
            cluster,
            queue: Mutex::new(VecDeque::new()),
            spawning: AtomicU64::new(0),
            target_depth,
            executor_image,
            name_prefix,
            owner,
        }
    }

    /// Current queue depth, exposed for the "pool replenishment" test
    /// scenario (spec §8 scenario 6) and for metrics.
    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn spawning_count(&self) -> u64 {
        self.spawning.load(Ordering::SeqCst)
    }

    /// Hands out a Ready container: pops the queue if non-empty, otherwise
    /// spawns one inline. Either way, kicks off a detached replenishment
    /// pass so the queue trends back toward `target_depth` (invariant P1).
    pub async fn lease(self: &Arc<Self>) -> Result<SandboxContainer, PoolError> {
        let leased = {
            let mut queue = self.queue.lock().await;
            queue.pop_front()
        };

        let container = match leased {
            Some(c) => c,
            None => self.spawn_one().await?,
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.replenish().await;
        });

        Ok(container)
    }

    /// Spawns `target_depth - |Q| - S` containers concurrently, pushing each
    /// onto the queue as it becomes Ready. Never lets `|Q| + S` exceed
    /// `target_depth`, since the to-spawn count is reserved against `S`
    /// before any task runs.
    pub async fn replenish(&self) {
        let current_depth = self.queue.lock().await.len() as u64;
        let in_flight = self.spawning.load(Ordering::SeqCst);
        let to_spawn = self.target_depth.saturating_sub(current_depth + in_flight);

        if to_spawn == 0 {
            return;
        }

        self.spawning.fetch_add(to_spawn, Ordering::SeqCst);
        info!(
            target_depth = self.target_depth,
            current_depth, in_flight, to_spawn, "replenishing executor pool"
        );

        let mut spawned = 0u64;
        let mut handles = Vec::with_capacity(to_spawn as usize);
        for _ in 0..to_spawn {
            handles.push(self.spawn_one());
        }

        let results = futures::future::join_all(handles).await;
        for result in results {
            self.spawning.fetch_sub(1, Ordering::SeqCst);
            match result {
                Ok(container) => {
                    self.queue.lock().await.push_back(container);
                    spawned += 1;
                }
                Err(e) => error!(error = %e, "failed to spawn executor container"),
            }
        }

        let current_depth = self.queue.lock().await.len();
        info!(
            spawned,
            failed = to_spawn - spawned,
            current_depth,
            still_spawning = self.spawning.load(Ordering::SeqCst),
            "executor pool replenishment complete"
        );
    }

    /// Creates and waits for one Ready container, retrying the spawn step up
    /// to `SPAWN_RETRY_ATTEMPTS` times with exponential backoff on transient
    /// cluster failures (spec §4.E step 5). Scoped to this single spawn, not
    /// the caller's queue-filling loop.
    async fn spawn_one(&self) -> Result<SandboxContainer, ClusterError> {
        let mut backoff = SPAWN_RETRY_INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=SPAWN_RETRY_ATTEMPTS {
            match self.spawn_attempt().await {
                Ok(container) => return Ok(container),
                Err(e) => {
                    warn!(attempt, error = %e, "transient failure spawning executor container, retrying");
                    last_err = Some(e);
                    if attempt < SPAWN_RETRY_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(SPAWN_RETRY_MAX_BACKOFF);
                    }
                }
            }
        }

        Err(last_err.unwrap_or(ClusterError::SpawnFailed("exhausted retries".into())))
    }

    async fn spawn_attempt(&self) -> Result<SandboxContainer, ClusterError> {
        let suffix = random_suffix(6);
        let name = format!("{}{}", self.name_prefix, suffix);

        let spec = ContainerSpec {
            name,
            image: self.executor_image.clone(),
            owner: self.owner.clone(),
        };

        let id = self.cluster.create(&spec).await?;

        let cancel = CancellationToken::new();
        match self.cluster.wait(&id, Condition::Ready, READY_TIMEOUT, &cancel).await {
            Ok(container) => Ok(container),
            Err(e) => {
                if let Err(delete_err) = self.cluster.delete(&id).await {
                    warn!(container_id = %id, error = %delete_err, "failed to clean up unready container");
                }
                Err(e)
            }
        }
    }

    /// Deletes a leased container unconditionally (invariant P3). Called by
    /// the execution pipeline once it is done with a lease, success or not.
    pub async fn release(&self, container: SandboxContainer) {
        if let Err(e) = self.cluster.delete(&container.id).await {
            warn!(container_id = %container.id, error = %e, "failed to delete leased container");
        }
    }
}

fn random_suffix(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cluster_fake::FakeClusterClient;

    fn make_pool(target: u64) -> Arc<PoolManager> {
        Arc::new(PoolManager::new(
            Arc::new(FakeClusterClient::new()),
            target,
            "runner:latest".into(),
            "sandbox-".into(),
            None,
        ))
    }

    #[tokio::test]
    async fn replenish_fills_queue_to_target_depth() {
        let pool = make_pool(5);
        pool.replenish().await;
        assert_eq!(pool.queue_depth().await, 5);
        assert_eq!(pool.spawning_count(), 0);
    }

    #[tokio::test]
    async fn replenish_is_a_no_op_once_at_target() {
        let pool = make_pool(3);
        pool.replenish().await;
        pool.replenish().await;
        assert_eq!(pool.queue_depth().await, 3);
    }

    #[tokio::test]
    async fn lease_pops_from_queue_and_triggers_replenishment() {
        let pool = make_pool(3);
        pool.replenish().await;
        assert_eq!(pool.queue_depth().await, 3);

        let _container = pool.lease().await.unwrap();
        // One popped immediately; replenishment runs detached.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.queue_depth().await, 3);
    }

    #[tokio::test]
    async fn lease_spawns_inline_when_queue_is_empty() {
        let pool = make_pool(0);
        let container = pool.lease().await.unwrap();
        assert!(!container.address.is_empty());
    }

    #[tokio::test]
    async fn queue_plus_spawning_never_exceeds_target() {
        let pool = make_pool(5);
        let a = pool.replenish();
        let b = pool.replenish();
        tokio::join!(a, b);
        assert!(pool.queue_depth().await as u64 + pool.spawning_count() <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_one_retries_transient_create_failures() {
        let cluster = Arc::new(FakeClusterClient::new().failing_creates(2));
        let pool = PoolManager::new(cluster, 0, "runner:latest".into(), "sandbox-".into(), None);
        let container = pool.spawn_one().await.unwrap();
        assert!(!container.address.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_one_exhausts_retries_and_fails() {
        let cluster = Arc::new(FakeClusterClient::new().failing_creates(10));
        let pool = PoolManager::new(cluster, 0, "runner:latest".into(), "sandbox-".into(), None);
        let err = pool.spawn_one().await.unwrap_err();
        assert!(matches!(err, ClusterError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn release_deletes_the_container() {
        let cluster = Arc::new(FakeClusterClient::new());
        let pool = Arc::new(PoolManager::new(
            cluster.clone(),
            1,
            "runner:latest".into(),
            "sandbox-".into(),
            None,
        ));
        pool.replenish().await;
        assert_eq!(cluster.live_count(), 1);

        let container = pool.lease().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(container).await;
        assert_eq!(cluster.live_count(), 1); // replenishment refilled one
    }
}
