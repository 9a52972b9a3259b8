// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! In-memory [`ClusterClient`] used by pool-manager and pipeline tests
//! (design note §9: "a fake implementation for tests" alongside the real
//! Docker-backed one).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::cluster::{ClusterClient, ClusterError, Condition};
use crate::domain::sandbox::{ContainerId, ContainerSpec, SandboxContainer};

/// Backs every spawned container with a loopback address, never actually
/// touching a container runtime.
pub struct FakeClusterClient {
    next_id: AtomicU64,
    live: Mutex<HashSet<String>>,
    /// If set, `create` fails this many times before succeeding; exercises
    /// the pipeline's spawn-retry path.
    fail_creates: AtomicU64,
    /// If set, `wait` never becomes ready, exercising wait-timeout handling.
    never_ready: bool,
    /// Address handed back by `wait`; defaults to loopback, overridable so
    /// integration tests can point a leased container at a stub runner
    /// bound to an ephemeral port.
    address: String,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            live: Mutex::new(HashSet::new()),
            fail_creates: AtomicU64::new(0),
            never_ready: false,
            address: "127.0.0.1".to_string(),
        }
    }

    pub fn failing_creates(mut self, n: u64) -> Self {
        self.fail_creates = AtomicU64::new(n);
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl Default for FakeClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get_self(&self) -> Result<String, ClusterError> {
        Ok("fake-self".to_string())
    }

    async fn create(&self, _spec: &ContainerSpec) -> Result<ContainerId, ClusterError> {
        if self.fail_creates.load(Ordering::SeqCst) > 0 {
            self.fail_creates.fetch_sub(1, Ordering::SeqCst);
            return Err(ClusterError::SpawnFailed("fake spawn failure".into()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{n}");
        self.live.lock().unwrap().insert(id.clone());
        Ok(ContainerId(id))
    }

    async fn wait(
        &self,
        id: &ContainerId,
        condition: Condition,
        timeout: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<SandboxContainer, ClusterError> {
        let Condition::Ready = condition;

        if !self.live.lock().unwrap().contains(&id.0) {
            return Err(ClusterError::NotFound(id.0.clone()));
        }

        if self.never_ready {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => return Err(ClusterError::WaitTimeout(id.0.clone())),
                _ = cancel.cancelled() => return Err(ClusterError::Cancelled),
            }
        }

        Ok(SandboxContainer {
            id: id.clone(),
            address: self.address.clone(),
        })
    }

    async fn delete(&self, id: &ContainerId) -> Result<(), ClusterError> {
        self.live.lock().unwrap().remove(&id.0);
        Ok(())
    }
}
