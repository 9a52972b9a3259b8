// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! `ClusterClient` — the narrow façade over the container-orchestration
//! cluster (spec §4.D). A real implementation talks to the orchestrator's
//! API (here: Docker, via [`crate::infrastructure::cluster_docker`]); a fake
//! implementation backs unit tests of the pool manager and pipeline
//! (design note §9: "a capability interface ... with a real implementation
//! ... and a fake implementation for tests").

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::sandbox::{ContainerId, ContainerSpec, SandboxContainer};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to spawn container: {0}")]
    SpawnFailed(String),

    #[error("timed out waiting for container {0} to become ready")]
    WaitTimeout(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("cluster operation cancelled")]
    Cancelled,

    #[error("cluster backend error: {0}")]
    Backend(String),
}

/// Readiness condition a caller can wait for (spec §4.D `wait`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Ready,
}

/// Capability interface over the container-orchestration cluster.
///
/// All operations are asynchronous and cancellable via `CancellationToken`;
/// implementations must honor cancellation promptly (spec §5).
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Resolve the service's own container identity (used once at startup
    /// to set owner references on spawned sandboxes).
    async fn get_self(&self) -> Result<String, ClusterError>;

    /// Create a container from a declarative spec.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, ClusterError>;

    /// Block until the container satisfies `condition` or `timeout` elapses.
    async fn wait(
        &self,
        id: &ContainerId,
        condition: Condition,
        timeout: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<SandboxContainer, ClusterError>;

    /// Idempotent, best-effort deletion.
    async fn delete(&self, id: &ContainerId) -> Result<(), ClusterError>;
}
