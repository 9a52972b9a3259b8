// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! `SandboxContainer` — the transient, single-use isolation boundary
//! leased by the execution pipeline (spec §3).

use serde::{Deserialize, Serialize};

/// Identity of a spawned sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A warm, Ready sandbox container handed out of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxContainer {
    pub id: ContainerId,
    /// Routable address of the in-container runner, e.g. `172.17.0.4`.
    pub address: String,
}

impl SandboxContainer {
    /// `http://<address>:8000` — the in-container runner contract (spec §6).
    /// If `address` already carries a port (used by tests to point at an
    /// ephemeral-port stub runner), it is not overridden.
    pub fn runner_base_url(&self) -> String {
        if self.address.contains(':') {
            format!("http://{}", self.address)
        } else {
            format!("http://{}:8000", self.address)
        }
    }
}

/// Declarative spec for spawning one sandbox container (spec §4.E step 2-3).
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Opaque identity of the service's own container/pod, attached as an
    /// owner reference so the orchestrator can cascade-delete leased
    /// sandboxes if the service itself goes away.
    pub owner: Option<String>,
}
