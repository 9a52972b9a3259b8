// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Docker-backed [`ClusterClient`] (component D).
//!
//! Spawns one container per sandbox lease. `wait` polls container inspect
//! state until the container is running and has an IP address on the
//! configured network, which is this service's stand-in for a Kubernetes
//! "Ready" condition (design note §9: generalising the pod model).

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{CreateContainerOptions, RemoveContainerOptions, StartContainerOptions};
use bollard::Docker;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::cluster::{ClusterClient, ClusterError, Condition};
use crate::domain::sandbox::{ContainerId, ContainerSpec, SandboxContainer};

pub struct DockerClusterClient {
    docker: Docker,
    network_mode: Option<String>,
}

impl DockerClusterClient {
    pub fn connect(socket_path: Option<&str>, network_mode: Option<String>) -> Result<Self, ClusterError> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ClusterError::Backend(format!("connecting to Docker at {path}: {e}")))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| ClusterError::Backend(format!("connecting to Docker: {e}")))?,
        };
        Ok(Self { docker, network_mode })
    }

    pub async fn healthcheck(&self) -> Result<(), ClusterError> {
        self.docker
            .ping()
            .await
            .map_err(|e| ClusterError::Backend(format!("Docker daemon unreachable: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for DockerClusterClient {
    async fn get_self(&self) -> Result<String, ClusterError> {
        // Docker sets the container's hostname to its short container ID by
        // default; this process only needs a stable owner reference, not a
        // fully resolved identity.
        std::env::var("HOSTNAME")
            .map_err(|_| ClusterError::Backend("HOSTNAME unset; not running inside a container".into()))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, ClusterError> {
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let mut labels = std::collections::HashMap::new();
        if let Some(owner) = &spec.owner {
            labels.insert("sandboxd.owner".to_string(), owner.clone());
        }

        let host_config = bollard::service::HostConfig {
            network_mode: self.network_mode.clone(),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ClusterError::SpawnFailed(e.to_string()))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| ClusterError::SpawnFailed(format!("starting container {}: {e}", created.id)))?;

        debug!(container_id = %created.id, "created sandbox container");
        Ok(ContainerId(created.id))
    }

    async fn wait(
        &self,
        id: &ContainerId,
        condition: Condition,
        timeout: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<SandboxContainer, ClusterError> {
        let Condition::Ready = condition;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }

            let inspect = self
                .docker
                .inspect_container(&id.0, None)
                .await
                .map_err(|e| ClusterError::NotFound(format!("{}: {e}", id.0)))?;

            let running = inspect
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false);

            let address = inspect.network_settings.as_ref().and_then(|net| {
                net.networks.as_ref().and_then(|networks| {
                    networks
                        .values()
                        .find_map(|n| n.ip_address.clone())
                        .filter(|ip| !ip.is_empty())
                })
            });

            if let (true, Some(address)) = (running, address) {
                info!(container_id = %id.0, %address, "sandbox container ready");
                return Ok(SandboxContainer {
                    id: id.clone(),
                    address,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::WaitTimeout(id.0.clone()));
            }

            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_millis(100)) => {}
                _ = cancel.cancelled() => return Err(ClusterError::Cancelled),
            }
        }
    }

    async fn delete(&self, id: &ContainerId) -> Result<(), ClusterError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(&id.0, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => {
                warn!(container_id = %id.0, error = %e, "failed to delete sandbox container");
                Err(ClusterError::Backend(e.to_string()))
            }
        }
    }
}
