// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Process bootstrap (component I): parses configuration, wires the
//! domain/infrastructure/application layers together, spawns the
//! background reaper and an initial pool replenishment, then serves the
//! HTTP ingress until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ipnetwork::IpNetwork;
use tracing::{info, warn};

use sandboxd_core::application::pipeline::ExecutionPipeline;
use sandboxd_core::application::pool_manager::PoolManager;
use sandboxd_core::application::reaper;
use sandboxd_core::domain::cluster::ClusterClient;
use sandboxd_core::infrastructure::cluster_docker::DockerClusterClient;
use sandboxd_core::infrastructure::index::FileIndex;
use sandboxd_core::infrastructure::object_store::ObjectStore;
use sandboxd_core::presentation::http::{self, AppState};
use sandboxd_core::presentation::origin_guard::OriginGuard;

/// Configuration for the sandboxed code-execution service.
#[derive(Parser, Debug)]
#[command(name = "sandboxd")]
#[command(version, about, long_about = None)]
struct Config {
    /// Address the HTTP ingress binds to.
    #[arg(long, env = "APP_HTTP_LISTEN_ADDR", default_value = "0.0.0.0:50081")]
    http_listen_addr: SocketAddr,

    /// Reserved for a future gRPC ingress; currently logged and otherwise inert.
    #[arg(long, env = "APP_GRPC_ENABLED", default_value_t = false)]
    grpc_enabled: bool,

    // Accepted and validated for forward compatibility with a gRPC ingress,
    // but unused until one exists.
    #[allow(dead_code)]
    #[arg(long, env = "APP_GRPC_LISTEN_ADDR", default_value = "0.0.0.0:50051")]
    grpc_listen_addr: String,

    #[allow(dead_code)]
    #[arg(long, env = "APP_GRPC_TLS_CERT")]
    grpc_tls_cert: Option<PathBuf>,

    #[allow(dead_code)]
    #[arg(long, env = "APP_GRPC_TLS_CERT_KEY")]
    grpc_tls_cert_key: Option<PathBuf>,

    #[allow(dead_code)]
    #[arg(long, env = "APP_GRPC_TLS_CA_CERT")]
    grpc_tls_ca_cert: Option<PathBuf>,

    /// Root directory for the object store and the file-metadata database.
    #[arg(long, env = "APP_FILE_STORAGE_PATH", default_value = "/tmp/sandboxd")]
    file_storage_path: PathBuf,

    /// Image reference used to spawn executor containers.
    #[arg(long, env = "APP_EXECUTOR_IMAGE", default_value = "localhost/sandboxd-executor:local")]
    executor_image: String,

    /// Target depth of the warm executor pool.
    #[arg(long, env = "APP_POOL_TARGET_DEPTH", default_value_t = 5)]
    pool_target_depth: u64,

    /// Name prefix given to spawned executor containers.
    #[arg(long, env = "APP_CONTAINER_NAME_PREFIX", default_value = "sandbox-")]
    container_name_prefix: String,

    /// Unix socket to reach the Docker daemon at; omit for the platform default.
    #[arg(long, env = "APP_DOCKER_SOCKET_PATH")]
    docker_socket_path: Option<String>,

    /// Docker network mode attached to spawned containers (e.g. `bridge`).
    #[arg(long, env = "APP_DOCKER_NETWORK_MODE")]
    docker_network_mode: Option<String>,

    /// Whether `/v1/execute` and `/v1/upload` are reachable from any origin.
    #[arg(long, env = "APP_PUBLIC_SPAWN_ENABLED", default_value_t = false)]
    public_spawn_enabled: bool,

    /// Host headers allowed to reach spawn-bearing endpoints when
    /// `public_spawn_enabled` is false.
    #[arg(long, env = "APP_INTERNAL_HOST_ALLOWLIST", value_delimiter = ',')]
    internal_host_allowlist: Vec<String>,

    /// CIDR blocks allowed to reach spawn-bearing endpoints when
    /// `public_spawn_enabled` is false.
    #[arg(
        long,
        env = "APP_INTERNAL_IP_ALLOWLIST",
        value_delimiter = ',',
        value_parser = parse_ip_network
    )]
    internal_ip_allowlist: Vec<IpNetwork>,

    /// Whether loopback callers bypass the host/IP allowlists.
    #[arg(long, env = "APP_TRUST_LOOPBACK", default_value_t = true)]
    trust_loopback: bool,

    /// Reject `/v1/execute` requests that carry no `chat_id`.
    #[arg(long, env = "APP_REQUIRE_CHAT_ID", default_value_t = true)]
    require_chat_id: bool,

    /// Default download quota applied to files the pipeline harvests;
    /// `0` means unlimited.
    #[arg(long, env = "APP_GLOBAL_MAX_DOWNLOADS", default_value_t = 0)]
    global_max_downloads: u32,

    /// Upload size cap, e.g. `1Gi`, `512Mi`, or a bare byte count.
    #[arg(long, env = "APP_FILE_SIZE_LIMIT", default_value = "1Gi")]
    file_size_limit: String,

    /// Path to a JSON-schema document validating normalised execute payloads.
    #[arg(long, env = "APP_SCHEMA_PATH")]
    schema_path: Option<PathBuf>,

    /// Interval, in seconds, between expired-file sweeps.
    #[arg(long, env = "APP_REAPER_INTERVAL_SECS", default_value_t = reaper::DEFAULT_INTERVAL.as_secs())]
    reaper_interval_secs: u64,

    /// Tracing filter directive, e.g. `info` or `sandboxd_core=debug`.
    #[arg(long, env = "APP_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_ip_network(s: &str) -> Result<IpNetwork, String> {
    s.parse().map_err(|e| format!("invalid CIDR {s:?}: {e}"))
}

/// Parses `<integer>[K|Ki|M|Mi|G|Gi]` byte-count literals (decimal units are
/// powers of 1000, `i`-suffixed units are powers of 1024).
fn parse_size(spec: &str) -> Result<u64, String> {
    let spec = spec.trim();
    let (digits, unit) = match spec.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => spec.split_at(i),
        None => (spec, ""),
    };

    let amount: u64 = digits.parse().map_err(|_| format!("invalid size literal {spec:?}"))?;
    let multiplier: u64 = match unit {
        "" | "B" => 1,
        "K" => 1_000,
        "Ki" => 1_024,
        "M" => 1_000_000,
        "Mi" => 1_024 * 1_024,
        "G" => 1_000_000_000,
        "Gi" => 1_024 * 1_024 * 1_024,
        other => return Err(format!("unsupported size unit {other:?}")),
    };

    Ok(amount * multiplier)
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("failed to build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(&config.log_level)?;

    if config.grpc_enabled {
        warn!("APP_GRPC_ENABLED is set but this build only serves HTTP; ignoring");
    }

    let file_size_limit_bytes =
        parse_size(&config.file_size_limit).map_err(|e| anyhow::anyhow!("APP_FILE_SIZE_LIMIT: {e}"))?;

    let index = Arc::new(
        FileIndex::connect(&config.file_storage_path)
            .await
            .context("opening file-metadata index")?,
    );
    let object_store = Arc::new(
        ObjectStore::new(config.file_storage_path.clone())
            .await
            .context("opening object store")?,
    );

    let cluster = Arc::new(
        DockerClusterClient::connect(config.docker_socket_path.as_deref(), config.docker_network_mode.clone())
            .context("connecting to the Docker daemon")?,
    );
    cluster.healthcheck().await.context("Docker daemon healthcheck failed")?;

    let owner = cluster.get_self().await.ok();
    if owner.is_none() {
        info!("HOSTNAME unset; spawned containers will carry no owner reference");
    }

    let pool = Arc::new(PoolManager::new(
        cluster,
        config.pool_target_depth,
        config.executor_image.clone(),
        config.container_name_prefix.clone(),
        owner,
    ));

    let global_max_downloads = (config.global_max_downloads > 0).then_some(config.global_max_downloads);
    let pipeline = Arc::new(ExecutionPipeline::new(
        pool.clone(),
        object_store.clone(),
        index.clone(),
        global_max_downloads,
    ));

    let schema = load_schema(config.schema_path.as_deref())
        .await
        .context("loading APP_SCHEMA_PATH")?
        .map(Arc::new);

    let origin_guard = Arc::new(OriginGuard::new(
        config.public_spawn_enabled,
        config.internal_host_allowlist.clone(),
        config.internal_ip_allowlist.clone(),
        config.trust_loopback,
    ));

    let state = AppState {
        pipeline,
        index: index.clone(),
        object_store,
        origin_guard,
        schema,
        file_size_limit_bytes,
        require_chat_id: config.require_chat_id,
    };

    tokio::spawn(reaper::run(index, Duration::from_secs(config.reaper_interval_secs)));
    pool.replenish().await;
    info!(target_depth = config.pool_target_depth, "executor pool primed");

    let listener = tokio::net::TcpListener::bind(config.http_listen_addr)
        .await
        .with_context(|| format!("binding {}", config.http_listen_addr))?;
    info!(addr = %config.http_listen_addr, "sandboxd listening");

    axum::serve(
        listener,
        http::app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    Ok(())
}

async fn load_schema(path: Option<&std::path::Path>) -> Result<Option<serde_json::Value>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading schema file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw).context("schema file is not valid JSON")?;
    Ok(Some(value))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining in-flight requests");
}
