// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Execution pipeline (component F): stage inputs, invoke the in-container
//! runner, optionally harvest outputs, always retire the container.
//!
//! Grounded directly in the original's `KubernetesCodeExecutor.execute`.
//! Design Note §9 item 1 is resolved here: staging reads use
//! [`crate::infrastructure::object_store::ObjectStore::read_for_pipeline`],
//! which does not consult the download quota that `/v1/download` enforces.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use futures::TryStreamExt;
use thiserror::Error;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{info, warn};

use crate::application::pool_manager::{PoolError, PoolManager};
use crate::domain::cluster::ClusterError;
use crate::domain::execution::{ExecutionRequest, ExecutionResult, RunnerExecuteRequest, RunnerExecuteResponse};
use crate::domain::file_record::{FileKey, FileMetadataView};
use crate::domain::sandbox::SandboxContainer;
use crate::infrastructure::index::{FileIndex, IndexError};
use crate::infrastructure::object_store::{ObjectStore, ObjectStoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to lease an executor container: {0}")]
    Pool(#[from] PoolError),

    #[error("object store error: {0}")]
    Storage(#[from] ObjectStoreError),

    #[error("metadata index error: {0}")]
    Index(#[from] IndexError),

    #[error("in-container runner error: {0}")]
    Runner(String),
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(4);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);

pub struct ExecutionPipeline {
    pool: Arc<PoolManager>,
    object_store: Arc<ObjectStore>,
    index: Arc<FileIndex>,
    http: reqwest::Client,
    global_max_downloads: Option<u32>,
}

impl ExecutionPipeline {
    pub fn new(
        pool: Arc<PoolManager>,
        object_store: Arc<ObjectStore>,
        index: Arc<FileIndex>,
        global_max_downloads: Option<u32>,
    ) -> Self {
        Self {
            pool,
            object_store,
            index,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client builder should not fail with static config"),
            global_max_downloads,
        }
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, PipelineError> {
        let chat_id = request.chat_id.clone().unwrap_or_else(|| "default".to_string());

        let container = self.lease_with_retry().await?;
        info!(container_id = %container.id, %chat_id, "leased executor container");

        let outcome = self.run_in_container(&container, &request, &chat_id).await;

        // Invariant P3: release unconditionally, independent of outcome.
        self.pool.release(container).await;

        outcome
    }

    async fn lease_with_retry(&self) -> Result<SandboxContainer, PipelineError> {
        let mut backoff = RETRY_INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            match self.pool.lease().await {
                Ok(container) => return Ok(container),
                Err(PoolError::Cluster(e)) => {
                    warn!(attempt, error = %e, "transient cluster failure leasing executor, retrying");
                    last_err = Some(ClusterError::SpawnFailed(e.to_string()));
                    if attempt < RETRY_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
                    }
                }
            }
        }

        Err(PipelineError::Pool(PoolError::Cluster(
            last_err.unwrap_or(ClusterError::SpawnFailed("exhausted retries".into())),
        )))
    }

    async fn run_in_container(
        &self,
        container: &SandboxContainer,
        request: &ExecutionRequest,
        chat_id: &str,
    ) -> Result<ExecutionResult, PipelineError> {
        let base_url = container.runner_base_url();

        self.stage_inputs(&base_url, &request.files, chat_id).await?;

        info!("requesting code execution");
        let response = self.invoke_execute(&base_url, &request.source_code, &request.env).await?;

        let mut files = HashMap::new();
        let mut files_metadata = HashMap::new();

        if request.persistent_workspace && !response.files.is_empty() {
            info!(count = response.files.len(), "harvesting changed files");
            let harvested = self.harvest_outputs(&base_url, &response.files, chat_id).await?;
            for (path, handle, metadata) in harvested {
                files_metadata.insert(path.clone(), metadata);
                files.insert(path, handle);
            }
        }

        Ok(ExecutionResult {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: response.exit_code,
            files,
            files_metadata,
            chat_id: chat_id.to_string(),
        })
    }

    async fn stage_inputs(
        &self,
        base_url: &str,
        files: &HashMap<String, String>,
        chat_id: &str,
    ) -> Result<(), PipelineError> {
        if files.is_empty() {
            return Ok(());
        }

        info!(count = files.len(), "uploading input files to executor");
        let uploads = files.iter().map(|(abs_path, handle)| {
            self.upload_one_input(base_url, abs_path, handle, chat_id)
        });
        try_join_all(uploads).await?;
        Ok(())
    }

    async fn upload_one_input(
        &self,
        base_url: &str,
        abs_path: &str,
        handle: &str,
        chat_id: &str,
    ) -> Result<(), PipelineError> {
        let filename = basename(abs_path);
        let file = self.object_store.read_for_pipeline(chat_id, handle, &filename).await?;
        let stream = ReaderStream::new(file);

        let rel_path = abs_path.strip_prefix("/workspace/").unwrap_or(abs_path);
        let url = format!("{base_url}/workspace/{rel_path}");

        self.http
            .put(&url)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::Runner(format!("uploading {abs_path}: {e}")))?;

        Ok(())
    }

    async fn invoke_execute(
        &self,
        base_url: &str,
        source_code: &str,
        env: &HashMap<String, String>,
    ) -> Result<RunnerExecuteResponse, PipelineError> {
        let body = RunnerExecuteRequest { source_code, env };

        let response = self
            .http
            .post(format!("{base_url}/execute"))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Runner(format!("POST /execute: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::Runner(format!("POST /execute returned an error status: {e}")))?;

        response
            .json::<RunnerExecuteResponse>()
            .await
            .map_err(|e| PipelineError::Runner(format!("decoding /execute response: {e}")))
    }

    async fn harvest_outputs(
        &self,
        base_url: &str,
        paths: &[String],
        chat_id: &str,
    ) -> Result<Vec<(String, String, FileMetadataView)>, PipelineError> {
        let downloads = paths.iter().map(|path| self.harvest_one(base_url, path, chat_id));
        try_join_all(downloads).await
    }

    async fn harvest_one(
        &self,
        base_url: &str,
        abs_path: &str,
        chat_id: &str,
    ) -> Result<(String, String, FileMetadataView), PipelineError> {
        let filename = basename(abs_path);
        let rel_path = abs_path.strip_prefix("/workspace/").unwrap_or(abs_path);
        let url = format!("{base_url}/workspace/{rel_path}");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::Runner(format!("downloading {abs_path}: {e}")))?;

        let byte_stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(byte_stream);

        let handle = self.object_store.put(chat_id, &filename, &mut reader).await?;

        let key = FileKey::new(handle.clone(), chat_id.to_string(), filename.clone());
        self.index.register(&key, self.global_max_downloads, None).await?;
        let record = self.index.get_info(&key).await?;

        Ok((abs_path.to_string(), handle, FileMetadataView::from(&record)))
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cluster_fake::FakeClusterClient;
    use axum::extract::{Path as AxPath, State};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct StubRunnerState {
        workspace: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
    }

    async fn put_workspace(
        State(state): State<StubRunnerState>,
        AxPath(rel_path): AxPath<String>,
        body: axum::body::Bytes,
    ) -> axum::http::StatusCode {
        state.workspace.lock().unwrap().insert(rel_path, body.to_vec());
        axum::http::StatusCode::OK
    }

    async fn get_workspace(State(state): State<StubRunnerState>, AxPath(rel_path): AxPath<String>) -> Vec<u8> {
        state.workspace.lock().unwrap().get(&rel_path).cloned().unwrap_or_default()
    }

    async fn post_execute(
        State(state): State<StubRunnerState>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<RunnerExecuteResponse> {
        let source_code = body.get("source_code").and_then(|v| v.as_str()).unwrap_or("");
        if source_code.contains("write_output") {
            state.workspace.lock().unwrap().insert("out.txt".to_string(), b"produced".to_vec());
            return Json(RunnerExecuteResponse {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                files: vec!["/workspace/out.txt".to_string()],
            });
        }

        Json(RunnerExecuteResponse {
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            files: vec![],
        })
    }

    async fn spawn_stub_runner() -> (SocketAddr, StubRunnerState) {
        let state = StubRunnerState::default();
        let app = Router::new()
            .route("/workspace/{*rel_path}", put(put_workspace).get(get_workspace))
            .route("/execute", post(post_execute))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn build_pipeline(cluster_address: String) -> (ExecutionPipeline, Arc<FakeClusterClient>, Arc<ObjectStore>, Arc<FileIndex>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(ObjectStore::new(dir.path()).await.unwrap());
        let index = Arc::new(FileIndex::connect_in_memory().await.unwrap());
        let cluster = Arc::new(FakeClusterClient::new().with_address(cluster_address));
        let pool = Arc::new(PoolManager::new(cluster.clone(), 0, "runner".into(), "sandbox-".into(), None));
        let pipeline = ExecutionPipeline::new(pool, store.clone(), index.clone(), None);
        (pipeline, cluster, store, index, dir)
    }

    #[tokio::test]
    async fn execute_without_files_runs_and_releases_container() {
        let (addr, _state) = spawn_stub_runner().await;
        let (pipeline, cluster, _store, _index, _dir) = build_pipeline(addr.to_string()).await;

        let request = ExecutionRequest {
            source_code: "print(1)".into(),
            files: HashMap::new(),
            env: HashMap::new(),
            chat_id: Some("chat1".into()),
            max_downloads: None,
            expires_in: None,
            persistent_workspace: false,
        };

        let result = pipeline.execute(request).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "ok\n");
        assert!(result.files.is_empty());
        assert_eq!(cluster.live_count(), 0, "container must be deleted after use");
    }

    #[tokio::test]
    async fn execute_with_persistent_workspace_harvests_and_registers_output() {
        let (addr, _state) = spawn_stub_runner().await;
        let (pipeline, _cluster, store, index, _dir) = build_pipeline(addr.to_string()).await;

        let request = ExecutionRequest {
            source_code: "write_output()".into(),
            files: HashMap::new(),
            env: HashMap::new(),
            chat_id: Some("chat1".into()),
            max_downloads: None,
            expires_in: None,
            persistent_workspace: true,
        };

        let result = pipeline.execute(request).await.unwrap();
        assert_eq!(result.files.len(), 1);
        let handle = result.files.get("/workspace/out.txt").unwrap();

        let mut file = store.read_for_pipeline("chat1", handle, "out.txt").await.unwrap();
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut bytes).await.unwrap();
        assert_eq!(bytes, b"produced");

        let key = FileKey::new(handle.clone(), "chat1", "out.txt");
        index.get_info(&key).await.unwrap();

        let metadata = result.files_metadata.get("/workspace/out.txt").unwrap();
        assert_eq!(metadata.remaining_downloads, None);
    }

    #[tokio::test]
    async fn execute_stages_input_files_without_consuming_download_quota() {
        let (addr, _state) = spawn_stub_runner().await;
        let (pipeline, _cluster, store, index, _dir) = build_pipeline(addr.to_string()).await;

        let handle = store
            .put("chat1", "input.txt", &mut std::io::Cursor::new(&b"seed data"[..]))
            .await
            .unwrap();
        let key = FileKey::new(handle.clone(), "chat1", "input.txt");
        index.register(&key, Some(1), None).await.unwrap();

        let mut files = HashMap::new();
        files.insert("/workspace/input.txt".to_string(), handle);

        let request = ExecutionRequest {
            source_code: "print(1)".into(),
            files,
            env: HashMap::new(),
            chat_id: Some("chat1".into()),
            max_downloads: None,
            expires_in: None,
            persistent_workspace: false,
        };

        pipeline.execute(request).await.unwrap();

        // Quota untouched: the pipeline's staging read is privileged.
        let record = index.get_info(&key).await.unwrap();
        assert_eq!(record.remaining_downloads, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_failure_is_retried_and_eventually_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(ObjectStore::new(dir.path()).await.unwrap());
        let index = Arc::new(FileIndex::connect_in_memory().await.unwrap());
        let cluster = Arc::new(FakeClusterClient::new().failing_creates(10));
        let pool = Arc::new(PoolManager::new(cluster, 0, "runner".into(), "sandbox-".into(), None));
        let pipeline = ExecutionPipeline::new(pool, store, index, None);

        let request = ExecutionRequest {
            source_code: "print(1)".into(),
            files: HashMap::new(),
            env: HashMap::new(),
            chat_id: None,
            max_downloads: None,
            expires_in: None,
            persistent_workspace: false,
        };

        let result = pipeline.execute(request).await;
        assert!(matches!(result, Err(PipelineError::Pool(_))));
    }

    #[test]
    fn basename_strips_directory_components() {
        assert_eq!(basename("/workspace/dir/out.txt"), "out.txt");
        assert_eq!(basename("/workspace/out.txt"), "out.txt");
    }
}
