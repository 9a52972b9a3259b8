// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Execution request/result value objects (spec §3, §6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::file_record::FileMetadataView;

/// Normalised, schema-coerced `/v1/execute` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source_code: String,

    #[serde(default)]
    pub files: HashMap<String, String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub chat_id: Option<String>,

    #[serde(default)]
    pub max_downloads: Option<u32>,

    #[serde(default)]
    pub expires_in: Option<String>,

    #[serde(default)]
    pub persistent_workspace: bool,
}

/// Transient execution outcome (spec §3 `ExecutionResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,

    /// Absolute workspace path -> content-addressed handle.
    pub files: HashMap<String, String>,

    /// Absolute workspace path -> download-quota/expiry metadata for the
    /// handle it was registered with, so clients don't need a second
    /// round-trip to discover quota state.
    #[serde(default)]
    pub files_metadata: HashMap<String, FileMetadataView>,

    pub chat_id: String,
}

/// Body returned by the in-container runner's `POST /execute` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub files: Vec<String>,
}

/// Body sent to the in-container runner's `POST /execute`.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerExecuteRequest<'a> {
    pub source_code: &'a str,
    pub env: &'a HashMap<String, String>,
}
