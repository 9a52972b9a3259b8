// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! HTTP error taxonomy (spec §7): maps internal layer errors onto the six
//! response classes clients see. Index `NotFound`/`Expired` and storage
//! not-found collapse to a single `404` for `/v1/download`, per spec §4.G
//! and §7 ("to avoid enumeration").

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::application::pipeline::PipelineError;
use crate::application::pool_manager::PoolError;
use crate::domain::cluster::ClusterError;
use crate::domain::validation::ValidationError;
use crate::infrastructure::index::IndexError;
use crate::infrastructure::json_canon::CanonError;
use crate::infrastructure::object_store::ObjectStoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("origin not authorised")]
    Unauthorised,

    #[error("not found")]
    NotFound,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("unprocessable payload: {0}")]
    Unprocessable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Unauthorised => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "File not found".to_string()),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "internal error serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<CanonError> for ApiError {
    fn from(e: CanonError) -> Self {
        match e {
            CanonError::Unparseable(m) | CanonError::SchemaInvalid(m) => ApiError::Unprocessable(m),
        }
    }
}

/// Download/expire path: index `NotFound`, `Expired`, and storage
/// not-found-on-disk all collapse to one response.
impl From<IndexError> for ApiError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::NotFound(_) | IndexError::Expired(_) => ApiError::NotFound,
            IndexError::InvalidDate => ApiError::BadRequest("invalid expiry date".into()),
            IndexError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ObjectStoreError> for ApiError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::NotFound { .. } => ApiError::NotFound,
            ObjectStoreError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Cluster(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Pool(e) => e.into(),
            PipelineError::Storage(e) => e.into(),
            PipelineError::Index(e) => e.into(),
            PipelineError::Runner(m) => ApiError::Internal(m),
        }
    }
}
