// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Validation Primitives Domain Service
//!
//! Pure predicates for the identifier and path formats accepted across the
//! service (chat ids, content hashes, filenames, absolute workspace paths)
//! plus the duration-literal parser used by upload/execute expiry fields.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** syntactic validation only; no I/O, no side effects.

use std::sync::OnceLock;

use chrono::Duration;
use regex::Regex;
use thiserror::Error;

/// Validation failures, distinguishable from "not found" at call sites.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid chat id: {0}")]
    InvalidChatId(String),

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("invalid absolute path: {0}")]
    InvalidAbsolutePath(String),

    #[error("unsupported duration literal: {0:?}")]
    InvalidDuration(String),
}

fn hash_chat_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,255}$").unwrap())
}

fn filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,255}$").unwrap())
}

fn absolute_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/[^/].*$").unwrap())
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(\d+)\s*([smhdw])\s*$").unwrap())
}

/// `^[A-Za-z0-9_-]{1,255}$` — used for both content hashes and chat ids.
pub fn is_hash(value: &str) -> bool {
    hash_chat_id_regex().is_match(value)
}

/// Chat ids share the hash alphabet per spec §3.
pub fn is_chat_id(value: &str) -> bool {
    hash_chat_id_regex().is_match(value)
}

/// `^[A-Za-z0-9._-]{1,255}$`
pub fn is_filename(value: &str) -> bool {
    filename_regex().is_match(value)
}

/// Absolute, not root: `^/[^/].*$`
pub fn is_absolute_path(value: &str) -> bool {
    absolute_path_regex().is_match(value)
}

/// Validates and wraps a hash, returning a typed error instead of a bool.
pub fn validate_hash(value: &str) -> Result<(), ValidationError> {
    if is_hash(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidHash(value.to_string()))
    }
}

pub fn validate_chat_id(value: &str) -> Result<(), ValidationError> {
    if is_chat_id(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidChatId(value.to_string()))
    }
}

pub fn validate_filename(value: &str) -> Result<(), ValidationError> {
    if is_filename(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFilename(value.to_string()))
    }
}

pub fn validate_absolute_path(value: &str) -> Result<(), ValidationError> {
    if is_absolute_path(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidAbsolutePath(value.to_string()))
    }
}

/// Parses `<integer><unit>` literals (`s`,`m`,`h`,`d`,`w`, case-insensitive,
/// whitespace tolerated around the number). Empty or absent input means "no
/// expiry" (`Ok(None)`); anything else that doesn't match is a hard error.
pub fn parse_duration(spec: Option<&str>) -> Result<Option<Duration>, ValidationError> {
    let spec = match spec {
        None => return Ok(None),
        Some(s) if s.trim().is_empty() => return Ok(None),
        Some(s) => s,
    };

    let caps = duration_regex()
        .captures(spec)
        .ok_or_else(|| ValidationError::InvalidDuration(spec.to_string()))?;

    let amount: i64 = caps[1]
        .parse()
        .map_err(|_| ValidationError::InvalidDuration(spec.to_string()))?;

    let duration = match caps[2].to_ascii_lowercase().as_str() {
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        "w" => Duration::weeks(amount),
        _ => return Err(ValidationError::InvalidDuration(spec.to_string())),
    };

    Ok(Some(duration))
}
