// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Tolerant JSON ingestion for the execute endpoint (spec §4.G, §6 "Schema
//! tolerance").
//!
//! Pipeline: strict parse, falling back to a narrow lenient-repair pass on
//! failure; `requestBody` envelope unwrapping; recursive key canonicalisation
//! (alias table, else camelCase→snake_case); optional JSON-schema
//! validation.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("payload is not valid JSON, even after repair: {0}")]
    Unparseable(String),

    #[error("payload failed schema validation: {0}")]
    SchemaInvalid(String),
}

fn alias_table() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("sourceCode", "source_code"),
            ("code", "source_code"),
            ("timeoutSeconds", "timeout"),
            ("limitDownloads", "limit"),
        ])
    })
}

/// Strict-then-repaired parse of a raw request body.
pub fn parse_tolerant(raw: &str) -> Result<Value, CanonError> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Ok(v);
    }

    let repaired = repair_json(raw);
    serde_json::from_str::<Value>(&repaired).map_err(|e| CanonError::Unparseable(e.to_string()))
}

/// Unwraps a `{"requestBody": {...}}` envelope if that is the payload's sole key.
pub fn unwrap_envelope(value: Value) -> Value {
    if let Value::Object(ref map) = value {
        if map.len() == 1 {
            if let Some(inner) = map.get("requestBody") {
                return inner.clone();
            }
        }
    }
    value
}

/// Recursively canonicalises object keys: alias table first, else
/// camelCase→snake_case. Idempotent (spec §8 invariant 5): canonicalised
/// keys never match an alias and never contain an interior uppercase letter.
pub fn canonicalise(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let canon_key = canonicalise_key(&k);
                out.insert(canon_key, canonicalise(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalise).collect()),
        other => other,
    }
}

fn canonicalise_key(key: &str) -> String {
    if let Some(alias) = alias_table().get(key) {
        return alias.to_string();
    }
    camel_to_snake(key)
}

fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_ascii_uppercase() && i != 0 {
            out.push('_');
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// A narrow lenient-JSON repair pass: strips a trailing comma before a
/// closing brace/bracket and converts single-quoted strings to
/// double-quoted ones. No ecosystem crate for this exists in the corpus;
/// this is intentionally minimal, not a general JSON5 parser.
fn repair_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_string => {
                out.push('"');
                in_string = true;
            }
            '\'' if in_string => {
                out.push('"');
                in_string = false;
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ',' if !in_string => {
                let mut lookahead = chars.clone();
                let mut trailing = true;
                while let Some(&next) = lookahead.peek() {
                    if next.is_whitespace() {
                        lookahead.next();
                        continue;
                    }
                    trailing = next == '}' || next == ']';
                    break;
                }
                if !trailing {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Validates `value` against a JSON-schema document if `schema` is `Some`.
pub fn validate_schema(value: &Value, schema: Option<&Value>) -> Result<(), CanonError> {
    let Some(schema) = schema else {
        return Ok(());
    };

    let compiled = jsonschema::validator_for(schema)
        .map_err(|e| CanonError::SchemaInvalid(e.to_string()))?;

    if let Err(first_error) = compiled.validate(value) {
        return Err(CanonError::SchemaInvalid(first_error.to_string()));
    }
    Ok(())
}
