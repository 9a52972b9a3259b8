// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! `sandboxd-core`: domain, application, and infrastructure for the
//! sandboxed code-execution service.
//!
//! # Layers
//!
//! - [`domain`] — aggregates, value objects, and capability traits. No I/O.
//! - [`infrastructure`] — concrete implementations of the domain's
//!   capability traits (SQLite-backed file index, filesystem object store,
//!   Docker/fake cluster clients, JSON canonicalisation).
//! - [`application`] — orchestration: the executor pool manager, the
//!   execution pipeline, and the background reaper.
//! - [`presentation`] — HTTP ingress, origin guard, error taxonomy.
//!
//! The `cli` crate wires these together behind a single binary.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
