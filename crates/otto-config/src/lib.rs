// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session configuration schema.
//!
//! Everything here is plain serializable data: the session workflow carries
//! its [`SessionConfig`] inside the state snapshot across continue-as-new, so
//! every field must round-trip through serde without loss.  Filesystem
//! configuration *loading* is not done here: instruction files and exec
//! policies reach the workflow through activities.

mod schema;

pub use schema::{
    ApprovalMode, ModelSettings, SandboxPolicy, SessionConfig, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_TOTAL_ITERATIONS,
};
