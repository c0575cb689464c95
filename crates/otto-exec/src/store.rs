// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::session::{ExecSession, SessionMode};

/// Default retained bytes per session buffer.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 200 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("stdin writes require a PTY session")]
    StdinUnsupported,
    #[error("exec session not found: {0}")]
    SessionNotFound(u64),
    #[error("operation not supported on this platform: {0}")]
    Unsupported(&'static str),
}

/// Listing entry for one session.
#[derive(Debug, Clone, Serialize)]
pub struct ExecSessionInfo {
    pub id: u64,
    pub command: String,
    pub mode: SessionMode,
    pub exited: bool,
    pub exit_code: Option<i32>,
}

/// Process-global registry of exec sessions, shared by all activities in
/// one worker.  Ids are minted from an atomic counter; entries outlive the
/// activities that created them and disappear only on explicit removal or
/// worker restart.
pub struct ExecSessionStore {
    sessions: Mutex<HashMap<u64, Arc<ExecSession>>>,
    next_id: AtomicU64,
    max_output_bytes: usize,
}

impl Default for ExecSessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

impl ExecSessionStore {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_output_bytes,
        }
    }

    /// Spawn a pipe-mode session and register it.
    pub fn spawn_pipe(
        &self,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<Arc<ExecSession>, ExecError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = ExecSession::spawn_pipe(id, command, cwd, self.max_output_bytes)?;
        self.sessions.lock().insert(id, session.clone());
        Ok(session)
    }

    /// Spawn a PTY-mode session and register it (unix only).
    #[cfg(unix)]
    pub fn spawn_pty(
        &self,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<Arc<ExecSession>, ExecError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = ExecSession::spawn_pty(id, command, cwd, self.max_output_bytes)?;
        self.sessions.lock().insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: u64) -> Option<Arc<ExecSession>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Remove a session from the registry, killing it if still running.
    pub fn remove(&self, id: u64) -> Result<(), ExecError> {
        let session = self
            .sessions
            .lock()
            .remove(&id)
            .ok_or(ExecError::SessionNotFound(id))?;
        if !session.is_exited() {
            let _ = session.kill();
        }
        debug!(id, "removed exec session");
        Ok(())
    }

    pub fn list(&self) -> Vec<ExecSessionInfo> {
        let mut infos: Vec<ExecSessionInfo> = self
            .sessions
            .lock()
            .values()
            .map(|s| ExecSessionInfo {
                id: s.id(),
                command: s.command().to_string(),
                mode: s.mode(),
                exited: s.is_exited(),
                exit_code: s.exit_code(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
