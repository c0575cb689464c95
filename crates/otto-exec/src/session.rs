// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::buffer::OutputBuffer;
use crate::store::ExecError;

const READ_CHUNK: usize = 8192;
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How the subprocess is wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// stdout/stderr pipes, stdin closed.
    Pipe,
    /// Pseudo-terminal; accepts stdin writes.
    Pty,
}

/// Snapshot returned by [`ExecSession::collect_output`].
#[derive(Debug, Clone, Serialize)]
pub struct OutputSnapshot {
    pub content: String,
    pub exited: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

enum StdinHandle {
    None,
    #[cfg(unix)]
    Pty(Mutex<std::fs::File>),
}

/// One live subprocess owned by the worker.
///
/// Reader tasks drain output into the bounded buffer; the exit waiter
/// blocks on the readers completing before calling process-wait, which
/// guarantees that a snapshot taken after `exited` is set contains all
/// output.
pub struct ExecSession {
    id: u64,
    command: String,
    mode: SessionMode,
    pid: Option<u32>,
    buffer: Arc<Mutex<OutputBuffer>>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
    stdin: StdinHandle,
}

impl ExecSession {
    /// Spawn a pipe-mode session.  Must be called within a tokio runtime.
    pub(crate) fn spawn_pipe(
        id: u64,
        command: &str,
        cwd: Option<&str>,
        max_output_bytes: usize,
    ) -> Result<Arc<Self>, ExecError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn()?;
        let pid = child.id();
        let buffer = Arc::new(Mutex::new(OutputBuffer::new(max_output_bytes)));
        let exited = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(Mutex::new(None));

        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<()>(2);
        let mut reader_count = 0;
        if let Some(stdout) = child.stdout.take() {
            reader_count += 1;
            tokio::spawn(drain_async(stdout, buffer.clone(), done_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            reader_count += 1;
            tokio::spawn(drain_async(stderr, buffer.clone(), done_tx.clone()));
        }
        drop(done_tx);

        // Exit waiter: readers first, then process-wait, per the subprocess
        // API contract that pipes must be drained before wait.
        {
            let exited = exited.clone();
            let exit_code = exit_code.clone();
            tokio::spawn(async move {
                for _ in 0..reader_count {
                    let _ = done_rx.recv().await;
                }
                match child.wait().await {
                    Ok(status) => *exit_code.lock() = status.code(),
                    Err(e) => warn!(error = %e, "wait on exec child failed"),
                }
                exited.store(true, Ordering::Release);
            });
        }

        debug!(id, pid, "spawned pipe exec session");
        Ok(Arc::new(Self {
            id,
            command: command.to_string(),
            mode: SessionMode::Pipe,
            pid,
            buffer,
            exited,
            exit_code,
            stdin: StdinHandle::None,
        }))
    }

    /// Spawn a PTY-mode session (unix only).
    #[cfg(unix)]
    pub(crate) fn spawn_pty(
        id: u64,
        command: &str,
        cwd: Option<&str>,
        max_output_bytes: usize,
    ) -> Result<Arc<Self>, ExecError> {
        use std::io::Read;
        use std::os::unix::io::FromRawFd;

        let mut master: libc::c_int = -1;
        let mut slave: libc::c_int = -1;
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(ExecError::Spawn(std::io::Error::last_os_error()));
        }

        // The child gets dup'ed slave ends; the parent keeps the master.
        let child = {
            let stdin = unsafe { std::process::Stdio::from_raw_fd(libc::dup(slave)) };
            let stdout = unsafe { std::process::Stdio::from_raw_fd(libc::dup(slave)) };
            let stderr = unsafe { std::process::Stdio::from_raw_fd(libc::dup(slave)) };
            let mut cmd = std::process::Command::new("sh");
            cmd.arg("-c").arg(command).stdin(stdin).stdout(stdout).stderr(stderr);
            if let Some(dir) = cwd {
                cmd.current_dir(dir);
            }
            cmd.spawn()
        };
        unsafe { libc::close(slave) };
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                unsafe { libc::close(master) };
                return Err(ExecError::Spawn(e));
            }
        };
        let pid = Some(child.id());

        let mut reader = unsafe { std::fs::File::from_raw_fd(libc::dup(master)) };
        let writer = unsafe { std::fs::File::from_raw_fd(master) };

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(max_output_bytes)));
        let exited = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(Mutex::new(None));

        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut chunk) {
                        // EOF, or EIO once the child side of the PTY closes.
                        Ok(0) | Err(_) => break,
                        Ok(n) => buffer.lock().push(&String::from_utf8_lossy(&chunk[..n])),
                    }
                }
                let _ = done_tx.send(());
            });
        }
        {
            let exited = exited.clone();
            let exit_code = exit_code.clone();
            std::thread::spawn(move || {
                let _ = done_rx.recv();
                match child.wait() {
                    Ok(status) => *exit_code.lock() = status.code(),
                    Err(e) => warn!(error = %e, "wait on pty child failed"),
                }
                exited.store(true, Ordering::Release);
            });
        }

        debug!(id, ?pid, "spawned pty exec session");
        Ok(Arc::new(Self {
            id,
            command: command.to_string(),
            mode: SessionMode::Pty,
            pid,
            buffer,
            exited,
            exit_code,
            stdin: StdinHandle::Pty(Mutex::new(writer)),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Write to the subprocess's stdin.  Pipe sessions always refuse.
    pub fn write_stdin(&self, data: &str) -> Result<(), ExecError> {
        match &self.stdin {
            StdinHandle::None => Err(ExecError::StdinUnsupported),
            #[cfg(unix)]
            StdinHandle::Pty(writer) => {
                use std::io::Write;
                let mut writer = writer.lock();
                writer.write_all(data.as_bytes())?;
                writer.flush()?;
                Ok(())
            }
        }
    }

    /// Kill the subprocess (unix only).  The exit waiter still records the
    /// termination and sets the exited flag.
    pub fn kill(&self) -> Result<(), ExecError> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
                return Ok(());
            }
            Err(ExecError::Unsupported("kill without pid"))
        }
        #[cfg(not(unix))]
        {
            Err(ExecError::Unsupported("kill"))
        }
    }

    /// Poll (~25 ms cadence) until new output arrives, the process exits,
    /// or `deadline` elapses.  `heartbeat` is invoked roughly every 5 s so
    /// a hosting activity can keep itself alive.
    pub async fn collect_output(
        &self,
        deadline: Duration,
        mut heartbeat: impl FnMut(),
    ) -> OutputSnapshot {
        let start = Instant::now();
        let mut last_beat = Instant::now();
        let baseline = self.buffer.lock().total_len();
        loop {
            if self.is_exited() {
                // The exit waiter only sets the flag after the readers have
                // drained, so this snapshot contains all output.
                return self.snapshot(false);
            }
            if self.buffer.lock().total_len() > baseline {
                return self.snapshot(false);
            }
            if start.elapsed() >= deadline {
                return self.snapshot(true);
            }
            if last_beat.elapsed() >= HEARTBEAT_INTERVAL {
                heartbeat();
                last_beat = Instant::now();
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn snapshot(&self, timed_out: bool) -> OutputSnapshot {
        OutputSnapshot {
            content: self.buffer.lock().snapshot(),
            exited: self.is_exited(),
            exit_code: self.exit_code(),
            timed_out,
        }
    }
}

async fn drain_async(
    mut stream: impl tokio::io::AsyncRead + Unpin,
    buffer: Arc<Mutex<OutputBuffer>>,
    done: tokio::sync::mpsc::Sender<()>,
) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.lock().push(&String::from_utf8_lossy(&chunk[..n])),
        }
    }
    let _ = done.send(()).await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_to_exit(session: &ExecSession) -> OutputSnapshot {
        let mut remaining = Duration::from_secs(10);
        loop {
            let snap = session.collect_output(remaining, || {}).await;
            if snap.exited {
                return snap;
            }
            if snap.timed_out {
                panic!("session did not exit in time");
            }
            remaining = Duration::from_secs(5);
        }
    }

    #[tokio::test]
    async fn pipe_session_captures_stdout() {
        let s = ExecSession::spawn_pipe(1, "echo hello", None, 64 * 1024).unwrap();
        let snap = collect_to_exit(&s).await;
        assert!(snap.content.contains("hello"));
        assert_eq!(snap.exit_code, Some(0));
    }

    #[tokio::test]
    async fn pipe_session_captures_stderr_and_exit_code() {
        let s = ExecSession::spawn_pipe(2, "echo oops >&2; exit 3", None, 64 * 1024).unwrap();
        let snap = collect_to_exit(&s).await;
        assert!(snap.content.contains("oops"));
        assert_eq!(snap.exit_code, Some(3));
    }

    #[tokio::test]
    async fn pipe_session_refuses_stdin() {
        let s = ExecSession::spawn_pipe(3, "sleep 5", None, 1024).unwrap();
        let err = s.write_stdin("data\n").unwrap_err();
        assert!(matches!(err, ExecError::StdinUnsupported));
        let _ = s.kill();
    }

    #[tokio::test]
    async fn deadline_returns_timed_out_snapshot() {
        let s = ExecSession::spawn_pipe(4, "sleep 30", None, 1024).unwrap();
        let snap = s.collect_output(Duration::from_millis(100), || {}).await;
        assert!(snap.timed_out);
        assert!(!snap.exited);
        let _ = s.kill();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pty_session_echoes_and_accepts_stdin() {
        let s = ExecSession::spawn_pty(5, "cat", None, 64 * 1024).unwrap();
        s.write_stdin("ping\n").unwrap();
        let snap = s.collect_output(Duration::from_secs(10), || {}).await;
        assert!(snap.content.contains("ping"));
        let _ = s.kill();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_session_reaches_exited() {
        let s = ExecSession::spawn_pipe(6, "sleep 30", None, 1024).unwrap();
        s.kill().unwrap();
        let snap = collect_to_exit(&s).await;
        assert!(snap.exited);
    }
}
