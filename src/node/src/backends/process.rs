// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Supervision of a single proxy back-end process.
//!
//! Output is captured line-by-line into a bounded ring buffer (for
//! `include_buffer` log requests) and fanned out over a broadcast channel
//! (for live tails). Restarts start the replacement process first and only
//! terminate the old one once the replacement survives its startup grace
//! period.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const LOG_BUFFER_LINES: usize = 1000;
const LOG_CHANNEL_CAPACITY: usize = 256;
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Captured process output: a bounded replay buffer plus a live feed.
#[derive(Debug)]
pub struct LogBuffer {
    ring: Mutex<VecDeque<String>>,
    tx: broadcast::Sender<String>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        LogBuffer {
            ring: Mutex::new(VecDeque::with_capacity(LOG_BUFFER_LINES)),
            tx,
        }
    }

    pub fn push(&self, line: String) {
        let mut ring = self.ring.lock().expect("log ring lock poisoned");
        if ring.len() == LOG_BUFFER_LINES {
            ring.pop_front();
        }
        ring.push_back(line.clone());
        drop(ring);
        // Errors mean no live subscribers, which is fine.
        let _ = self.tx.send(line);
    }

    /// The buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.ring
            .lock()
            .expect("log ring lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Owns the back-end child process and its restarts.
#[derive(Debug)]
pub struct ProcessSupervisor {
    executable: PathBuf,
    args: Vec<String>,
    logs: Arc<LogBuffer>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl ProcessSupervisor {
    pub fn new(executable: PathBuf, args: Vec<String>) -> Self {
        ProcessSupervisor {
            executable,
            args,
            logs: Arc::new(LogBuffer::new()),
            child: tokio::sync::Mutex::new(None),
        }
    }

    pub fn logs(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.logs)
    }

    async fn spawn_child(&self) -> anyhow::Result<Child> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.executable.display()))?;

        if let Some(stdout) = child.stdout.take() {
            let logs = Arc::clone(&self.logs);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.push(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = Arc::clone(&self.logs);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.push(line);
                }
            });
        }

        // A process that dies within the grace period counts as a failed
        // start, not a running backend.
        tokio::time::sleep(STARTUP_GRACE).await;
        if let Some(status) = child.try_wait().context("failed to poll child")? {
            anyhow::bail!(
                "{} exited during startup with {status}",
                self.executable.display()
            );
        }
        Ok(child)
    }

    /// Starts the process. Any previously tracked process is left alone.
    pub async fn start(&self) -> anyhow::Result<()> {
        let child = self.spawn_child().await?;
        let mut slot = self.child.lock().await;
        if let Some(mut old) = slot.replace(child) {
            let _ = old.kill().await;
        }
        info!(executable = %self.executable.display(), "backend process started");
        Ok(())
    }

    /// Starts a replacement process; the old one is terminated only after
    /// the replacement survives startup. On failure the old process keeps
    /// running and the error is returned.
    pub async fn restart(&self) -> anyhow::Result<()> {
        let replacement = self.spawn_child().await?;
        let mut slot = self.child.lock().await;
        if let Some(mut old) = slot.replace(replacement) {
            debug!(executable = %self.executable.display(), "terminating previous backend process");
            let _ = old.kill().await;
        }
        info!(executable = %self.executable.display(), "backend process restarted");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            if let Err(err) = child.kill().await {
                warn!(executable = %self.executable.display(), %err, "failed to kill backend process");
            }
        }
    }

    pub async fn running(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                // Exited or unqueryable: either way, not running.
                Ok(Some(_)) | Err(_) => {
                    *slot = None;
                    false
                }
            },
            None => false,
        }
    }

    /// Best-effort version probe (`<exe> version`-style invocations).
    pub async fn detect_version(executable: &PathBuf, args: &[&str]) -> Option<String> {
        let output = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next()?;
        first_line
            .split_whitespace()
            .find(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .map(|token| token.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_bounds_and_replays() {
        let buffer = LogBuffer::new();
        for i in 0..(LOG_BUFFER_LINES + 10) {
            buffer.push(format!("line {i}"));
        }
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), LOG_BUFFER_LINES);
        assert_eq!(snapshot[0], "line 10");
        assert_eq!(
            snapshot.last().map(String::as_str),
            Some(format!("line {}", LOG_BUFFER_LINES + 9).as_str())
        );
    }

    #[tokio::test]
    async fn subscribers_see_new_lines() {
        let buffer = LogBuffer::new();
        let mut rx = buffer.subscribe();
        buffer.push("hello".into());
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn failed_start_reports_error() {
        let supervisor = ProcessSupervisor::new(
            PathBuf::from("/nonexistent/definitely-not-a-binary"),
            vec![],
        );
        assert!(supervisor.start().await.is_err());
        assert!(!supervisor.running().await);
    }
}
