// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Durable monotonic sequence counter for peak events.
//!
//! The counter lives in a small ASCII file that is rewritten and fsync'd on
//! every increment, so sequence numbers stay strictly monotonic across node
//! restarts and crashes.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

/// A file-backed monotonic counter.
#[derive(Debug, Clone)]
pub struct SeqFile {
    path: PathBuf,
    current: Arc<Mutex<u64>>,
}

impl SeqFile {
    /// Loads the counter from `path`, starting at zero when the file is
    /// missing or unreadable garbage.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let current = match std::fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(value) => {
                    info!(path = %path.display(), value, "loaded peak sequence");
                    value
                }
                Err(_) => {
                    warn!(path = %path.display(), "unparsable peak sequence file, starting from 0");
                    0
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };
        Ok(SeqFile {
            path,
            current: Arc::new(Mutex::new(current)),
        })
    }

    /// Increments the counter and durably persists it before returning.
    pub async fn next(&self) -> io::Result<u64> {
        let path = self.path.clone();
        let current = Arc::clone(&self.current);
        tokio::task::spawn_blocking(move || {
            let mut guard = current.lock().expect("seq lock poisoned");
            let value = *guard + 1;
            persist(&path, value)?;
            *guard = value;
            Ok(value)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    pub fn current(&self) -> u64 {
        *self.current.lock().expect("seq lock poisoned")
    }
}

fn persist(path: &PathBuf, value: u64) -> io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(value.to_string().as_bytes())?;
    file.flush()?;
    file.sync_all()
}
