//! Best-effort resume of pending runs across restarts.
//!
//! On shutdown the pending request keys are written to a short-lived JSON
//! snapshot. On the next start a fresh snapshot is consumed and its requests
//! are re-marked RUNNING and re-queued. Runs that were mid-poll are submitted
//! again from scratch, so a request may execute more than once.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::types::RunRequest;
use crate::{log_info, log_warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueSnapshotFile {
    pub saved_at: DateTime<Utc>,
    pub entries: Vec<RunRequest>,
}

impl QueueSnapshotFile {
    pub fn new(entries: Vec<RunRequest>) -> Self {
        Self {
            saved_at: Utc::now(),
            entries,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.saved_at > ttl,
            Err(_) => false,
        }
    }
}

/// Write the snapshot atomically (temp file, fsync, rename).
///
/// An empty request list removes any existing snapshot instead.
pub fn save(path: &Path, requests: Vec<RunRequest>) -> Result<(), String> {
    if requests.is_empty() {
        return discard(path);
    }

    let parent = path
        .parent()
        .ok_or_else(|| format!("Cannot determine parent directory of {}", path.display()))?;

    fs::create_dir_all(parent)
        .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;

    let snapshot = QueueSnapshotFile::new(requests);
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| format!("Failed to serialize queue snapshot: {}", e))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|e| format!("Failed to create temp file in {}: {}", parent.display(), e))?;

    temp_file
        .write_all(json.as_bytes())
        .map_err(|e| format!("Failed to write temp file: {}", e))?;

    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| format!("Failed to sync temp file: {}", e))?;

    temp_file
        .persist(path)
        .map_err(|e| format!("Failed to rename temp file to {}: {}", path.display(), e))?;

    log_info!(
        "Saved {} pending run(s) to {}",
        snapshot.entries.len(),
        path.display()
    );
    Ok(())
}

/// Read and remove the snapshot.
///
/// Returns `Ok(None)` when there is no snapshot, or when it is expired or
/// unreadable (those are discarded with a warning).
pub fn take(path: &Path, ttl: Duration) -> Result<Option<Vec<RunRequest>>, String> {
    take_at(path, ttl, Utc::now())
}

/// [`take`] with an explicit clock.
pub fn take_at(
    path: &Path,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Option<Vec<RunRequest>>, String> {
    let Some(contents) = read_contents(path)? else {
        return Ok(None);
    };

    // A snapshot is consumed at most once, whatever its contents.
    discard(path)?;

    let snapshot: QueueSnapshotFile = match serde_json::from_str(&contents) {
        Ok(s) => s,
        Err(e) => {
            log_warn!(
                "Discarding unreadable queue snapshot {}: {}",
                path.display(),
                e
            );
            return Ok(None);
        }
    };

    if snapshot.is_expired(now, ttl) {
        log_warn!(
            "Discarding queue snapshot from {} (older than {}s)",
            snapshot.saved_at.to_rfc3339(),
            ttl.as_secs()
        );
        return Ok(None);
    }

    Ok(Some(snapshot.entries))
}

/// Read the snapshot without consuming it.
pub fn peek(path: &Path) -> Result<Option<QueueSnapshotFile>, String> {
    let Some(contents) = read_contents(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
}

fn read_contents(path: &Path) -> Result<Option<String>, String> {
    match fs::read_to_string(path) {
        Ok(c) => Ok(Some(c)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(format!("Failed to read {}: {}", path.display(), e)),
    }
}

/// Remove the snapshot if present.
pub fn discard(path: &Path) -> Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("Failed to remove {}: {}", path.display(), e)),
    }
}
