//! Remote Snapshot Sync
//!
//! Pushes local snapshots to, and pulls them from, a remote store keyed by
//! `(voice_name, filename)`. Every transfer is independent: one failing item
//! is counted and logged, and the batch carries on with the rest.

use crate::memory::MemoryStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

const SNAPSHOT_FILE_EXTENSION: &str = ".json";

/// The remote side of snapshot sync.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteMemories: Send + Sync {
    /// Lists the snapshot filenames stored for `voice_name`.
    async fn list(&self, voice_name: &str) -> Result<Vec<String>>;

    /// Fetches the raw content of one snapshot file.
    async fn fetch(&self, voice_name: &str, filename: &str) -> Result<String>;

    /// Uploads one snapshot file, replacing any file with the same name.
    async fn upload(&self, voice_name: &str, filename: &str, content: String) -> Result<()>;
}

/// Outcome of a batch transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub success_count: usize,
    pub error_count: usize,
}

impl SyncReport {
    /// True when some, but not necessarily all, items failed.
    pub fn is_partial_failure(&self) -> bool {
        self.error_count > 0
    }
}

/// The remote filename of the snapshot taken at `timestamp`.
pub fn snapshot_filename(timestamp: &str) -> String {
    format!("{timestamp}{SNAPSHOT_FILE_EXTENSION}")
}

/// The snapshot timestamp a remote filename refers to.
pub fn timestamp_from_filename(filename: &str) -> &str {
    filename
        .strip_suffix(SNAPSHOT_FILE_EXTENSION)
        .unwrap_or(filename)
}

/// Uploads every local snapshot of `voice_name`.
///
/// Only listing the local snapshots can fail the whole call; individual
/// upload failures are counted in the report.
pub async fn push_snapshots(
    memory: &MemoryStore,
    remote: &dyn RemoteMemories,
    voice_name: &str,
) -> Result<SyncReport> {
    let timestamps = memory
        .list(voice_name)
        .context("Failed to list local snapshots")?;
    let mut report = SyncReport::default();

    for timestamp in timestamps {
        let filename = snapshot_filename(&timestamp);
        let outcome = match memory.read_snapshot(voice_name, &timestamp) {
            Ok(Some(content)) => remote.upload(voice_name, &filename, content).await,
            Ok(None) => Err(anyhow::anyhow!("snapshot vanished before upload")),
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(()) => report.success_count += 1,
            Err(e) => {
                warn!(voice = %voice_name, %filename, error = %e, "Snapshot upload failed");
                report.error_count += 1;
            }
        }
    }

    info!(
        voice = %voice_name,
        success = report.success_count,
        errors = report.error_count,
        "Snapshot push finished"
    );
    Ok(report)
}

/// Downloads every remote snapshot of `voice_name` into the local store,
/// overwriting local slots with the same timestamp.
///
/// Only listing the remote snapshots can fail the whole call; individual
/// fetch failures are logged, counted and skipped.
pub async fn pull_snapshots(
    memory: &MemoryStore,
    remote: &dyn RemoteMemories,
    voice_name: &str,
) -> Result<SyncReport> {
    let filenames = remote
        .list(voice_name)
        .await
        .context("Failed to list remote snapshots")?;
    let mut report = SyncReport::default();

    for filename in filenames {
        let timestamp = timestamp_from_filename(&filename);
        let outcome = match remote.fetch(voice_name, &filename).await {
            Ok(content) => memory
                .write_snapshot(voice_name, timestamp, content)
                .map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => report.success_count += 1,
            Err(e) => {
                warn!(voice = %voice_name, %filename, error = %e, "Skipping snapshot download");
                report.error_count += 1;
            }
        }
    }

    info!(
        voice = %voice_name,
        success = report.success_count,
        errors = report.error_count,
        "Snapshot pull finished"
    );
    Ok(report)
}
