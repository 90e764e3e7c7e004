//! Snapshot persistence for the delivery queue.
//!
//! The snapshot is a single JSON document owned by one queue. Reads are
//! permissive: a missing or unreadable file means "no prior state".

use std::path::{Path, PathBuf};

use crate::error::QueueError;
use crate::state::QueueState;

/// File-backed snapshot of a [`QueueState`].
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot, or `None` when there is nothing usable.
    pub async fn try_restore(&self) -> Option<QueueState> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "No queue file found");
                return None;
            }
        };

        match serde_json::from_slice::<QueueState>(&raw) {
            Ok(state) => {
                tracing::info!(
                    path = %self.path.display(),
                    length = state.len(),
                    "Queue file found"
                );
                Some(state)
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Queue file unreadable, starting empty"
                );
                None
            }
        }
    }

    /// Overwrite the snapshot with `state`.
    ///
    /// The document is written to a sibling temporary file first and renamed
    /// into place, so readers never observe a half-written snapshot.
    pub async fn write(&self, state: &QueueState) -> Result<(), QueueError> {
        let body = serde_json::to_vec(state)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
