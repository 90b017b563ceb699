//! Workspace directory safety and reclamation.
//!
//! Every on-disk per-session workspace lives directly under the
//! configured workspace root. Deletion is gated on the resolved path
//! staying inside that root, which defends against corrupted or
//! adversarial `workspace_path` values reaching the teardown path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Canonicalize `candidate` and verify it stays strictly under `root`.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if the resolved path escapes `root`
/// or is `root` itself, or `AppError::Io` if it cannot be resolved.
pub fn resolve_under_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let resolved = candidate
        .canonicalize()
        .map_err(|err| AppError::Io(format!("{}: {err}", candidate.display())))?;
    if resolved.starts_with(root) && resolved != root {
        Ok(resolved)
    } else {
        Err(AppError::PathViolation(format!(
            "{} resolves outside the workspace root",
            candidate.display()
        )))
    }
}

/// Recursively delete a session workspace after the safe-path check.
/// A missing directory is a no-op.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if the path escapes `root`, or
/// `AppError::Io` if resolution or deletion fails. Teardown callers log
/// the failure and continue; it never blocks record removal.
pub async fn remove_workspace(root: &Path, candidate: &Path) -> Result<()> {
    if !candidate.exists() {
        debug!(path = %candidate.display(), "workspace directory already absent");
        return Ok(());
    }

    let resolved = resolve_under_root(root, candidate)?;
    tokio::fs::remove_dir_all(&resolved)
        .await
        .map_err(|err| AppError::Io(format!("remove {}: {err}", resolved.display())))?;
    info!(path = %resolved.display(), "workspace directory removed");
    Ok(())
}

/// Delete directories directly under `root` that no live session owns and
/// whose last modification is older than `grace`. Returns how many were
/// removed. Individual failures are logged and skipped.
pub async fn sweep_orphans(root: &Path, owned: &HashSet<PathBuf>, grace: Duration) -> usize {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(root = %root.display(), %err, "workspace root not listable");
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(root = %root.display(), %err, "workspace root entry unreadable");
                break;
            }
        };

        let path = entry.path();
        // Symlinked children are never followed.
        let is_dir = entry.file_type().await.is_ok_and(|ty| ty.is_dir());
        if !is_dir || owned.contains(&path) {
            continue;
        }

        let old_enough = entry
            .metadata()
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|mtime| now.duration_since(mtime).ok())
            .is_some_and(|age| age > grace);
        if !old_enough {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "orphaned workspace removed");
                removed += 1;
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "orphaned workspace not removable");
            }
        }
    }
    removed
}
