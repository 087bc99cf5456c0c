use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::workspace::WORKSPACE_PREFIX;

/// Remove job workspaces under `root` older than `max_age`.
///
/// Only direct children named `encodemedia_*` are considered. A live job's
/// workspace is never older than the job itself, so pick `max_age` above the
/// longest job you expect. Returns how many directories were removed.
pub async fn sweep_orphaned_workspaces(root: &Path, max_age: Duration) -> Result<usize> {
    if !root.exists() {
        debug!("Work root {} does not exist, nothing to sweep", root.display());
        return Ok(0);
    }
    info!("🔍 Checking {} for orphaned workspaces...", root.display());

    let stale = tokio::task::spawn_blocking({
        let root = root.to_path_buf();
        move || find_stale(&root, max_age)
    })
    .await
    .context("Failed to scan for orphaned workspaces")?;

    let mut removed = 0;
    for dir in stale {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("🗑️  Removed orphaned workspace {}", dir.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove orphaned workspace {}: {}", dir.display(), e),
        }
    }

    if removed > 0 {
        info!("✅ Cleaned up {} orphaned workspace(s)", removed);
    } else {
        debug!("No orphaned workspaces found");
    }
    Ok(removed)
}

fn find_stale(root: &Path, max_age: Duration) -> Vec<PathBuf> {
    let now = SystemTime::now();

    WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.starts_with(WORKSPACE_PREFIX))
        })
        .filter(|entry| {
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            match modified {
                // Clock skew makes the age zero
                Some(modified) => now.duration_since(modified).unwrap_or_default() >= max_age,
                None => false,
            }
        })
        .map(|entry| entry.into_path())
        .collect()
}
