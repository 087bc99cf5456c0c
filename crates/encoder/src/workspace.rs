use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::job::JobId;

/// Prefix shared by every job workspace directory under the work root
pub const WORKSPACE_PREFIX: &str = "encodemedia_";

/// Job-scoped directory plus every file the job created inside it.
///
/// Teardown runs on `close()` or, failing that, on drop.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    files: Vec<PathBuf>,
    closed: bool,
}

impl Workspace {
    /// Create `<root>/encodemedia_<job-id>`. Fails if the directory already exists.
    ///
    /// Teardown stays synchronous so `Drop` can run it.
    pub async fn open(root: &Path, job_id: &JobId) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let dir = Self::path_for(root, job_id);
        tokio::fs::create_dir(&dir).await?;
        debug!("Job {}: workspace created at {}", job_id, dir.display());

        Ok(Workspace {
            dir,
            files: Vec::new(),
            closed: false,
        })
    }

    /// Directory a workspace for `job_id` occupies under `root`
    pub fn path_for(root: &Path, job_id: &JobId) -> PathBuf {
        root.join(format!("{}{}", WORKSPACE_PREFIX, job_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Registered paths in creation order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Record a path for cleanup; does not create it
    pub fn register(&mut self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        if !self.files.contains(&path) {
            self.files.push(path.clone());
        }
        path
    }

    /// Register `<dir>/<name>` and return it
    pub fn file(&mut self, name: &str) -> PathBuf {
        let path = self.dir.join(name);
        self.register(path)
    }

    /// Remove every registered file, then the directory tree.
    ///
    /// Individual failures are logged and skipped. Calling this again is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for file in &self.files {
            if !file.exists() {
                continue;
            }
            match fs::remove_file(file) {
                Ok(()) => debug!("🗑️  Removed {}", file.display()),
                Err(e) => warn!("Failed to remove {}: {}", file.display(), e),
            }
        }

        if self.dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!("Failed to remove workspace {}: {}", self.dir.display(), e);
                return;
            }
        }
        info!("Workspace {} cleaned up", self.dir.display());
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Workspace {} dropped without close, cleaning up", self.dir.display());
            self.close();
        }
    }
}
