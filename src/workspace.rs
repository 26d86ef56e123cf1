//! Per-request scratch storage.
//!
//! A [`WorkingArea`] owns a uniquely named directory under the workspace
//! root. Removal happens exactly once: either through [`WorkingArea::release`]
//! or, on any other exit path (early return, panic unwinding, a dropped
//! future), when the area is dropped.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh working area for `request_id`.
    pub fn acquire(&self, request_id: Uuid) -> io::Result<WorkingArea> {
        std::fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("docrelay-{}-", request_id))
            .tempdir_in(&self.root)?;
        debug!("Acquired working area {}", dir.path().display());
        Ok(WorkingArea { dir: Some(dir) })
    }
}

#[derive(Debug)]
pub struct WorkingArea {
    dir: Option<TempDir>,
}

impl WorkingArea {
    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    /// Fresh subdirectory for one backend attempt.
    pub fn attempt_dir(&self, name: &str, index: usize) -> io::Result<PathBuf> {
        let dir = self.path().join(format!("{:02}-{}", index, name));
        std::fs::create_dir(&dir)?;
        Ok(dir)
    }

    /// Recursively remove the area and everything left in it.
    pub fn release(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                let path = dir.path().to_path_buf();
                dir.close()?;
                debug!("Released working area {}", path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for WorkingArea {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove working area {}: {}", path.display(), e);
            }
        }
    }
}
