//! Serializes lazy builds of external helper tools.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{IoResultExt, Result, StageError};
use crate::path_safety::file_exists;

/// Process-wide guard around check-exists / build-if-missing. With a lock
/// file set, the build is also exclusive across processes sharing a checkout.
#[derive(Debug, Default)]
pub struct ToolBuildLock {
    mutex: Mutex<()>,
    lock_file: Option<PathBuf>,
}

impl ToolBuildLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self { mutex: Mutex::new(()), lock_file: Some(path.into()) }
    }

    /// Make sure `tool` exists, running `build` at most once while holding
    /// the lock. Returns whether a build ran.
    pub fn ensure<F>(&self, tool: &Path, build: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        if file_exists(tool) {
            return Ok(false);
        }
        let _guard = self.mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let file_lock = match &self.lock_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).at(parent)?;
                }
                let f = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(path)
                    .at(path)?;
                FileExt::lock_exclusive(&f).at(path)?;
                Some(f)
            }
            None => None,
        };
        let result = self.build_if_missing(tool, build);
        if let (Some(f), Some(path)) = (file_lock, &self.lock_file) {
            FileExt::unlock(&f).at(path)?;
        }
        result
    }

    fn build_if_missing<F>(&self, tool: &Path, build: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        if file_exists(tool) {
            debug!(tool = %tool.display(), "tool appeared while waiting for lock");
            return Ok(false);
        }
        info!(tool = %tool.display(), "building missing tool");
        build()?;
        if !file_exists(tool) {
            return Err(StageError::io(
                tool,
                std::io::Error::new(std::io::ErrorKind::NotFound, "tool still missing after build"),
            ));
        }
        Ok(true)
    }
}
