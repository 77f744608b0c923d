use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A directory that only lives as long as this guard. Used for the intermediate SavedModel so it
/// gets removed whichever way the conversion ends, including when we unwind from a panic.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    keep: bool,
}

impl ScratchDir {
    /// Creates the directory. If it's already there it's left over from a run that didn't get to
    /// clean up, so the old contents are removed rather than mixed in with the new export.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            debug!("Removing stale {}", path.display());
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self { path, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the directory on disk when the guard is dropped
    pub fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.keep {
            warn!("Keeping {}", self.path.display());
            return;
        }
        // Never reported to the caller
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed {}", self.path.display()),
            Err(e) => debug!("Couldn't remove {}: {}", self.path.display(), e),
        }
    }
}
