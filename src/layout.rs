//! On-disk layout of a sync directory
//!
//! ```text
//! <sync_dir>/
//!   xochitl-dirty/        device rsyncs here (external writer)
//!   xochitl-staging/      staged snapshot of dirty
//!   stable/
//!     xochitl/            promoted snapshot, input to processing
//!     process_out/        processing output, served by the viewer
//!   syncflag              present while dirty holds unstaged data
//!   syncd.lock            single-instance lock
//! ```

use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DIRTY_DIR: &str = "xochitl-dirty";
pub const STAGING_DIR: &str = "xochitl-staging";
pub const STABLE_DIR: &str = "stable";
pub const SOURCE_DIR: &str = "xochitl";
pub const OUTPUT_DIR: &str = "process_out";
pub const SYNCFLAG: &str = "syncflag";
pub const LOCK_FILE: &str = "syncd.lock";

/// Paths of one sync directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLayout {
    root: PathBuf,
}

impl SyncLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dirty(&self) -> PathBuf {
        self.root.join(DIRTY_DIR)
    }

    pub fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn stable(&self) -> PathBuf {
        self.root.join(STABLE_DIR)
    }

    /// Promoted snapshot handed to the processing step
    pub fn source(&self) -> PathBuf {
        self.stable().join(SOURCE_DIR)
    }

    /// Output directory owned by the processing step
    pub fn output(&self) -> PathBuf {
        self.stable().join(OUTPUT_DIR)
    }

    pub fn syncflag(&self) -> PathBuf {
        self.root.join(SYNCFLAG)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn syncflag_exists(&self) -> bool {
        self.syncflag().exists()
    }

    /// Directories the daemon expects, in creation order
    pub fn directories(&self) -> [PathBuf; 5] {
        [
            self.dirty(),
            self.staging(),
            self.stable(),
            self.source(),
            self.output(),
        ]
    }

    /// Create every directory of the layout. Never touches `syncflag`.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in self.directories() {
            std::fs::create_dir_all(&dir)?;
        }
        info!("Directory structure ensured under {}", self.root.display());
        Ok(())
    }

    /// Directories of the layout that do not exist yet
    pub fn missing_dirs(&self) -> Vec<PathBuf> {
        self.directories()
            .into_iter()
            .filter(|dir| !dir.is_dir())
            .collect()
    }
}
