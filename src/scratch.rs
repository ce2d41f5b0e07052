use crate::error::CfResult;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const MANIFEST_FILE: &str = "manifest.yml";
const PAYLOAD_DIR: &str = "payload";
const PLACEHOLDER_FILE: &str = "placeholder.txt";

/// Temporary working directory owned by a single migration run.
///
/// Holds the exported manifest and the placeholder payload pushed before the real
/// bits are copied over. Removed on [ScratchArea::release] or when dropped.
#[derive(Debug)]
pub struct ScratchArea {
    dir: TempDir,
}

impl ScratchArea {
    pub fn acquire() -> CfResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("bg-change-stack")
            .tempdir()?;
        debug!("Scratch area at {}", dir.path().display());
        Ok(Self { dir })
    }

    /// Create the scratch area below `parent` instead of the system temp dir
    pub fn acquire_in(parent: impl AsRef<Path>) -> CfResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("bg-change-stack")
            .tempdir_in(parent)?;
        debug!("Scratch area at {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.path().join(MANIFEST_FILE)
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.dir.path().join(PAYLOAD_DIR)
    }

    pub fn release(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!("Removed scratch area {}", path.display()),
            Err(e) => warn!("Failed to remove scratch area {}: {}", path.display(), e),
        }
    }
}

/// Write the placeholder pushed as the provisional app's content.
///
/// Staging needs a non-empty payload, the contents are never run.
pub async fn stage_placeholder(payload_dir: &Path) -> CfResult<PathBuf> {
    tokio::fs::create_dir_all(payload_dir).await?;
    let file = payload_dir.join(PLACEHOLDER_FILE);
    tokio::fs::write(&file, b"bg-change-stack placeholder\n").await?;
    Ok(file)
}
