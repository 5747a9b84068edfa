use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

use crate::error::AgentError;

/// Well-known artifact names. Each cycle overwrites the previous file.
pub const SCREEN: &str = "screen.png";
pub const DRAWING: &str = "drawing.png";
pub const RAW_HTML: &str = "raw_html.html";
pub const PRUNED_HTML: &str = "pruned_html.html";

/// Sink for per-cycle debug artifacts. Writes are best effort; callers log
/// failures and carry on.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), AgentError>;
}

pub struct NullArtifacts;

#[async_trait]
impl ArtifactStore for NullArtifacts {
    async fn save(&self, _name: &str, _bytes: &[u8]) -> Result<(), AgentError> {
        Ok(())
    }
}

pub struct DiskArtifacts {
    base_dir: PathBuf,
}

impl DiskArtifacts {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base_dir: base.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ArtifactStore for DiskArtifacts {
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), AgentError> {
        async_fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| AgentError::Artifact(format!("create_dir: {}", e)))?;
        let path = self.base_dir.join(name);
        async_fs::write(&path, bytes)
            .await
            .map_err(|e| AgentError::Artifact(format!("write {}: {}", path.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disk_artifacts_overwrite_the_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskArtifacts::new(dir.path().join("debug"));
        store.save(RAW_HTML, b"<p>first</p>").await.unwrap();
        store.save(RAW_HTML, b"<p>second</p>").await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("debug").join(RAW_HTML)).unwrap();
        assert_eq!(written, "<p>second</p>");
    }
}
