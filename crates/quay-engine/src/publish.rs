//! Artifact publication
//!
//! The publish step is intentionally narrow: given a finished artifact
//! directory, place it where it is served from and return the public URL.
//! Swapping in object storage or a CDN later only touches this seam.

use async_trait::async_trait;
use quay_core::{JobId, QuayError, Result};
use std::path::{Path, PathBuf};
use tracing::info;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Make `output_dir` publicly reachable under `name`, returning the URL
    async fn publish(&self, job_id: JobId, name: &str, output_dir: &Path) -> Result<String>;
}

/// Publishes by copying into a local directory served as static files
pub struct LocalPublisher {
    output_root: PathBuf,
    public_base: String,
}

impl LocalPublisher {
    pub fn new(output_root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            output_root: output_root.into(),
            public_base: public_base.into(),
        }
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, job_id: JobId, name: &str, output_dir: &Path) -> Result<String> {
        let source = output_dir.to_path_buf();
        let dest = self.output_root.join(name);
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| QuayError::Publish(format!("publish task failed: {}", e)))?
            .map_err(|e| QuayError::Publish(format!("copying artifact failed: {}", e)))?;

        let url = format!("{}/{}/", self.public_base.trim_end_matches('/'), name);
        info!(job_id = %job_id, name = %name, url = %url, "Published artifact");
        Ok(url)
    }
}

/// Replace `dest` with a recursive copy of `source`. Removing first keeps a
/// republished site from serving files the new build no longer emits.
fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dest)?;
    copy_dir_recursive(source, dest)
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
