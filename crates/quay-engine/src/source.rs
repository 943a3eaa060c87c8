//! Source materialization
//!
//! Turns a project reference into a clean working directory. Git references
//! are resolved through branch-archive downloads rather than clones; the
//! branch name is not knowable up front, so candidates are tried in order.

use bytes::Bytes;
use flate2::read::GzDecoder;
use quay_core::{EngineConfig, Job, LogLevel, QuayError, Result, SourceKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::Archive;

use crate::bus::EventBus;
use crate::fetch::Fetcher;

/// A parsed `owner/repo` reference on a known host
#[derive(Debug, Clone, PartialEq, Eq)]
struct GitReference {
    host: String,
    owner: String,
    repo: String,
}

impl GitReference {
    /// Accepts `owner/repo` (host defaults to github.com) or a full
    /// `http(s)://host/owner/repo` URL, with or without a `.git` suffix.
    fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim().trim_end_matches('/');
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

        let (host, path) = match trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
        {
            Some(rest) => match rest.split_once('/') {
                Some((host, path)) => (host, path),
                None => {
                    return Err(QuayError::Materialize(format!(
                        "git reference {} has no repository path",
                        source
                    )))
                }
            },
            None => ("github.com", trimmed),
        };

        let mut segments = path.split('/');
        let owner = segments.next().unwrap_or("");
        let repo = segments.next().unwrap_or("");
        if owner.is_empty() || repo.is_empty() || segments.next().is_some() {
            return Err(QuayError::Materialize(format!(
                "git reference {} is not of the form owner/repo",
                source
            )));
        }

        let valid = |s: &str| {
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid(owner) || !valid(repo) {
            return Err(QuayError::Materialize(format!(
                "git reference {} contains invalid characters",
                source
            )));
        }

        Ok(Self {
            host: host.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn archive_url(&self, branch: &str) -> String {
        format!(
            "https://{}/{}/{}/archive/refs/heads/{}.tar.gz",
            self.host, self.owner, self.repo, branch
        )
    }
}

/// Resolves project references into working directories under `work_root`
pub struct Materializer {
    fetcher: Arc<dyn Fetcher>,
    work_root: PathBuf,
    allowed_hosts: Vec<String>,
    branch_candidates: Vec<String>,
    max_archive_bytes: u64,
}

impl Materializer {
    pub fn new(config: &EngineConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            work_root: config.work_root.clone(),
            allowed_hosts: config.allowed_hosts.clone(),
            branch_candidates: config.branch_candidates.clone(),
            max_archive_bytes: config.max_archive_bytes,
        }
    }

    /// Produce the working directory for `job`, fully reset beforehand so a
    /// re-triggered job never sees stale files. Partial results are not
    /// left usable: any error here fails the job.
    pub async fn materialize(&self, job: &Job, bus: &EventBus) -> Result<PathBuf> {
        if let Some(dir) = &job.project.workdir {
            if dir.is_dir() {
                bus.append_log(
                    job.id,
                    format!("Using prepared sources at {}", dir.display()),
                    LogLevel::Info,
                )
                .await;
                return Ok(dir.clone());
            }
            return Err(QuayError::Materialize(format!(
                "prepared working directory {} does not exist",
                dir.display()
            )));
        }

        let workdir = self.work_root.join(job.id.to_string());
        reset_dir(&workdir).await?;

        match job.project.source_kind {
            SourceKind::GitReference => {
                self.materialize_git_reference(job, &workdir, bus).await?
            }
            SourceKind::Archive => self.materialize_archive(job, &workdir, bus).await?,
            SourceKind::InlineMarkup => self.materialize_inline(job, &workdir, bus).await?,
        }
        Ok(workdir)
    }

    async fn materialize_git_reference(
        &self,
        job: &Job,
        workdir: &Path,
        bus: &EventBus,
    ) -> Result<()> {
        let source = job.project.source.as_deref().ok_or_else(|| {
            QuayError::Materialize("git-reference submission carries no source".to_string())
        })?;
        let reference = GitReference::parse(source)?;
        if !self.allowed_hosts.iter().any(|h| h == &reference.host) {
            return Err(QuayError::UnsupportedHost(reference.host));
        }

        let mut last_error: Option<QuayError> = None;
        for branch in &self.branch_candidates {
            let url = reference.archive_url(branch);
            bus.append_log(
                job.id,
                format!("Fetching {} at branch '{}'", reference.slug(), branch),
                LogLevel::Info,
            )
            .await;
            match self.fetcher.fetch(&url).await {
                Ok(bytes) => {
                    extract_archive(bytes, workdir).await?;
                    bus.append_log(
                        job.id,
                        format!("Materialized sources from branch '{}'", branch),
                        LogLevel::Success,
                    )
                    .await;
                    return Ok(());
                }
                Err(e) => {
                    bus.append_log(
                        job.id,
                        format!("Branch '{}' unavailable: {}", branch, e),
                        LogLevel::Warning,
                    )
                    .await;
                    last_error = Some(e);
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no branch candidates configured".to_string());
        Err(QuayError::Materialize(format!(
            "no branch candidate for {} succeeded: {}",
            reference.slug(),
            detail
        )))
    }

    async fn materialize_archive(&self, job: &Job, workdir: &Path, bus: &EventBus) -> Result<()> {
        let bytes = if let Some(payload) = &job.payload {
            if payload.len() as u64 > self.max_archive_bytes {
                return Err(QuayError::Materialize(format!(
                    "uploaded archive is {} bytes, limit is {}",
                    payload.len(),
                    self.max_archive_bytes
                )));
            }
            bus.append_log(
                job.id,
                format!("Extracting uploaded archive ({} bytes)", payload.len()),
                LogLevel::Info,
            )
            .await;
            Bytes::from(payload.clone())
        } else if let Some(url) = job.project.source.as_deref() {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(QuayError::Materialize(format!(
                    "archive source must be an http(s) URL, got {}",
                    url
                )));
            }
            bus.append_log(
                job.id,
                format!("Downloading archive from {}", url),
                LogLevel::Info,
            )
            .await;
            self.fetcher.fetch(url).await?
        } else {
            return Err(QuayError::Materialize(
                "archive submission carries neither a payload nor a URL".to_string(),
            ));
        };

        extract_archive(bytes, workdir).await?;
        bus.append_log(job.id, "Archive extracted", LogLevel::Success)
            .await;
        Ok(())
    }

    async fn materialize_inline(&self, job: &Job, workdir: &Path, bus: &EventBus) -> Result<()> {
        let content = job.project.inline_content.as_deref().ok_or_else(|| {
            QuayError::Materialize("inline-markup submission carries no content".to_string())
        })?;
        tokio::fs::write(workdir.join("index.html"), content).await?;
        bus.append_log(job.id, "Wrote inline markup as index.html", LogLevel::Info)
            .await;
        Ok(())
    }
}

/// Recursively remove `dir` if present, then recreate it empty
pub(crate) async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Unpack a gzipped tarball into `dest` on the blocking pool, then flatten
/// a lone top-level directory so build tooling finds files at the root
async fn extract_archive(bytes: Bytes, dest: &Path) -> Result<()> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let decoder = GzDecoder::new(bytes.as_ref());
        let mut archive = Archive::new(decoder);
        archive
            .unpack(&dest)
            .map_err(|e| QuayError::Materialize(format!("archive extraction failed: {}", e)))?;
        flatten_single_root(&dest)
    })
    .await
    .map_err(|e| QuayError::Other(format!("extraction task failed: {}", e)))?
}

/// Branch archives and many uploads wrap everything in one `repo-branch/`
/// directory; hoist its children so the project root is the directory root.
fn flatten_single_root(dir: &Path) -> Result<()> {
    let entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() != 1 {
        return Ok(());
    }
    let only = &entries[0];
    if !only.file_type()?.is_dir() {
        return Ok(());
    }

    let root = only.path();
    for child in std::fs::read_dir(&root)? {
        let child = child?;
        std::fs::rename(child.path(), dir.join(child.file_name()))?;
    }
    std::fs::remove_dir(&root)?;
    Ok(())
}
