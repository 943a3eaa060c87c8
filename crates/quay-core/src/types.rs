//! Core type definitions for Quay deployments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Severity of a single log entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Success => write!(f, "success"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// Lifecycle state of a deployment job
///
/// Transitions walk forward only: `Idle → Analyzing → Building → Deploying`
/// and then exactly one of the terminal states. `Failed` is reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Analyzing,
    Building,
    Deploying,
    Success,
    Failed,
}

impl JobStatus {
    /// True for `Success` and `Failed`; no transitions leave a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Position in the forward walk. Terminal states share the top rank,
    /// so a store can accept a transition iff the rank strictly increases.
    pub fn phase_rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Analyzing => 1,
            Self::Building => 2,
            Self::Deploying => 3,
            Self::Success | Self::Failed => 4,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Building => write!(f, "building"),
            Self::Deploying => write!(f, "deploying"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "analyzing" => Ok(Self::Analyzing),
            "building" => Ok(Self::Building),
            "deploying" => Ok(Self::Deploying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// How a project's sources are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// A repository reference resolved via branch-archive downloads
    GitReference,
    /// A gzipped tarball, uploaded or fetched by URL
    Archive,
    /// Markup supplied inline in the submission itself
    InlineMarkup,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GitReference => write!(f, "git-reference"),
            Self::Archive => write!(f, "archive"),
            Self::InlineMarkup => write!(f, "inline-markup"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "git-reference" | "git_reference" | "git" => Ok(Self::GitReference),
            "archive" | "tarball" => Ok(Self::Archive),
            "inline-markup" | "inline_markup" | "inline" => Ok(Self::InlineMarkup),
            _ => Err(format!("Invalid source kind: {}", s)),
        }
    }
}

/// Opaque identifier for one deployment job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid job id: {}", e))
    }
}

/// Immutable descriptor of what to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Site name; also the artifact's path segment once published
    pub name: String,

    /// How `source` is interpreted
    pub source_kind: SourceKind,

    /// Repository reference or archive URL; `None` for inline markup and
    /// payload-attached archives
    #[serde(default)]
    pub source: Option<String>,

    /// Markup body for `inline-markup` submissions
    #[serde(default)]
    pub inline_content: Option<String>,

    /// Pre-resolved working directory, set when an earlier analysis step
    /// already produced a source tree
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl Project {
    pub fn new(name: impl Into<String>, source_kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            source_kind,
            source: None,
            inline_content: None,
            workdir: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_inline_content(mut self, content: impl Into<String>) -> Self {
        self.inline_content = Some(content.into());
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

/// Validate a project name for use as a path segment and host label.
///
/// Lowercase alphanumerics and hyphens, at most 63 characters, no leading
/// or trailing hyphen.
pub fn validate_project_name(name: &str) -> crate::Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(crate::QuayError::InvalidProject(format!(
            "project name must be 1-63 characters, got {}",
            name.len()
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(crate::QuayError::InvalidProject(
            "project name must not start or end with a hyphen".to_string(),
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(crate::QuayError::InvalidProject(format!(
            "project name contains invalid character {:?}",
            bad
        )));
    }
    Ok(())
}

/// One append-only progress line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, level: LogLevel) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level,
        }
    }
}

/// Event broadcast to viewers, in the wire shape consumers parse
///
/// Serialized form is exactly `{"type":"log","message":...,"level":...}`
/// or `{"type":"status","status":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    Log { message: String, level: LogLevel },
    Status { status: JobStatus },
}

impl JobEvent {
    pub fn log(message: impl Into<String>, level: LogLevel) -> Self {
        Self::Log {
            message: message.into(),
            level,
        }
    }

    pub fn status(status: JobStatus) -> Self {
        Self::Status { status }
    }
}

impl From<&LogEntry> for JobEvent {
    fn from(entry: &LogEntry) -> Self {
        Self::Log {
            message: entry.message.clone(),
            level: entry.level,
        }
    }
}

/// One end-to-end build-and-publish attempt
///
/// Owned by the coordinator, mutated only through the job store, evicted
/// after a retention window. Never persisted; durability of the outcome is
/// the caller's concern once a URL is returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project: Project,
    pub status: JobStatus,

    /// Materialized source tree; `None` until the analyzing phase completes
    pub workdir: Option<PathBuf>,

    /// Uploaded archive bytes attached at submission, if any
    #[serde(skip)]
    pub payload: Option<Vec<u8>>,

    /// Public URL, set when the job reaches `Success`
    pub public_url: Option<String>,

    /// Failure message, set when the job reaches `Failed`
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(project: Project) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            project,
            status: JobStatus::Idle,
            workdir: None,
            payload: None,
            public_url: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}
