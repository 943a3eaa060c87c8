//! Build execution
//!
//! Derives build steps from the project's manifest and runs them one at a
//! time, streaming child output onto the event bus. Arguments are always
//! passed as a discrete list; nothing here goes through a shell.

use quay_core::{JobId, LogLevel, QuayError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::warn;

use crate::bus::EventBus;

/// One external command with job-specific environment overrides
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            envs: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// The command as one log-friendly line
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Ordered build steps for one job
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    pub steps: Vec<CommandSpec>,
}

impl BuildPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Derive build steps from the materialized tree. A `package.json` gets an
/// npm install, plus `npm run build` when a build script is declared;
/// anything else is published as-is with no build.
pub fn plan_build(workdir: &Path) -> BuildPlan {
    let manifest = workdir.join("package.json");
    if !manifest.is_file() {
        return BuildPlan::default();
    }

    let mut steps = vec![
        CommandSpec::new("npm", &["install", "--no-audit", "--no-fund"]).with_env("CI", "true"),
    ];

    // A malformed manifest still gets the install step; npm reports the
    // parse error itself, in the job's own log.
    let has_build_script = std::fs::read_to_string(&manifest)
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .map(|json| json.get("scripts").and_then(|s| s.get("build")).is_some())
        .unwrap_or(false);
    if has_build_script {
        steps.push(CommandSpec::new("npm", &["run", "build"]).with_env("CI", "true"));
    }

    BuildPlan { steps }
}

const OUTPUT_CANDIDATES: [&str; 2] = ["dist", "build"];

/// Locate the directory a build emitted, if any
pub fn resolve_output_dir(workdir: &Path) -> Option<PathBuf> {
    OUTPUT_CANDIDATES
        .iter()
        .map(|candidate| workdir.join(candidate))
        .find(|path| path.is_dir())
}

/// Run one build step to completion, forwarding stdout as `info` lines and
/// stderr as `warning` lines. Build tools write routine progress to stderr,
/// so stderr is not treated as failure; only the exit code is.
pub async fn run_step(
    job_id: JobId,
    workdir: &Path,
    step: &CommandSpec,
    bus: &EventBus,
) -> Result<()> {
    let command_line = step.display();
    bus.append_log(job_id, format!("Running `{}`", command_line), LogLevel::Info)
        .await;

    let mut command = Command::new(&step.program);
    command
        .args(&step.args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &step.envs {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            bus.append_log(
                job_id,
                format!("Failed to start `{}`: {}", command_line, e),
                LogLevel::Warning,
            )
            .await;
            return Err(QuayError::CommandFailed {
                command: command_line,
                code: -1,
            });
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| QuayError::Other("child stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| QuayError::Other("child stderr was not captured".to_string()))?;

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => match line {
                Ok(Some(line)) => {
                    let line = strip_ansi(&line);
                    if !line.is_empty() {
                        bus.append_log(job_id, line, LogLevel::Info).await;
                    }
                }
                Ok(None) => stdout_done = true,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Error reading child stdout");
                    stdout_done = true;
                }
            },
            line = stderr_lines.next_line(), if !stderr_done => match line {
                Ok(Some(line)) => {
                    let line = strip_ansi(&line);
                    if !line.is_empty() {
                        bus.append_log(job_id, line, LogLevel::Warning).await;
                    }
                }
                Ok(None) => stderr_done = true,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Error reading child stderr");
                    stderr_done = true;
                }
            },
        }
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(QuayError::CommandFailed {
            command: command_line,
            code: status.code().unwrap_or(-1),
        })
    }
}

static ANSI: OnceLock<Regex> = OnceLock::new();

fn ansi_pattern() -> &'static Regex {
    // CSI sequences plus OSC sequences terminated by BEL or ST
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap()
    })
}

/// Remove terminal escape sequences; viewers are not terminals
pub fn strip_ansi(line: &str) -> String {
    ansi_pattern().replace_all(line, "").into_owned()
}
