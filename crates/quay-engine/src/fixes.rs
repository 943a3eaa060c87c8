//! Automated project fixes
//!
//! Small mutations applied to the source tree before (and once after) the
//! build so common scaffolding mistakes do not sink a deployment. Each fix
//! detects its own precondition and is applied at most once per job; a fix
//! that errors logs a warning and stays eligible for the next phase.

use quay_core::{JobId, LogLevel, QuayError, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::bus::EventBus;

/// Everything a fix may look at: the source tree and, after the build,
/// the emitted artifact directory
pub struct FixContext {
    pub job_id: JobId,
    pub workdir: PathBuf,
    pub output_dir: Option<PathBuf>,
}

/// Fix ids already applied for a job, carried across pipeline phases
pub type ExecutedFixSet = HashSet<&'static str>;

/// One detectable, applicable project mutation
pub trait Fix: Send + Sync {
    /// Stable identifier used to track execution
    fn id(&self) -> &'static str;

    /// Human-readable line shown in the deployment log
    fn description(&self) -> &'static str;

    fn detect(&self, ctx: &FixContext) -> Result<bool>;

    fn apply(&self, ctx: &FixContext) -> Result<()>;
}

/// Runs fixes in a fixed order, skipping ones already executed
pub struct FixPipeline {
    fixes: Vec<Box<dyn Fix>>,
}

impl FixPipeline {
    /// The standard fix set, in application order
    pub fn standard() -> Self {
        Self {
            fixes: vec![
                Box::new(MissingEntryScript),
                Box::new(PlaceholderEnvFile),
                Box::new(HardcodedLocalhost),
                Box::new(AbsoluteAssetPaths),
            ],
        }
    }

    pub fn with_fixes(fixes: Vec<Box<dyn Fix>>) -> Self {
        Self { fixes }
    }

    /// One pass over the fix set. Failures are logged and swallowed so a
    /// broken fix never takes the deployment down with it.
    pub async fn run(&self, ctx: &FixContext, executed: &mut ExecutedFixSet, bus: &EventBus) {
        for fix in &self.fixes {
            if executed.contains(fix.id()) {
                continue;
            }
            match fix.detect(ctx) {
                Ok(false) => continue,
                Ok(true) => {
                    bus.append_log(
                        ctx.job_id,
                        format!("Applying fix: {}", fix.description()),
                        LogLevel::Info,
                    )
                    .await;
                    match fix.apply(ctx) {
                        Ok(()) => {
                            bus.append_log(
                                ctx.job_id,
                                format!("Applied fix: {}", fix.description()),
                                LogLevel::Success,
                            )
                            .await;
                            executed.insert(fix.id());
                        }
                        Err(e) => {
                            bus.append_log(
                                ctx.job_id,
                                format!("Fix '{}' failed: {}", fix.id(), e),
                                LogLevel::Warning,
                            )
                            .await;
                        }
                    }
                }
                Err(e) => {
                    bus.append_log(
                        ctx.job_id,
                        format!("Fix '{}' detection failed: {}", fix.id(), e),
                        LogLevel::Warning,
                    )
                    .await;
                }
            }
        }
    }
}

/// Adds a module script tag to `index.html` when an entry script exists
/// but is never referenced
pub struct MissingEntryScript;

const ENTRY_CANDIDATES: [&str; 4] = [
    "src/main.jsx",
    "src/main.tsx",
    "src/main.js",
    "src/main.ts",
];

impl MissingEntryScript {
    fn entry_for(workdir: &Path) -> Option<&'static str> {
        ENTRY_CANDIDATES
            .iter()
            .find(|candidate| workdir.join(candidate).is_file())
            .copied()
    }
}

impl Fix for MissingEntryScript {
    fn id(&self) -> &'static str {
        "missing-entry-script"
    }

    fn description(&self) -> &'static str {
        "reference the entry script from index.html"
    }

    fn detect(&self, ctx: &FixContext) -> Result<bool> {
        let index = ctx.workdir.join("index.html");
        if !index.is_file() || Self::entry_for(&ctx.workdir).is_none() {
            return Ok(false);
        }
        let html = std::fs::read_to_string(&index)?;
        Ok(!html.contains("type=\"module\""))
    }

    fn apply(&self, ctx: &FixContext) -> Result<()> {
        let entry = Self::entry_for(&ctx.workdir).ok_or_else(|| {
            QuayError::Fix("entry script disappeared between detect and apply".to_string())
        })?;
        let index = ctx.workdir.join("index.html");
        let mut html = std::fs::read_to_string(&index)?;
        let tag = format!("<script type=\"module\" src=\"/{}\"></script>", entry);
        match html.rfind("</body>") {
            Some(at) => html.insert_str(at, &format!("  {}\n", tag)),
            None => {
                html.push('\n');
                html.push_str(&tag);
            }
        }
        std::fs::write(&index, html)?;
        Ok(())
    }
}

/// Writes a placeholder `.env` when the code reads `import.meta.env`
/// variables no file provides
pub struct PlaceholderEnvFile;

static ENV_REF: OnceLock<Regex> = OnceLock::new();

fn env_ref_pattern() -> &'static Regex {
    ENV_REF.get_or_init(|| Regex::new(r"import\.meta\.env\.(VITE_[A-Z0-9_]+)").unwrap())
}

impl PlaceholderEnvFile {
    fn referenced_vars(workdir: &Path) -> Result<BTreeSet<String>> {
        let mut vars = BTreeSet::new();
        visit_source_files(workdir, &["js", "jsx", "ts", "tsx", "html"], &mut |_, content| {
            for caps in env_ref_pattern().captures_iter(content) {
                vars.insert(caps[1].to_string());
            }
            Ok(())
        })?;
        Ok(vars)
    }
}

impl Fix for PlaceholderEnvFile {
    fn id(&self) -> &'static str {
        "placeholder-env-file"
    }

    fn description(&self) -> &'static str {
        "create a placeholder .env for referenced variables"
    }

    fn detect(&self, ctx: &FixContext) -> Result<bool> {
        if ctx.workdir.join(".env").exists() {
            return Ok(false);
        }
        Ok(!Self::referenced_vars(&ctx.workdir)?.is_empty())
    }

    fn apply(&self, ctx: &FixContext) -> Result<()> {
        let vars = Self::referenced_vars(&ctx.workdir)?;
        let mut body = String::new();
        for var in &vars {
            body.push_str(var);
            body.push_str("=placeholder\n");
        }
        std::fs::write(ctx.workdir.join(".env"), body)?;
        Ok(())
    }
}

/// Rewrites hardcoded localhost origins to relative URLs so the deployed
/// artifact talks to its own host
pub struct HardcodedLocalhost;

static LOCALHOST: OnceLock<Regex> = OnceLock::new();

fn localhost_pattern() -> &'static Regex {
    LOCALHOST.get_or_init(|| {
        Regex::new(r"https?://(?:localhost|127\.0\.0\.1)(?::\d+)?").unwrap()
    })
}

const CODE_EXTENSIONS: [&str; 5] = ["js", "jsx", "ts", "tsx", "html"];

impl Fix for HardcodedLocalhost {
    fn id(&self) -> &'static str {
        "hardcoded-localhost"
    }

    fn description(&self) -> &'static str {
        "rewrite hardcoded localhost URLs to relative paths"
    }

    fn detect(&self, ctx: &FixContext) -> Result<bool> {
        let mut found = false;
        visit_source_files(&ctx.workdir, &CODE_EXTENSIONS, &mut |_, content| {
            if localhost_pattern().is_match(content) {
                found = true;
            }
            Ok(())
        })?;
        Ok(found)
    }

    fn apply(&self, ctx: &FixContext) -> Result<()> {
        let mut rewrites: Vec<(PathBuf, String)> = Vec::new();
        visit_source_files(&ctx.workdir, &CODE_EXTENSIONS, &mut |path, content| {
            if localhost_pattern().is_match(content) {
                let replaced = localhost_pattern().replace_all(content, "").into_owned();
                rewrites.push((path.to_path_buf(), replaced));
            }
            Ok(())
        })?;
        for (path, content) in rewrites {
            std::fs::write(path, content)?;
        }
        Ok(())
    }
}

/// Rewrites absolute `/assets/` references in built output to relative
/// ones, so artifacts served under a subpath still resolve
pub struct AbsoluteAssetPaths;

static ABSOLUTE_ASSET: OnceLock<Regex> = OnceLock::new();

fn absolute_asset_pattern() -> &'static Regex {
    ABSOLUTE_ASSET.get_or_init(|| Regex::new(r#"(["'(])/assets/"#).unwrap())
}

impl AbsoluteAssetPaths {
    /// Top-level html and css files in the build output
    fn output_files(output_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(output_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "html" || e == "css")
                .unwrap_or(false);
            if matches {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl Fix for AbsoluteAssetPaths {
    fn id(&self) -> &'static str {
        "absolute-asset-paths"
    }

    fn description(&self) -> &'static str {
        "rewrite absolute asset paths in built output"
    }

    fn detect(&self, ctx: &FixContext) -> Result<bool> {
        let Some(output_dir) = &ctx.output_dir else {
            return Ok(false);
        };
        for path in Self::output_files(output_dir)? {
            if absolute_asset_pattern().is_match(&std::fs::read_to_string(&path)?) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn apply(&self, ctx: &FixContext) -> Result<()> {
        let output_dir = ctx.output_dir.as_ref().ok_or_else(|| {
            QuayError::Fix("asset path fix ran without a build output directory".to_string())
        })?;
        for path in Self::output_files(output_dir)? {
            let content = std::fs::read_to_string(&path)?;
            if absolute_asset_pattern().is_match(&content) {
                let replaced = absolute_asset_pattern()
                    .replace_all(&content, "${1}./assets/")
                    .into_owned();
                std::fs::write(&path, replaced)?;
            }
        }
        Ok(())
    }
}

const SKIP_DIRS: [&str; 3] = ["node_modules", "dist", "build"];

/// Walk text source files under `dir`, skipping dependency and output
/// directories. Non-UTF8 files are passed over.
fn visit_source_files(
    dir: &Path,
    extensions: &[&str],
    visit: &mut dyn FnMut(&Path, &str) -> Result<()>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            visit_source_files(&path, extensions, visit)?;
        } else if file_type.is_file() {
            let wanted = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.contains(&e))
                .unwrap_or(false);
            if !wanted {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => visit(&path, &content)?,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
