//! Deployment coordination
//!
//! The coordinator owns the job lifecycle end to end: validate the
//! submission, materialize sources, run fixes and build steps, publish,
//! and advance status monotonically through the store and bus together.
//! Background tasks are supervised so a panic ends in `Failed`, never in
//! a job stuck mid-phase.

use chrono::{Duration, Utc};
use quay_core::{
    validate_project_name, EngineConfig, Job, JobId, JobStatus, LogLevel, Project, QuayConfig,
    QuayError, Result, SourceKind,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::build::{plan_build, resolve_output_dir, run_step};
use crate::bus::EventBus;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::fixes::{ExecutedFixSet, FixContext, FixPipeline};
use crate::publish::{LocalPublisher, Publisher};
use crate::source::Materializer;
use crate::store::{JobStore, MemoryJobStore};

pub struct Coordinator {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    materializer: Materializer,
    pipeline: FixPipeline,
    publisher: Arc<dyn Publisher>,
    work_root: PathBuf,
    retention: Duration,
}

impl Coordinator {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn JobStore>,
        bus: Arc<EventBus>,
        fetcher: Arc<dyn Fetcher>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            store,
            bus,
            materializer: Materializer::new(config, fetcher),
            pipeline: FixPipeline::standard(),
            publisher,
            work_root: config.work_root.clone(),
            retention: Duration::seconds(config.retention_secs as i64),
        }
    }

    /// Coordinator wired with the in-memory store, HTTP fetcher, and local
    /// publisher described by `config`
    pub fn from_config(config: &QuayConfig) -> Arc<Self> {
        let engine = &config.engine;
        Arc::new(Self::new(
            engine,
            Arc::new(MemoryJobStore::new()),
            Arc::new(EventBus::new()),
            Arc::new(HttpFetcher::new(engine.max_archive_bytes)),
            Arc::new(LocalPublisher::new(
                engine.output_root.clone(),
                engine.public_base.clone(),
            )),
        ))
    }

    pub fn with_pipeline(mut self, pipeline: FixPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub async fn job(&self, id: &JobId) -> Result<Job> {
        self.store.get(id).await
    }

    /// Validate and register a submission, then run it in the background.
    /// Returns as soon as the job record and its event channel exist, so
    /// callers can subscribe without missing anything.
    pub async fn submit(self: &Arc<Self>, project: Project) -> Result<JobId> {
        validate_submission(&project, false)?;
        self.launch(Job::new(project)).await
    }

    /// Archive submission carrying the uploaded bytes directly
    pub async fn submit_with_payload(
        self: &Arc<Self>,
        project: Project,
        payload: Vec<u8>,
    ) -> Result<JobId> {
        if project.source_kind != SourceKind::Archive {
            return Err(QuayError::InvalidProject(
                "only archive submissions may carry a payload".to_string(),
            ));
        }
        validate_submission(&project, true)?;
        self.launch(Job::new(project).with_payload(payload)).await
    }

    async fn launch(self: &Arc<Self>, job: Job) -> Result<JobId> {
        let id = job.id;
        self.bus.register(id).await;
        self.store.insert(job).await?;
        info!(job_id = %id, "Job submitted");
        self.clone().spawn_supervised(id);
        Ok(id)
    }

    /// Fire-and-forget with a supervisor: the outer task converts a panic
    /// in the pipeline into a `Failed` job instead of a silent hang.
    fn spawn_supervised(self: Arc<Self>, id: JobId) {
        tokio::spawn(async move {
            let coordinator = self.clone();
            let handle = tokio::spawn(async move { coordinator.run_to_completion(id).await });
            if let Err(join_err) = handle.await {
                error!(job_id = %id, error = %join_err, "Deployment task aborted");
                self.fail(
                    id,
                    &QuayError::Other("internal failure while deploying".to_string()),
                )
                .await;
            }
        });
    }

    /// Drive `id` through the pipeline on the current task, finishing in a
    /// terminal state. `submit` spawns this already; call it directly only
    /// when completion must be awaited. Starting a job that already left
    /// `Idle` is a no-op.
    pub async fn run_to_completion(&self, id: JobId) {
        match self.advance(id, JobStatus::Analyzing).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.fail(id, &e).await;
                return;
            }
        }
        if let Err(e) = self.run_phases(id).await {
            self.fail(id, &e).await;
        }
    }

    async fn run_phases(&self, id: JobId) -> Result<()> {
        let job = self.store.get(&id).await?;
        self.bus
            .append_log(id, "Preparing sources", LogLevel::Info)
            .await;
        let workdir = self.materializer.materialize(&job, &self.bus).await?;
        self.store.set_workdir(&id, workdir.clone()).await?;

        if !self.advance(id, JobStatus::Building).await? {
            return Ok(());
        }
        let mut executed = ExecutedFixSet::new();
        let mut ctx = FixContext {
            job_id: id,
            workdir: workdir.clone(),
            output_dir: None,
        };
        self.pipeline.run(&ctx, &mut executed, &self.bus).await;

        let plan = plan_build(&workdir);
        if plan.is_empty() {
            self.bus
                .append_log(
                    id,
                    "No build manifest found, publishing files as-is",
                    LogLevel::Info,
                )
                .await;
        }
        for step in &plan.steps {
            run_step(id, &workdir, step, &self.bus).await?;
        }

        // In a static project a dist/ or build/ directory is content,
        // not build output; only a plan that ran resolves an emit dir.
        let output_dir = if plan.is_empty() {
            workdir.clone()
        } else {
            match resolve_output_dir(&workdir) {
                Some(dir) => dir,
                None => {
                    self.bus
                        .append_log(
                            id,
                            "Build emitted no dist/ or build/ directory, publishing the project root",
                            LogLevel::Warning,
                        )
                        .await;
                    workdir.clone()
                }
            }
        };
        ctx.output_dir = Some(output_dir.clone());
        self.pipeline.run(&ctx, &mut executed, &self.bus).await;

        if !self.advance(id, JobStatus::Deploying).await? {
            return Ok(());
        }
        let url = self
            .publisher
            .publish(id, &job.project.name, &output_dir)
            .await?;
        self.store.set_public_url(&id, url.clone()).await?;
        self.bus
            .append_log(id, format!("Deployment complete: {}", url), LogLevel::Success)
            .await;
        self.advance(id, JobStatus::Success).await?;
        Ok(())
    }

    /// Move `id` to `status` in the store and, only when the store accepts
    /// the transition, broadcast it. The stream never shows a transition
    /// the record did not take.
    async fn advance(&self, id: JobId, status: JobStatus) -> Result<bool> {
        let accepted = self.store.update_status(&id, status).await?;
        if accepted {
            self.bus.update_status(id, status).await;
        }
        Ok(accepted)
    }

    async fn fail(&self, id: JobId, cause: &QuayError) {
        let message = cause.to_string();
        error!(job_id = %id, error = %message, "Deployment failed");
        self.bus
            .append_log(id, message.clone(), LogLevel::Error)
            .await;
        if let Err(e) = self.store.set_error(&id, message).await {
            warn!(job_id = %id, error = %e, "Failed to record job error");
        }
        if let Err(e) = self.advance(id, JobStatus::Failed).await {
            warn!(job_id = %id, error = %e, "Failed to mark job failed");
        }
    }

    /// Drop finished jobs older than the retention window, along with
    /// their event channels and working directories. Directories outside
    /// `work_root` were prepared by the caller and stay untouched.
    pub async fn evict_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.retention;
        let evicted = self.store.evict_finished_before(cutoff).await?;
        for job in &evicted {
            self.bus.remove(&job.id).await;
            if let Some(workdir) = &job.workdir {
                if workdir.starts_with(&self.work_root) {
                    if let Err(e) = tokio::fs::remove_dir_all(workdir).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(job_id = %job.id, error = %e, "Failed to remove workdir");
                        }
                    }
                }
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted finished jobs");
        }
        Ok(evicted.len())
    }
}

fn validate_submission(project: &Project, has_payload: bool) -> Result<()> {
    validate_project_name(&project.name)?;
    if project.workdir.is_some() {
        return Ok(());
    }
    let blank = |value: &Option<String>| {
        value.as_deref().map(str::trim).map_or(true, str::is_empty)
    };
    match project.source_kind {
        SourceKind::GitReference => {
            if blank(&project.source) {
                return Err(QuayError::InvalidProject(
                    "git-reference submissions need a repository reference".to_string(),
                ));
            }
        }
        SourceKind::Archive => {
            if !has_payload && blank(&project.source) {
                return Err(QuayError::InvalidProject(
                    "archive submissions need an archive URL or an uploaded payload".to_string(),
                ));
            }
        }
        SourceKind::InlineMarkup => {
            if blank(&project.inline_content) {
                return Err(QuayError::InvalidProject(
                    "inline-markup submissions need markup content".to_string(),
                ));
            }
        }
    }
    Ok(())
}
