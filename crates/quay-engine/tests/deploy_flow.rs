//! End-to-end deployment flows with stubbed downloads and local publishing

use quay_core::{EngineConfig, Job, JobEvent, JobStatus, LogLevel, Project, SourceKind};
use quay_engine::{
    Coordinator, EventBus, LocalPublisher, MemoryJobStore, StubFetcher, Subscription,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config(root: &Path) -> EngineConfig {
    EngineConfig {
        work_root: root.join("work"),
        output_root: root.join("sites"),
        public_base: "http://localhost:8370/sites".to_string(),
        ..EngineConfig::default()
    }
}

fn coordinator_with(config: &EngineConfig, fetcher: StubFetcher) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(
        config,
        Arc::new(MemoryJobStore::new()),
        Arc::new(EventBus::new()),
        Arc::new(fetcher),
        Arc::new(LocalPublisher::new(
            config.output_root.clone(),
            config.public_base.clone(),
        )),
    ))
}

/// Register and drive a job on the current task so every status transition
/// is observable deterministically
async fn run_registered(coordinator: &Arc<Coordinator>, job: Job) {
    let id = job.id;
    coordinator.bus().register(id).await;
    coordinator.store().insert(job).await.unwrap();
    coordinator.run_to_completion(id).await;
}

fn drain_statuses(subscription: &mut Subscription) -> Vec<JobStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = subscription.receiver.try_recv() {
        if let JobEvent::Status { status } = event {
            statuses.push(status);
        }
    }
    statuses
}

fn gzipped_tarball(entries: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[tokio::test]
async fn test_inline_markup_deploys_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let coordinator = coordinator_with(&config, StubFetcher::new());

    let job = Job::new(
        Project::new("inline-site", SourceKind::InlineMarkup)
            .with_inline_content("<h1>shipped</h1>"),
    );
    let id = job.id;
    coordinator.bus().register(id).await;
    coordinator.store().insert(job).await.unwrap();
    let mut subscription = coordinator.bus().subscribe(id).await.unwrap();

    coordinator.run_to_completion(id).await;

    assert_eq!(
        drain_statuses(&mut subscription),
        vec![
            JobStatus::Analyzing,
            JobStatus::Building,
            JobStatus::Deploying,
            JobStatus::Success,
        ]
    );

    let job = coordinator.job(&id).await.unwrap();
    assert_eq!(
        job.public_url.as_deref(),
        Some("http://localhost:8370/sites/inline-site/")
    );
    assert!(job.error.is_none());

    let published = config.output_root.join("inline-site/index.html");
    assert_eq!(
        std::fs::read_to_string(published).unwrap(),
        "<h1>shipped</h1>"
    );

    let backlog = coordinator.bus().subscribe(id).await.unwrap().backlog;
    assert!(backlog
        .iter()
        .any(|e| e.level == LogLevel::Success && e.message.starts_with("Deployment complete:")));
}

#[tokio::test]
async fn test_unreachable_reference_fails_with_one_terminal_event() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let coordinator = coordinator_with(&config, StubFetcher::new());

    let job = Job::new(
        Project::new("gone-site", SourceKind::GitReference).with_source("octocat/gone"),
    );
    let id = job.id;
    coordinator.bus().register(id).await;
    coordinator.store().insert(job).await.unwrap();
    let mut subscription = coordinator.bus().subscribe(id).await.unwrap();

    coordinator.run_to_completion(id).await;

    assert_eq!(
        drain_statuses(&mut subscription),
        vec![JobStatus::Analyzing, JobStatus::Failed]
    );

    let job = coordinator.job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.expect("failed job should carry its error");
    assert!(error.contains("octocat/gone"));

    let backlog = coordinator.bus().subscribe(id).await.unwrap().backlog;
    assert!(backlog
        .iter()
        .any(|e| e.level == LogLevel::Error && e.message.contains("octocat/gone")));
}

#[tokio::test]
async fn test_fallback_branch_deploys() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let tarball = gzipped_tarball(&[("site-master/index.html", "<p>from master</p>")]);
    let fetcher = StubFetcher::new().with_response(
        "https://github.com/octocat/site/archive/refs/heads/master.tar.gz",
        tarball,
    );
    let coordinator = coordinator_with(&config, fetcher);

    let job = Job::new(
        Project::new("branchy-site", SourceKind::GitReference).with_source("octocat/site"),
    );
    let id = job.id;
    run_registered(&coordinator, job).await;

    assert_eq!(
        coordinator.job(&id).await.unwrap().status,
        JobStatus::Success
    );
    let published = config.output_root.join("branchy-site/index.html");
    assert_eq!(
        std::fs::read_to_string(published).unwrap(),
        "<p>from master</p>"
    );
}

#[tokio::test]
async fn test_submitted_archive_payload_deploys_in_background() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let coordinator = coordinator_with(&config, StubFetcher::new());

    let tarball = gzipped_tarball(&[
        ("bundle/index.html", "<p>uploaded</p>"),
        ("bundle/styles.css", "body{}"),
    ]);
    let id = coordinator
        .submit_with_payload(Project::new("uploaded-site", SourceKind::Archive), tarball)
        .await
        .unwrap();

    let job = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let job = coordinator.job(&id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job should reach a terminal state");

    assert_eq!(job.status, JobStatus::Success);
    assert!(config.output_root.join("uploaded-site/index.html").exists());
    assert!(config.output_root.join("uploaded-site/styles.css").exists());
}

#[tokio::test]
async fn test_static_project_keeps_its_own_dist_directory() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let coordinator = coordinator_with(&config, StubFetcher::new());

    // no package.json: dist/ here is the project's own content, and the
    // whole working directory must be published
    let tarball = gzipped_tarball(&[
        ("site/index.html", "<p>root page</p>"),
        ("site/dist/archive.html", "<p>old builds</p>"),
    ]);
    let job = Job::new(Project::new("static-dist", SourceKind::Archive)).with_payload(tarball);
    let id = job.id;
    run_registered(&coordinator, job).await;

    assert_eq!(
        coordinator.job(&id).await.unwrap().status,
        JobStatus::Success
    );
    assert_eq!(
        std::fs::read_to_string(config.output_root.join("static-dist/index.html")).unwrap(),
        "<p>root page</p>"
    );
    assert!(config
        .output_root
        .join("static-dist/dist/archive.html")
        .exists());

    let backlog = coordinator.bus().subscribe(id).await.unwrap().backlog;
    assert!(backlog
        .iter()
        .any(|e| e.message.contains("publishing files as-is")));
}

#[tokio::test]
async fn test_late_subscriber_sees_the_same_sequence() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let coordinator = coordinator_with(&config, StubFetcher::new());

    let job = Job::new(
        Project::new("replay-site", SourceKind::InlineMarkup).with_inline_content("<p>r</p>"),
    );
    let id = job.id;
    coordinator.bus().register(id).await;
    coordinator.store().insert(job).await.unwrap();
    let early = coordinator.bus().subscribe(id).await.unwrap();

    coordinator.run_to_completion(id).await;

    let mut early = early;
    let mut early_messages: Vec<String> =
        early.backlog.iter().map(|e| e.message.clone()).collect();
    while let Ok(event) = early.receiver.try_recv() {
        if let JobEvent::Log { message, .. } = event {
            early_messages.push(message);
        }
    }

    let late = coordinator.bus().subscribe(id).await.unwrap();
    let late_messages: Vec<String> = late.backlog.iter().map(|e| e.message.clone()).collect();

    assert!(!late_messages.is_empty());
    assert_eq!(early_messages, late_messages);
    assert_eq!(late.status, JobStatus::Success);
}

#[tokio::test]
async fn test_broken_build_manifest_fails_the_job() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let coordinator = coordinator_with(&config, StubFetcher::new());

    let tarball = gzipped_tarball(&[
        ("site/package.json", "{ this is not json"),
        ("site/index.html", "<p>x</p>"),
    ]);
    let job = Job::new(Project::new("broken-site", SourceKind::Archive)).with_payload(tarball);
    let id = job.id;
    run_registered(&coordinator, job).await;

    // npm rejects the manifest when installed; when npm is absent the spawn
    // itself fails. Either way the job must end Failed with the command named.
    let job = coordinator.job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.expect("error recorded").contains("npm"));
}
