//! Axum server for the Quay API
//!
//! Submissions come in as JSON and are answered immediately; the work
//! itself runs in the engine's background tasks. Published sites are
//! served as static files under `/sites`.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use quay_core::{
    JobEvent, JobId, JobStatus, LogLevel, Project, QuayConfig, QuayError, SourceKind,
};
use quay_engine::Coordinator;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{info, warn};

use crate::relay;
use crate::sse;

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

pub type SharedState = Arc<AppState>;

/// Submission body for a new deployment
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub name: String,
    pub source_kind: SourceKind,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub inline_content: Option<String>,
}

impl SubmitRequest {
    fn into_project(self) -> Project {
        let mut project = Project::new(self.name, self.source_kind);
        if let Some(source) = self.source {
            project = project.with_source(source);
        }
        if let Some(content) = self.inline_content {
            project = project.with_inline_content(content);
        }
        project
    }
}

/// Response for an accepted submission
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: JobId,
    pub status: JobStatus,
}

/// Deployment summary returned by the query endpoint
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error body for non-2xx responses
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Build the API router
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/deployments", post(submit_deployment))
        .route("/api/deployments/stream", post(submit_and_stream))
        .route("/api/deployments/:id", get(get_deployment))
        .route("/api/deployments/:id/events", get(sse::sse_handler))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Serve the API and published sites on `config.server.addr`
pub async fn serve(config: QuayConfig, coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        coordinator: coordinator.clone(),
    });

    tokio::fs::create_dir_all(&config.engine.output_root).await?;
    let app = router(state)
        .nest_service("/sites", ServeDir::new(&config.engine.output_root))
        .layer(CorsLayer::permissive());

    spawn_retention_sweep(coordinator, config.engine.retention_secs);

    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    info!(addr = %config.server.addr, "Quay listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically evict expired jobs, their event channels, and their
/// working directories
fn spawn_retention_sweep(coordinator: Arc<Coordinator>, retention_secs: u64) {
    let period = Duration::from_secs(retention_secs.clamp(30, 600));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = coordinator.evict_expired().await {
                warn!(error = %e, "Retention sweep failed");
            }
        }
    });
}

/// POST /api/deployments
async fn submit_deployment(
    State(app): State<SharedState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, Json<ErrorResponse>)> {
    match app.coordinator.submit(request.into_project()).await {
        Ok(id) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                id,
                status: JobStatus::Idle,
            }),
        )),
        Err(e) => Err(error_response(&e)),
    }
}

/// POST /api/deployments/stream
///
/// Accepts a submission and answers with the deployment's full event
/// stream, prefixed by this handler's own acceptance frame through the
/// merger.
async fn submit_and_stream(
    State(app): State<SharedState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let name = request.name.clone();
    let id = match app.coordinator.submit(request.into_project()).await {
        Ok(id) => id,
        Err(e) => return Err(error_response(&e)),
    };

    let upstream = Box::pin(
        sse::job_events(app.coordinator.clone(), id).map(|event| sse::frame(&event)),
    );
    let (handle, merged) = relay::merged(upstream);
    handle.inject(JobEvent::log(
        format!("Accepted deployment {} for project '{}'", id, name),
        LogLevel::Info,
    ));
    let stream = relay::keep_alive(merged, sse::KEEP_ALIVE_PERIOD);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream.map(Ok::<_, Infallible>)))
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })
}

/// GET /api/deployments/:id
async fn get_deployment(
    State(app): State<SharedState>,
    Path(id): Path<JobId>,
) -> Result<Json<DeploymentResponse>, (StatusCode, Json<ErrorResponse>)> {
    match app.coordinator.job(&id).await {
        Ok(job) => Ok(Json(DeploymentResponse {
            id: job.id,
            name: job.project.name,
            status: job.status,
            url: job.public_url,
            error: job.error,
        })),
        Err(e) => Err(error_response(&e)),
    }
}

/// GET /api/health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "quay"
    }))
}

pub(crate) fn error_response(error: &QuayError) -> (StatusCode, Json<ErrorResponse>) {
    (
        error_to_status(error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn error_to_status(error: &QuayError) -> StatusCode {
    match error {
        QuayError::InvalidProject(_) => StatusCode::UNPROCESSABLE_ENTITY,
        QuayError::UnsupportedHost(_) => StatusCode::UNPROCESSABLE_ENTITY,
        QuayError::JobNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use quay_core::EngineConfig;
    use quay_engine::{EventBus, LocalPublisher, MemoryJobStore, StubFetcher};
    use tower::ServiceExt;

    fn make_state(root: &std::path::Path) -> SharedState {
        let config = EngineConfig {
            work_root: root.join("work"),
            output_root: root.join("sites"),
            ..EngineConfig::default()
        };
        let coordinator = Arc::new(Coordinator::new(
            &config,
            Arc::new(MemoryJobStore::new()),
            Arc::new(EventBus::new()),
            Arc::new(StubFetcher::new()),
            Arc::new(LocalPublisher::new(
                config.output_root.clone(),
                "http://localhost:8370/sites",
            )),
        ));
        Arc::new(AppState { coordinator })
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_is_accepted_with_id_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_state(dir.path()));

        let response = app
            .oneshot(json_request(
                "/api/deployments",
                serde_json::json!({
                    "name": "my-site",
                    "source_kind": "inline-markup",
                    "inline_content": "<h1>hi</h1>"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["status"], "idle");
        assert!(parsed["id"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_state(dir.path()));

        let response = app
            .oneshot(json_request(
                "/api/deployments",
                serde_json::json!({
                    "name": "Bad Name",
                    "source_kind": "inline-markup",
                    "inline_content": "<h1>hi</h1>"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_unknown_deployment_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(&format!("/api/deployments/{}", JobId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_finished_deployment_reports_url() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_state(dir.path());

        let coordinator = state.coordinator.clone();
        let job = quay_core::Job::new(
            Project::new("done-site", SourceKind::InlineMarkup).with_inline_content("<p>x</p>"),
        );
        let id = job.id;
        coordinator.bus().register(id).await;
        coordinator.store().insert(job).await.unwrap();
        coordinator.run_to_completion(id).await;

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(&format!("/api/deployments/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["status"], "success");
        assert_eq!(parsed["name"], "done-site");
        assert_eq!(parsed["url"], "http://localhost:8370/sites/done-site/");
        assert!(parsed.get("error").is_none());
    }

    #[tokio::test]
    async fn test_stream_endpoint_frames_the_whole_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_state(dir.path()));

        let response = app
            .oneshot(json_request(
                "/api/deployments/stream",
                serde_json::json!({
                    "name": "streamed-site",
                    "source_kind": "inline-markup",
                    "inline_content": "<h1>live</h1>"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        // the body ends when the job reaches its terminal status
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.starts_with("data: {\"type\":\"log\",\"message\":\"Accepted deployment"));
        assert!(text.contains("\"status\":\"success\""));
        assert!(text.contains("Deployment complete:"));
        assert!(text.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn test_events_endpoint_replays_finished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_state(dir.path());

        let coordinator = state.coordinator.clone();
        let job = quay_core::Job::new(
            Project::new("evented-site", SourceKind::InlineMarkup)
                .with_inline_content("<p>x</p>"),
        );
        let id = job.id;
        coordinator.bus().register(id).await;
        coordinator.store().insert(job).await.unwrap();
        coordinator.run_to_completion(id).await;

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(&format!("/api/deployments/{}/events", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Deployment complete:"));
        assert!(text.contains("\"status\":\"success\""));
    }

    #[tokio::test]
    async fn test_events_for_unknown_job_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(&format!("/api/deployments/{}/events", JobId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
