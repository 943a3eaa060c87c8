//! Live deployment event streaming
//!
//! Every event is one SSE data block, `data: {json}\n\n`, where the JSON
//! is a tagged `JobEvent`. A viewer attaching mid-job first receives the
//! full log history, then the current status, then live events; the
//! stream ends once a terminal status has been sent.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use quay_core::{JobEvent, JobId};
use quay_engine::Coordinator;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use crate::server::{error_response, ErrorResponse, SharedState};

/// Cadence of keep-alive comment frames on both stream endpoints
pub(crate) const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(15);

/// One wire frame for `event`
pub fn frame(event: &JobEvent) -> Bytes {
    match serde_json::to_string(event) {
        Ok(json) => Bytes::from(format!("data: {}\n\n", json)),
        Err(_) => Bytes::new(),
    }
}

/// Replay-then-live event sequence for one job. Ends after the terminal
/// status; a job unknown to the bus yields an empty stream.
pub fn job_events(coordinator: Arc<Coordinator>, id: JobId) -> impl Stream<Item = JobEvent> {
    async_stream::stream! {
        let Some(subscription) = coordinator.bus().subscribe(id).await else {
            return;
        };

        for entry in &subscription.backlog {
            yield JobEvent::from(entry);
        }
        let status = subscription.status;
        yield JobEvent::status(status);
        if status.is_terminal() {
            return;
        }

        let mut receiver = subscription.receiver;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let last = matches!(
                        &event,
                        JobEvent::Status { status } if status.is_terminal()
                    );
                    yield event;
                    if last {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(job_id = %id, skipped, "viewer lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// GET /api/deployments/:id/events
pub async fn sse_handler(
    State(app): State<SharedState>,
    Path(id): Path<JobId>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ErrorResponse>)>
{
    if let Err(e) = app.coordinator.job(&id).await {
        return Err(error_response(&e));
    }

    let stream = job_events(app.coordinator.clone(), id).filter_map(|event| async move {
        serde_json::to_string(&event)
            .ok()
            .map(|json| Ok(Event::default().data(json)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_PERIOD).text("ping")))
}
