use super::AppState;
use crate::orchestrator::{GatewayReply, GenerateRequest, RequestOrchestrator};
use crate::types::{ErrorClass, GatewayError, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed { model: String, result: String },
    Error { class: ErrorClass, message: String },
}

#[derive(Debug)]
struct JobEntry {
    status: JobStatus,
    finished_at: Option<Instant>,
}

/// Background generations keyed by job id. Finished jobs stay pollable for
/// `ttl`, then are dropped.
#[derive(Debug)]
pub struct JobStore {
    jobs: DashMap<Uuid, JobEntry>,
    ttl: Duration,
}

impl JobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            ttl,
        }
    }

    pub fn create(&self) -> Uuid {
        self.purge_expired();

        let id = Uuid::new_v4();
        self.jobs.insert(
            id,
            JobEntry {
                status: JobStatus::Processing,
                finished_at: None,
            },
        );
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<JobStatus> {
        self.jobs
            .get(id)
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| entry.status.clone())
    }

    pub fn finish(&self, id: Uuid, status: JobStatus) {
        self.jobs.insert(
            id,
            JobEntry {
                status,
                finished_at: Some(Instant::now()),
            },
        );
    }

    fn is_expired(&self, entry: &JobEntry) -> bool {
        entry
            .finished_at
            .is_some_and(|finished| finished.elapsed() >= self.ttl)
    }

    fn purge_expired(&self) {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| !self.is_expired(entry));
        let purged = before.saturating_sub(self.jobs.len());
        if purged > 0 {
            tracing::debug!(purged, remaining = self.jobs.len(), "Dropped expired jobs");
        }
    }
}

/// Runs one job to completion and records the outcome.
async fn run_job(
    orchestrator: Arc<RequestOrchestrator>,
    jobs: Arc<JobStore>,
    id: Uuid,
    request: GenerateRequest,
) {
    // Jobs outlive the submitting connection, so nothing cancels them.
    let cancel = CancellationToken::new();

    let status = match orchestrator.handle(request, &cancel).await {
        Ok(GatewayReply::Complete(reply)) => JobStatus::Completed {
            model: reply.model,
            result: reply.text,
        },
        Ok(GatewayReply::Stream { model, mut chunks }) => {
            let mut result = String::new();
            let mut failure = None;
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => result.push_str(&chunk.text),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => error_status(&e),
                None => JobStatus::Completed { model, result },
            }
        }
        Err(e) => error_status(&e),
    };

    match &status {
        JobStatus::Error { message, .. } => {
            tracing::warn!(job_id = %id, error = %message, "Job failed")
        }
        _ => tracing::info!(job_id = %id, "Job completed"),
    }
    jobs.finish(id, status);
}

fn error_status(error: &GatewayError) -> JobStatus {
    JobStatus::Error {
        class: error.class(),
        message: error.public_message(),
    }
}

pub async fn submit_job_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(mut request) =
        payload.map_err(|rejection| GatewayError::InvalidRequest(rejection.body_text()))?;
    request.stream = false;
    request.validate()?;
    // Unknown models are reported now rather than through the job status.
    state.orchestrator.router().resolve(request.model.as_deref())?;

    let id = state.jobs.create();
    tracing::info!(job_id = %id, model = ?request.model, "Job submitted");

    tokio::spawn(run_job(
        state.orchestrator.clone(),
        state.jobs.clone(),
        id,
        request,
    ));

    Ok(Json(json!({ "status": "processing", "id": id })))
}

pub async fn job_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>> {
    Uuid::parse_str(&id)
        .ok()
        .and_then(|uuid| state.jobs.get(&uuid))
        .map(Json)
        .ok_or(GatewayError::JobNotFound(id))
}
