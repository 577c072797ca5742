use super::AppState;
use crate::orchestrator::{ChunkStream, GatewayReply, GenerateRequest};
use crate::types::GatewayError;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{stream, Stream, StreamExt};
use std::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

pub async fn generate_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let err = GatewayError::InvalidRequest(rejection.body_text());
            state.logger.log_response(
                "unknown",
                err.status_code().as_u16(),
                started.elapsed(),
                Some(&err.to_string()),
            );
            return err.into_response();
        }
    };

    let route = request
        .model
        .clone()
        .or_else(|| state.orchestrator.router().default_model().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    let body = state
        .logger
        .wants_body()
        .then(|| serde_json::to_string(&request).ok())
        .flatten();
    state.logger.log_request(&route, request.stream, body.as_deref());

    // Dropping the handler future (client gone) cancels the in-flight call.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let result = state.orchestrator.handle(request, &cancel).await;

    let (response, error) = match result {
        Ok(GatewayReply::Complete(reply)) => {
            let _ = guard.disarm();
            (Json(reply).into_response(), None)
        }
        Ok(GatewayReply::Stream { chunks, .. }) => (sse_response(chunks, guard), None),
        Err(e) => {
            let _ = guard.disarm();
            let message = e.to_string();
            (e.into_response(), Some(message))
        }
    };

    state.logger.log_response(
        &route,
        response.status().as_u16(),
        started.elapsed(),
        error.as_deref(),
    );
    response
}

/// Streams chunks as SSE `data:` events followed by `[DONE]`. The guard lives
/// as long as the body, so a disconnect cancels the upstream stream.
fn sse_response(chunks: ChunkStream, guard: DropGuard) -> Response {
    let events = sse_events(chunks).map(move |event| {
        let _guard = &guard;
        event
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_events(
    chunks: ChunkStream,
) -> impl Stream<Item = std::result::Result<Event, axum::Error>> + Send {
    let body = chunks.map(|chunk| match chunk {
        Ok(chunk) => Event::default().json_data(&chunk),
        Err(e) => {
            tracing::warn!(error = %e, "Stream ended with error");
            Event::default().event("error").json_data(e.to_body())
        }
    });
    body.chain(stream::once(async { Ok(Event::default().data("[DONE]")) }))
}

pub async fn list_models_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut models = state.orchestrator.router().list_models();
    models.sort();
    Json(serde_json::json!({
        "models": models,
        "default_model": state.orchestrator.router().default_model(),
        "count": models.len()
    }))
}

pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
