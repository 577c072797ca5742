pub mod generate;
pub mod jobs;

use crate::logging::RequestLogger;
use crate::orchestrator::RequestOrchestrator;
use axum::{
    routing::{get, post},
    Router,
};
use jobs::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub jobs: Arc<JobStore>,
    pub logger: RequestLogger,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<RequestOrchestrator>,
        logger: RequestLogger,
        job_ttl: Duration,
    ) -> Self {
        Self {
            orchestrator,
            jobs: Arc::new(JobStore::new(job_ttl)),
            logger,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(generate::health_check))
        .route("/models", get(generate::list_models_handler))
        .route("/v1/generate", post(generate::generate_handler))
        .route("/v1/jobs", post(jobs::submit_job_handler))
        .route("/v1/jobs/:id", get(jobs::job_status_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, CredentialConfig, CredentialSource, LoggingConfig, ModelConfig, RetryConfig,
        ServerConfig, DEFAULT_LOCATION,
    };
    use crate::orchestrator::ModelRouter;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use mockito::Matcher;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tower::ServiceExt;

    const GENERATE_PATH: &str = "/models/gemini-1.5-pro:generateContent";
    const STREAM_PATH: &str = "/models/gemini-1.5-pro:streamGenerateContent";

    fn app(endpoint: &str) -> Router {
        app_with_job_ttl(endpoint, Duration::from_secs(60))
    }

    fn app_with_job_ttl(endpoint: &str, job_ttl: Duration) -> Router {
        let mut models = HashMap::new();
        models.insert(
            "gemini-1.5-pro".to_string(),
            ModelConfig {
                endpoint: Some(endpoint.to_string()),
                location: DEFAULT_LOCATION.to_string(),
                timeout_seconds: 5,
                ssl_verify: true,
                retry: RetryConfig {
                    max_attempts: 3,
                    backoff_ms: 1,
                    max_backoff_ms: 5,
                },
                ..Default::default()
            },
        );
        let config = Config {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            credentials: CredentialConfig::new(CredentialSource::ApiKey {
                api_key: "AIza-test".to_string(),
            }),
            default_model: Some("gemini-1.5-pro".to_string()),
            models,
        };

        let logger = RequestLogger::new(config.logging.clone());
        let router = ModelRouter::new(&config, logger.clone()).unwrap();
        let orchestrator = Arc::new(RequestOrchestrator::new(Arc::new(router)));
        build_router(AppState::new(orchestrator, logger, job_ttl))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn candidate(text: &str) -> String {
        json!({
            "candidates": [{"content": {"parts": [{"text": text}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 3, "totalTokenCount": 5}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app("http://127.0.0.1:9").oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_models() {
        let response = app("http://127.0.0.1:9").oneshot(get("/models")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["models"], json!(["gemini-1.5-pro"]));
        assert_eq!(body["default_model"], "gemini-1.5-pro");
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn test_generate_complete() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", GENERATE_PATH)
            .match_header("x-goog-api-key", "AIza-test")
            .match_body(Matcher::PartialJson(json!({
                "contents": [{"role": "user", "parts": [{"text": "Plan a weekend in Porto"}]}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(candidate("Day 1: Ribeira"))
            .expect(1)
            .create_async()
            .await;

        let response = app(&server.url())
            .oneshot(post_json(
                "/v1/generate",
                json!({"prompt": "Plan a weekend in Porto"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["text"], "Day 1: Ribeira");
        assert_eq!(body["model"], "gemini-1.5-pro");
        assert_eq!(body["finish_reason"], "STOP");
        assert_eq!(body["usage"]["total_tokens"], 5);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upstream_bad_request_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", GENERATE_PATH)
            .with_status(400)
            .with_body(r#"{"error":{"code":400,"message":"Invalid argument: topK"}}"#)
            .expect(1)
            .create_async()
            .await;

        let response = app(&server.url())
            .oneshot(post_json("/v1/generate", json!({"prompt": "hi"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["class"], "client_error");
        assert_eq!(body["error"]["type"], "upstream_rejected");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", GENERATE_PATH)
            .with_status(429)
            .with_body(r#"{"error":{"code":429,"message":"Resource has been exhausted"}}"#)
            .expect(3)
            .create_async()
            .await;

        let response = app(&server.url())
            .oneshot(post_json("/v1/generate", json!({"prompt": "hi"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["class"], "upstream_unavailable");
        assert_eq!(body["error"]["code"], 503);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_stream() {
        let mut server = mockito::Server::new_async().await;
        let events = [
            r#"data: {"candidates":[{"content":{"parts":[{"text":"Hello"}]}}]}"#,
            r#"data: {"candidates":[{"content":{"parts":[{"text":" there"}]},"finishReason":"STOP"}]}"#,
        ]
        .join("\n\n")
            + "\n\n";
        let _mock = server
            .mock("POST", STREAM_PATH)
            .match_query(Matcher::UrlEncoded("alt".into(), "sse".into()))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(events)
            .create_async()
            .await;

        let response = app(&server.url())
            .oneshot(post_json(
                "/v1/generate",
                json!({"prompt": "hi", "stream": true}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let hello = text.find(r#""text":"Hello""#).unwrap();
        let there = text.find(r#""text":" there""#).unwrap();
        assert!(hello < there);
        assert!(text.contains(r#""index":1"#));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let response = app("http://127.0.0.1:9")
            .oneshot(post_json(
                "/v1/generate",
                json!({"prompt": "hi", "model": "gpt-4"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "model_not_found");
    }

    #[tokio::test]
    async fn test_malformed_request_body() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app("http://127.0.0.1:9").oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["class"], "client_error");
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", GENERATE_PATH)
            .with_status(200)
            .with_body(candidate("Itinerary ready"))
            .create_async()
            .await;
        let app = app(&server.url());

        let response = app
            .clone()
            .oneshot(post_json("/v1/jobs", json!({"request": "3 days in Rome"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "processing");
        let id = body["id"].as_str().unwrap().to_string();

        let mut status = Value::Null;
        for _ in 0..100 {
            let response = app
                .clone()
                .oneshot(get(&format!("/v1/jobs/{}", id)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            status = body_json(response).await;
            if status["status"] != "processing" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(status["status"], "completed");
        assert_eq!(status["result"], "Itinerary ready");
    }

    #[tokio::test]
    async fn test_expired_job_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", GENERATE_PATH)
            .with_status(200)
            .with_body(candidate("Itinerary ready"))
            .expect(1)
            .create_async()
            .await;
        let app = app_with_job_ttl(&server.url(), Duration::ZERO);

        let response = app
            .clone()
            .oneshot(post_json("/v1/jobs", json!({"request": "3 days in Rome"})))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let mut status = StatusCode::OK;
        for _ in 0..100 {
            let response = app
                .clone()
                .oneshot(get(&format!("/v1/jobs/{}", id)))
                .await
                .unwrap();
            status = response.status();
            if status != StatusCode::OK {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(status, StatusCode::NOT_FOUND);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_job_submission_rejects_empty_request() {
        let response = app("http://127.0.0.1:9")
            .oneshot(post_json("/v1/jobs", json!({"request": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let response = app("http://127.0.0.1:9")
            .oneshot(get("/v1/jobs/not-a-job"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "job_not_found");
    }
}
