use super::classify::{classify_status, classify_transport_error};
use super::traits::BackendClient;
use crate::auth::Credential;
use crate::config::{BackendType, ModelConfig};
use crate::logging::RequestLogger;
use crate::streaming::parse_events;
use crate::types::gateway::Target;
use crate::types::{
    BackendOutcome, BackendRequest, BackendResponse, FailureDetail, FailureKind, GatewayError,
    Operation, ResponsePayload, Result,
};
use async_trait::async_trait;
use http::HeaderMap;
use reqwest::{Client, ClientBuilder};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Adapter for the Gemini API and Vertex AI `generateContent` family.
pub struct GoogleBackend {
    client: Client,
    timeout: Duration,
    logger: RequestLogger,
}

impl GoogleBackend {
    pub fn new(config: &ModelConfig, logger: RequestLogger) -> Result<Self> {
        // No client-wide timeout: it would also cap streamed bodies. Unary
        // calls get a per-request timeout instead.
        let mut builder = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if !config.ssl_verify {
            tracing::warn!(
                endpoint = ?config.endpoint,
                "SSL verification is disabled for this backend"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout: config.timeout_duration(),
            logger,
        })
    }

    async fn attempt(
        &self,
        request: &BackendRequest,
        credential: &Credential,
    ) -> (Option<u16>, BackendOutcome) {
        let target = &request.target;
        let url = endpoint_url(target, request.operation);

        let (name, value) = match credential.header() {
            Ok(header) => header,
            Err(e) => {
                return (
                    None,
                    BackendOutcome::FatalFailure(FailureDetail::new(
                        FailureKind::CredentialRejected,
                        e.to_string(),
                    )),
                )
            }
        };
        let mut headers = HeaderMap::new();
        headers.insert(name, value);

        let body = request.payload.to_string();
        self.logger.log_upstream_request(
            &target.route,
            target.backend.as_str(),
            &url,
            &headers,
            Some(&body),
        );

        let mut builder = self
            .client
            .post(&url)
            .headers(headers)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body);
        if request.operation == Operation::Generate {
            builder = builder.timeout(self.timeout);
        }

        // Streams are only bounded until the response headers arrive.
        let response = match tokio::time::timeout(self.timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return (None, classify_transport_error(&e)),
            Err(_) => {
                return (
                    None,
                    BackendOutcome::RetryableFailure(FailureDetail::new(
                        FailureKind::Timeout,
                        format!("no response within {}s", self.timeout.as_secs()),
                    )),
                )
            }
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return (Some(status), classify_status(status, &body));
        }

        let outcome = match request.operation {
            Operation::Generate => match response.bytes().await {
                Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(json) => BackendOutcome::Success(ResponsePayload::Json(json)),
                    Err(e) => BackendOutcome::FatalFailure(FailureDetail::new(
                        FailureKind::MalformedResponse,
                        e.to_string(),
                    )),
                },
                Err(e) => classify_transport_error(&e),
            },
            Operation::StreamGenerate => {
                BackendOutcome::Success(ResponsePayload::Stream(parse_events(response.bytes_stream())))
            }
        };

        (Some(status), outcome)
    }
}

#[async_trait]
impl BackendClient for GoogleBackend {
    async fn invoke(&self, request: &BackendRequest, credential: &Credential) -> BackendResponse {
        let started = Instant::now();
        let (status, outcome) = self.attempt(request, credential).await;
        let latency = started.elapsed();

        let (classification, error) = match &outcome {
            BackendOutcome::Success(_) => ("success", None),
            BackendOutcome::RetryableFailure(detail) => ("retryable_failure", Some(detail.to_string())),
            BackendOutcome::FatalFailure(detail) => ("fatal_failure", Some(detail.to_string())),
        };
        self.logger.log_upstream_response(
            &request.target.route,
            request.target.backend.as_str(),
            status,
            classification,
            latency,
            error.as_deref(),
        );

        BackendResponse::new(outcome, latency)
    }
}

pub fn endpoint_url(target: &Target, operation: Operation) -> String {
    let url = match target.backend {
        BackendType::Gemini => format!(
            "{}/models/{}:{}",
            target.endpoint,
            target.model,
            operation.method()
        ),
        BackendType::VertexAi => format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:{}",
            target.endpoint,
            target.project_id.as_deref().unwrap_or_default(),
            target.location,
            target.model,
            operation.method()
        ),
    };

    match operation {
        Operation::Generate => url,
        Operation::StreamGenerate => format!("{}?alt=sse", url),
    }
}
