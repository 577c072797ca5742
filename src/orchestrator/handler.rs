use super::router::{ModelRouter, Route};
use crate::config::GenerationConfig;
use crate::resilience::ExecutionOutcome;
use crate::streaming::CancellableStream;
use crate::types::{
    BackendRequest, EventStream, FailureDetail, FailureKind, GatewayError, Operation,
    ResponsePayload, Result,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Normalized generation request accepted by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(alias = "request")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

impl GenerateRequest {
    #[cfg(test)]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("prompt is required".to_string()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(GatewayError::InvalidRequest(
                    "temperature must be between 0 and 2".to_string(),
                ));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(GatewayError::InvalidRequest(
                    "top_p must be between 0 and 1".to_string(),
                ));
            }
        }
        if self.max_output_tokens == Some(0) {
            return Err(GatewayError::InvalidRequest(
                "max_output_tokens must be greater than 0".to_string(),
            ));
        }
        if self.top_k == Some(0) {
            return Err(GatewayError::InvalidRequest(
                "top_k must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// `generateContent` body with route defaults filled in.
    pub fn to_payload(&self, defaults: &GenerationConfig) -> Value {
        let mut payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": self.prompt }]
            }],
            "generationConfig": {
                "temperature": self.temperature.unwrap_or(defaults.temperature),
                "maxOutputTokens": self.max_output_tokens.unwrap_or(defaults.max_output_tokens),
                "topP": self.top_p.unwrap_or(defaults.top_p),
                "topK": self.top_k.unwrap_or(defaults.top_k),
            }
        });

        if let Some(system) = self.system_instruction.as_deref().filter(|s| !s.trim().is_empty()) {
            payload["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteReply {
    pub model: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// One piece of a streamed reply, in backend emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub index: usize,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<OutputChunk>> + Send>>;

pub enum GatewayReply {
    Complete(CompleteReply),
    Stream { model: String, chunks: ChunkStream },
}

impl std::fmt::Debug for GatewayReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayReply::Complete(reply) => f.debug_tuple("Complete").field(reply).finish(),
            GatewayReply::Stream { model, .. } => f
                .debug_struct("Stream")
                .field("model", model)
                .finish_non_exhaustive(),
        }
    }
}

/// Entry point for the front-end: routes, executes and shapes one request.
pub struct RequestOrchestrator {
    router: Arc<ModelRouter>,
}

impl RequestOrchestrator {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub async fn handle(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayReply> {
        request.validate()?;
        let route = self.router.resolve(request.model.as_deref())?;

        let operation = if request.stream {
            Operation::StreamGenerate
        } else {
            Operation::Generate
        };
        let backend_request = BackendRequest::new(
            operation,
            request.to_payload(&route.config.generation),
            route.target.clone(),
        );

        let outcome = route.executor.execute(&backend_request, cancel).await?;
        tracing::debug!(route = %route.name, attempts = outcome.attempts(), "Route call finished");
        let payload = into_payload(&route, outcome)?;
        let model = route.target.model.clone();

        match payload {
            ResponsePayload::Json(body) => Ok(GatewayReply::Complete(complete_reply(model, &body))),
            ResponsePayload::Stream(events) => Ok(GatewayReply::Stream {
                model,
                chunks: chunk_stream(events, cancel.clone()),
            }),
        }
    }
}

fn into_payload(route: &Route, outcome: ExecutionOutcome) -> Result<ResponsePayload> {
    match outcome {
        ExecutionOutcome::Succeeded { payload, .. } => Ok(payload),
        ExecutionOutcome::FatalFailed { failure, .. } => Err(fatal_error(failure)),
        ExecutionOutcome::Exhausted { failure, .. } => {
            tracing::debug!(route = %route.name, error = %failure, "Giving up on route");
            Err(GatewayError::UpstreamUnavailable(format!(
                "model '{}' is temporarily unavailable, try again later",
                route.name
            )))
        }
    }
}

fn fatal_error(failure: FailureDetail) -> GatewayError {
    match failure.kind {
        FailureKind::Status(status) if (400..500).contains(&status) => {
            GatewayError::UpstreamRejected {
                status,
                message: failure.message,
            }
        }
        FailureKind::Status(status) => {
            GatewayError::UpstreamFault(format!("upstream returned status {}", status))
        }
        FailureKind::CredentialRejected => {
            GatewayError::UpstreamFault("upstream rejected the gateway credentials".to_string())
        }
        FailureKind::MalformedResponse => {
            GatewayError::UpstreamFault("upstream returned an unreadable response".to_string())
        }
        FailureKind::Timeout | FailureKind::Transport => {
            GatewayError::UpstreamUnavailable("upstream could not be reached".to_string())
        }
    }
}

fn first_candidate(body: &Value) -> Option<&Value> {
    body.get("candidates")?.as_array()?.first()
}

fn candidate_text(candidate: &Value) -> String {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn finish_reason(body: &Value) -> Option<String> {
    match first_candidate(body) {
        Some(candidate) => candidate.get("finishReason").and_then(Value::as_str),
        // A blocked prompt has no candidates, only feedback.
        None => body.pointer("/promptFeedback/blockReason").and_then(Value::as_str),
    }
    .map(str::to_string)
}

fn usage(body: &Value) -> Option<Usage> {
    let metadata: &Map<String, Value> = body.get("usageMetadata")?.as_object()?;
    let count = |key: &str| metadata.get(key).and_then(Value::as_u64).unwrap_or(0);
    let prompt_tokens = count("promptTokenCount");
    let completion_tokens = count("candidatesTokenCount");
    let total_tokens = match metadata.get("totalTokenCount").and_then(Value::as_u64) {
        Some(total) => total,
        None => prompt_tokens + completion_tokens,
    };
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn complete_reply(model: String, body: &Value) -> CompleteReply {
    CompleteReply {
        model,
        text: first_candidate(body).map(candidate_text).unwrap_or_default(),
        finish_reason: finish_reason(body),
        usage: usage(body),
    }
}

fn chunk_stream(events: EventStream, cancel: CancellationToken) -> ChunkStream {
    let chunks = events
        .filter_map(|event| async move {
            match event {
                Ok(body) => {
                    let text = first_candidate(&body).map(candidate_text).unwrap_or_default();
                    let finish_reason = finish_reason(&body);
                    // Trailing usage-only events carry nothing to forward.
                    if text.is_empty() && finish_reason.is_none() {
                        None
                    } else {
                        Some(Ok((text, finish_reason)))
                    }
                }
                Err(e) => Some(Err(e)),
            }
        })
        .enumerate()
        .map(|(index, item)| {
            item.map(|(text, finish_reason)| OutputChunk {
                index,
                text,
                finish_reason,
            })
        });

    Box::pin(CancellableStream::new(chunks, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::router::tests::create_test_config;
    use crate::resilience::retry::tests::{Scripted, ScriptedBackend};
    use crate::types::ErrorClass;
    use futures::stream;

    fn orchestrator(script: Vec<Scripted>) -> (RequestOrchestrator, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new(script));
        let shared = backend.clone();
        let mut config = create_test_config();
        for route in config.models.values_mut() {
            route.retry.backoff_ms = 1;
            route.retry.max_backoff_ms = 4;
        }
        let router = ModelRouter::with_backends(&config, |_| {
            Ok(shared.clone() as Arc<dyn crate::backends::BackendClient>)
        })
        .unwrap();
        (RequestOrchestrator::new(Arc::new(router)), backend)
    }

    fn gemini_body(text: &str) -> Value {
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 4,
                "candidatesTokenCount": 6,
                "totalTokenCount": 10
            }
        })
    }

    #[test]
    fn test_payload_uses_route_defaults() {
        let request = GenerateRequest::new("Plan a day in Kyoto");
        let payload = request.to_payload(&GenerationConfig::default());

        assert_eq!(payload["contents"][0]["role"], "user");
        assert_eq!(payload["contents"][0]["parts"][0]["text"], "Plan a day in Kyoto");
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(payload["generationConfig"]["topK"], 40);
        assert!(payload.get("systemInstruction").is_none());
    }

    #[test]
    fn test_payload_overrides_and_system_instruction() {
        let request = GenerateRequest {
            temperature: Some(0.9),
            max_output_tokens: Some(64),
            system_instruction: Some("Answer briefly.".to_string()),
            ..GenerateRequest::new("hi")
        };
        let payload = request.to_payload(&GenerationConfig::default());

        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 64);
        assert!((payload["generationConfig"]["temperature"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "Answer briefly.");
    }

    #[test]
    fn test_request_accepts_legacy_field_name() {
        let request: GenerateRequest =
            serde_json::from_value(json!({"request": "3 days in Lisbon"})).unwrap();
        assert_eq!(request.prompt, "3 days in Lisbon");
        assert!(!request.stream);
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert!(GenerateRequest::new("   ").validate().is_err());
        let request = GenerateRequest {
            temperature: Some(3.0),
            ..GenerateRequest::new("hi")
        };
        assert!(request.validate().is_err());
        let request = GenerateRequest {
            top_p: Some(1.5),
            ..GenerateRequest::new("hi")
        };
        assert!(request.validate().is_err());
        assert!(GenerateRequest::new("hi").validate().is_ok());
    }

    #[test]
    fn test_complete_reply_extraction() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [{"text": "Hello, "}, {"text": "world"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
        });
        let reply = complete_reply("gemini-1.5-pro".to_string(), &body);

        assert_eq!(reply.text, "Hello, world");
        assert_eq!(reply.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(
            reply.usage,
            Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5
            })
        );
    }

    #[test]
    fn test_blocked_prompt_reports_block_reason() {
        let body = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let reply = complete_reply("gemini-1.5-pro".to_string(), &body);
        assert_eq!(reply.text, "");
        assert_eq!(reply.finish_reason.as_deref(), Some("SAFETY"));
        assert!(reply.usage.is_none());
    }

    #[tokio::test]
    async fn test_handle_complete() {
        let (orchestrator, backend) = orchestrator(vec![Scripted::Ok(gemini_body("Bonjour"))]);

        let reply = orchestrator
            .handle(GenerateRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap();

        match reply {
            GatewayReply::Complete(reply) => {
                assert_eq!(reply.model, "gemini-1.5-pro");
                assert_eq!(reply.text, "Bonjour");
                assert_eq!(reply.usage.map(|u| u.total_tokens), Some(10));
            }
            other => panic!("Expected complete reply, got {:?}", other),
        }
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_uses_target_model_alias() {
        let (orchestrator, _) = orchestrator(vec![Scripted::Ok(gemini_body("ok"))]);
        let request = GenerateRequest {
            model: Some("fast".to_string()),
            ..GenerateRequest::new("hi")
        };

        match orchestrator.handle(request, &CancellationToken::new()).await.unwrap() {
            GatewayReply::Complete(reply) => assert_eq!(reply.model, "gemini-1.5-flash"),
            other => panic!("Expected complete reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_request_is_client_error_without_retry() {
        let (orchestrator, backend) = orchestrator(vec![Scripted::Status(400)]);

        let err = orchestrator
            .handle(GenerateRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamRejected { status: 400, .. }));
        assert_eq!(err.class(), ErrorClass::ClientError);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_upstream_unavailable_without_attempt_count() {
        let (orchestrator, backend) = orchestrator(vec![Scripted::Status(503)]);

        let err = orchestrator
            .handle(GenerateRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::UpstreamUnavailable);
        assert!(!err.public_message().contains("attempt"));
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_repeated_credential_rejection_is_internal() {
        let (orchestrator, _) = orchestrator(vec![Scripted::Status(401)]);

        let err = orchestrator
            .handle(GenerateRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamFault(_)));
        assert_eq!(err.class(), ErrorClass::Internal);
        assert!(!err.public_message().contains("test-key"));
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_backend() {
        let (orchestrator, backend) = orchestrator(vec![Scripted::Ok(gemini_body("x"))]);

        let err = orchestrator
            .handle(GenerateRequest::new(""), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_chunk_stream_preserves_order_and_skips_empty_events() {
        let items: Vec<Result<Value>> = vec![
            Ok(json!({"candidates": [{"content": {"parts": [{"text": "one "}]}}]})),
            Ok(json!({"candidates": [{"content": {"parts": [{"text": "two "}]}}]})),
            Ok(json!({"usageMetadata": {"totalTokenCount": 9}})),
            Ok(json!({"candidates": [{"content": {"parts": [{"text": "three"}]}, "finishReason": "STOP"}]})),
        ];
        let events: EventStream = Box::pin(stream::iter(items));

        let chunks: Vec<OutputChunk> = chunk_stream(events, CancellationToken::new())
            .map(|c| c.unwrap())
            .collect()
            .await;

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["one ", "two ", "three"]);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(chunks[2].finish_reason.as_deref(), Some("STOP"));
    }

    #[tokio::test]
    async fn test_chunk_stream_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let first: Result<Value> = Ok(json!({"candidates": [{"content": {"parts": [{"text": "x"}]}}]}));
        let events: EventStream = Box::pin(stream::iter(vec![first]).chain(stream::pending()));

        let mut chunks = chunk_stream(events, cancel.clone());
        assert!(matches!(chunks.next().await, Some(Ok(_))));
        cancel.cancel();

        assert!(chunks.next().await.is_none());
    }
}
