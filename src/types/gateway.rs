use crate::config::BackendType;
use crate::types::GatewayError;
use futures::Stream;
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Lazy, ordered sequence of JSON events emitted by a streaming backend call.
/// Finite and consumed exactly once.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Value, GatewayError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Generate,
    StreamGenerate,
}

impl Operation {
    pub fn method(&self) -> &'static str {
        match self {
            Operation::Generate => "generateContent",
            Operation::StreamGenerate => "streamGenerateContent",
        }
    }
}

/// Where a request goes once routing has been resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Route name the caller asked for.
    pub route: String,
    /// Model identifier sent upstream.
    pub model: String,
    pub backend: BackendType,
    pub endpoint: String,
    pub project_id: Option<String>,
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub operation: Operation,
    pub payload: Value,
    pub target: Arc<Target>,
}

impl BackendRequest {
    pub fn new(operation: Operation, payload: Value, target: Arc<Target>) -> Self {
        Self {
            operation,
            payload,
            target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Status(u16),
    Timeout,
    Transport,
    MalformedResponse,
    CredentialRejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_credential_rejected(&self) -> bool {
        self.kind == FailureKind::CredentialRejected
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Status(code) => write!(f, "HTTP {}: {}", code, self.message),
            FailureKind::Timeout => write!(f, "timeout: {}", self.message),
            FailureKind::Transport => write!(f, "transport: {}", self.message),
            FailureKind::MalformedResponse => write!(f, "malformed response: {}", self.message),
            FailureKind::CredentialRejected => write!(f, "credential rejected: {}", self.message),
        }
    }
}

pub enum ResponsePayload {
    Json(Value),
    Stream(EventStream),
}

impl fmt::Debug for ResponsePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponsePayload::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ResponsePayload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Success,
    RetryableFailure,
    FatalFailure,
}

#[derive(Debug)]
pub enum BackendOutcome {
    Success(ResponsePayload),
    RetryableFailure(FailureDetail),
    FatalFailure(FailureDetail),
}

/// Result of exactly one backend attempt.
#[derive(Debug)]
pub struct BackendResponse {
    pub outcome: BackendOutcome,
    pub latency: Duration,
}

impl BackendResponse {
    pub fn new(outcome: BackendOutcome, latency: Duration) -> Self {
        Self { outcome, latency }
    }

    pub fn status(&self) -> BackendStatus {
        match self.outcome {
            BackendOutcome::Success(_) => BackendStatus::Success,
            BackendOutcome::RetryableFailure(_) => BackendStatus::RetryableFailure,
            BackendOutcome::FatalFailure(_) => BackendStatus::FatalFailure,
        }
    }
}
