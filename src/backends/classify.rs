use crate::types::{BackendOutcome, FailureDetail, FailureKind};
use serde_json::Value;

const MAX_MESSAGE_LEN: usize = 300;

pub fn is_retryable_status(status: u16) -> bool {
    matches!(
        status,
        408 | // Request Timeout
        429 | // Too Many Requests / RESOURCE_EXHAUSTED
        500 | // Internal Server Error
        502 | // Bad Gateway
        503 | // Service Unavailable
        504   // Gateway Timeout
    )
}

/// Classifies a non-success HTTP status.
pub fn classify_status(status: u16, body: &str) -> BackendOutcome {
    let message = extract_error_message(body);

    if status == 401 {
        BackendOutcome::FatalFailure(FailureDetail::new(FailureKind::CredentialRejected, message))
    } else if is_retryable_status(status) {
        BackendOutcome::RetryableFailure(FailureDetail::new(FailureKind::Status(status), message))
    } else {
        BackendOutcome::FatalFailure(FailureDetail::new(FailureKind::Status(status), message))
    }
}

pub fn classify_transport_error(error: &reqwest::Error) -> BackendOutcome {
    if error.is_timeout() {
        BackendOutcome::RetryableFailure(FailureDetail::new(FailureKind::Timeout, error.to_string()))
    } else if error.is_connect() || error.is_request() || error.is_body() {
        BackendOutcome::RetryableFailure(FailureDetail::new(
            FailureKind::Transport,
            error.to_string(),
        ))
    } else {
        BackendOutcome::FatalFailure(FailureDetail::new(FailureKind::Transport, error.to_string()))
    }
}

/// Pulls `error.message` out of a Google API error body, falling back to the
/// (truncated) raw body.
pub fn extract_error_message(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());

    if message.chars().count() > MAX_MESSAGE_LEN {
        let truncated: String = message.chars().take(MAX_MESSAGE_LEN).collect();
        format!("{}...", truncated)
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::gateway::BackendStatus;
    use crate::types::BackendResponse;
    use std::time::Duration;

    fn status_of(outcome: BackendOutcome) -> BackendStatus {
        BackendResponse::new(outcome, Duration::ZERO).status()
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{} should be retryable", status);
            assert_eq!(status_of(classify_status(status, "")), BackendStatus::RetryableFailure);
        }
    }

    #[test]
    fn test_fatal_statuses() {
        for status in [400, 403, 404, 413] {
            assert!(!is_retryable_status(status));
            assert_eq!(status_of(classify_status(status, "")), BackendStatus::FatalFailure);
        }
    }

    #[test]
    fn test_unauthorized_is_credential_rejection() {
        match classify_status(401, r#"{"error":{"code":401,"message":"Request had invalid authentication credentials."}}"#) {
            BackendOutcome::FatalFailure(detail) => {
                assert!(detail.is_credential_rejected());
                assert_eq!(detail.message, "Request had invalid authentication credentials.");
            }
            other => panic!("Expected FatalFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_error_message_fallback() {
        assert_eq!(extract_error_message("  upstream exploded "), "upstream exploded");

        let long = "x".repeat(1000);
        let message = extract_error_message(&long);
        assert!(message.ends_with("..."));
        assert_eq!(message.len(), MAX_MESSAGE_LEN + 3);
    }
}
