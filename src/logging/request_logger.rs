use crate::config::LoggingConfig;
use chrono::{DateTime, Utc};
use http::header::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Serialize)]
pub struct RequestLog {
    pub timestamp: DateTime<Utc>,
    pub route: String,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResponseLog {
    pub timestamp: DateTime<Utc>,
    pub route: String,
    pub status_code: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamRequestLog {
    pub timestamp: DateTime<Utc>,
    pub route: String,
    pub backend: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamResponseLog {
    pub timestamp: DateTime<Utc>,
    pub route: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub classification: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured request/attempt logging with sensitive headers redacted.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    config: LoggingConfig,
}

impl RequestLogger {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn log_request(&self, route: &str, stream: bool, body: Option<&str>) {
        if !self.config.enabled {
            return;
        }

        let log = RequestLog {
            timestamp: Utc::now(),
            route: route.to_string(),
            stream,
            body: self.body(body),
        };

        tracing::info!(log = ?log, "Incoming request");
    }

    pub fn log_upstream_request(
        &self,
        route: &str,
        backend: &str,
        endpoint: &str,
        headers: &HeaderMap,
        body: Option<&str>,
    ) {
        if !self.config.enabled {
            return;
        }

        let log = UpstreamRequestLog {
            timestamp: Utc::now(),
            route: route.to_string(),
            backend: backend.to_string(),
            endpoint: endpoint.to_string(),
            headers: if self.config.include_headers {
                Some(Self::headers_to_map(headers))
            } else {
                None
            },
            body: self.body(body),
        };

        tracing::debug!(log = ?log, "Upstream request");
    }

    pub fn log_upstream_response(
        &self,
        route: &str,
        backend: &str,
        status_code: Option<u16>,
        classification: &str,
        latency: Duration,
        error: Option<&str>,
    ) {
        if !self.config.enabled {
            return;
        }

        let log = UpstreamResponseLog {
            timestamp: Utc::now(),
            route: route.to_string(),
            backend: backend.to_string(),
            status_code,
            classification: classification.to_string(),
            latency_ms: latency.as_millis() as u64,
            error: error.map(|s| s.to_string()),
        };

        if error.is_some() {
            tracing::warn!(log = ?log, "Upstream response");
        } else {
            tracing::debug!(log = ?log, "Upstream response");
        }
    }

    pub fn log_response(
        &self,
        route: &str,
        status_code: u16,
        duration: Duration,
        error: Option<&str>,
    ) {
        if !self.config.enabled {
            return;
        }

        let log = ResponseLog {
            timestamp: Utc::now(),
            route: route.to_string(),
            status_code,
            duration_ms: duration.as_millis() as u64,
            error: error.map(|s| s.to_string()),
        };

        if status_code >= 500 {
            tracing::error!(log = ?log, "Request completed");
        } else if status_code >= 400 {
            tracing::warn!(log = ?log, "Request completed");
        } else {
            tracing::info!(log = ?log, "Request completed");
        }
    }

    /// Whether callers should bother serializing bodies for this logger.
    pub fn wants_body(&self) -> bool {
        self.config.enabled && self.config.include_body
    }

    fn body(&self, body: Option<&str>) -> Option<String> {
        if self.config.include_body {
            body.map(|s| s.to_string())
        } else {
            None
        }
    }

    fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let key = name.to_string();

                let val = if value.is_sensitive() || Self::is_sensitive_header(&key) {
                    "[REDACTED]".to_string()
                } else {
                    value.to_str().unwrap_or("<invalid>").to_string()
                };

                (key, val)
            })
            .collect()
    }

    fn is_sensitive_header(name: &str) -> bool {
        let lower = name.to_lowercase();
        lower.contains("authorization")
            || lower.contains("api-key")
            || lower.contains("api_key")
            || lower.contains("apikey")
            || lower.contains("token")
            || lower.contains("password")
            || lower.contains("secret")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_is_sensitive_header() {
        assert!(RequestLogger::is_sensitive_header("Authorization"));
        assert!(RequestLogger::is_sensitive_header("X-Goog-Api-Key"));
        assert!(RequestLogger::is_sensitive_header("x-api-key"));
        assert!(RequestLogger::is_sensitive_header("Bearer-Token"));
        assert!(RequestLogger::is_sensitive_header("Secret-Key"));

        assert!(!RequestLogger::is_sensitive_header("Content-Type"));
        assert!(!RequestLogger::is_sensitive_header("Metadata-Flavor"));
    }

    #[test]
    fn test_headers_to_map_redacts_sensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer ya29.secret"));
        headers.insert("x-goog-api-key", HeaderValue::from_static("AIza-123"));

        let mut marked = HeaderValue::from_static("opaque");
        marked.set_sensitive(true);
        headers.insert("x-custom", marked);

        let map = RequestLogger::headers_to_map(&headers);

        assert_eq!(map.get("content-type").unwrap(), "application/json");
        assert_eq!(map.get("authorization").unwrap(), "[REDACTED]");
        assert_eq!(map.get("x-goog-api-key").unwrap(), "[REDACTED]");
        assert_eq!(map.get("x-custom").unwrap(), "[REDACTED]");
    }

    #[test]
    fn test_body_respects_config() {
        let logger = RequestLogger::new(LoggingConfig {
            include_body: false,
            ..LoggingConfig::default()
        });
        assert_eq!(logger.body(Some("{}")), None);

        let logger = RequestLogger::new(LoggingConfig {
            include_body: true,
            ..LoggingConfig::default()
        });
        assert_eq!(logger.body(Some("{}")).as_deref(), Some("{}"));
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = RequestLogger::new(LoggingConfig {
            enabled: false,
            ..LoggingConfig::default()
        });

        // Should not panic even when logging is disabled
        logger.log_request("gemini-1.5-pro", false, None);
        logger.log_response("gemini-1.5-pro", 200, Duration::from_millis(5), None);
    }
}
