use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_LOCATION: &str = "us-central1";
pub const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub credentials: CredentialConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a finished background job stays pollable.
    #[serde(default = "default_job_ttl")]
    pub job_ttl_seconds: u64,
}

impl ServerConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_seconds)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            job_ttl_seconds: default_job_ttl(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_job_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub include_headers: bool,
    #[serde(default)]
    pub include_body: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_headers: true,
            include_body: false,
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where credentials come from and how early they are refreshed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialConfig {
    #[serde(flatten)]
    pub source: CredentialSource,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: u64,
}

impl CredentialConfig {
    pub fn new(source: CredentialSource) -> Self {
        Self {
            source,
            scopes: default_scopes(),
            refresh_margin_seconds: default_refresh_margin(),
        }
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CredentialSource {
    ApiKey {
        api_key: String,
    },
    ServiceAccount {
        key_file: String,
    },
    AuthorizedUser {
        key_file: String,
    },
    Metadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    ApplicationDefault,
    StaticToken {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lifetime_seconds: Option<u64>,
    },
}

impl CredentialSource {
    pub fn name(&self) -> &'static str {
        match self {
            CredentialSource::ApiKey { .. } => "api_key",
            CredentialSource::ServiceAccount { .. } => "service_account",
            CredentialSource::AuthorizedUser { .. } => "authorized_user",
            CredentialSource::Metadata { .. } => "metadata",
            CredentialSource::ApplicationDefault => "application_default",
            CredentialSource::StaticToken { .. } => "static_token",
        }
    }
}

fn default_scopes() -> Vec<String> {
    vec![CLOUD_PLATFORM_SCOPE.to_string()]
}

fn default_refresh_margin() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_type: Option<BackendType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    /// Overrides the top-level credentials for this route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialConfig>,
}

fn default_timeout() -> u64 {
    60
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}

impl ModelConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Upstream model name for a route, falling back to the route name itself.
    pub fn get_target_model<'a>(&'a self, incoming: &'a str) -> &'a str {
        self.target_model.as_deref().unwrap_or(incoming)
    }

    /// Upstream model actually called, with deprecated PaLM text models
    /// replaced by [`DEFAULT_MODEL`].
    pub fn resolved_target_model(&self, route: &str) -> String {
        let target = self.get_target_model(route);
        if is_deprecated_model(target) {
            DEFAULT_MODEL.to_string()
        } else {
            target.to_string()
        }
    }

    pub fn resolved_backend(&self, target_model: &str) -> BackendType {
        self.backend_type
            .clone()
            .unwrap_or_else(|| BackendType::infer(target_model))
    }

    pub fn resolved_endpoint(&self, backend: &BackendType) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => match backend {
                BackendType::Gemini => GEMINI_API_BASE_URL.to_string(),
                BackendType::VertexAi => {
                    format!("https://{}-aiplatform.googleapis.com/v1", self.location)
                }
            },
        }
    }
}

pub fn is_deprecated_model(model: &str) -> bool {
    model.contains("text-bison")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    Gemini,
    VertexAi,
}

impl BackendType {
    /// Legacy Vertex model ids look like `text-bison@002`; everything else is
    /// served by the Gemini API.
    pub fn infer(model: &str) -> Self {
        if model.starts_with("text-") || model.contains('@') {
            BackendType::VertexAi
        } else {
            BackendType::Gemini
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Gemini => "gemini",
            BackendType::VertexAi => "vertex_ai",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            top_p: default_top_p(),
            top_k: default_top_k(),
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_output_tokens() -> u32 {
    1024
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> u32 {
    40
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.models.is_empty() {
            return Err("At least one model must be configured".to_string());
        }

        if let Some(default_model) = &self.default_model {
            if !self.models.contains_key(default_model) {
                return Err(format!(
                    "Default model '{}' is not a configured model",
                    default_model
                ));
            }
        }

        validate_credentials("credentials", &self.credentials)?;

        for (model_name, model_config) in &self.models {
            if matches!(&model_config.endpoint, Some(e) if e.is_empty()) {
                return Err(format!("Model '{}' has empty endpoint", model_name));
            }

            if model_config.timeout_seconds == 0 {
                return Err(format!(
                    "Model '{}' has invalid timeout (must be > 0)",
                    model_name
                ));
            }

            if model_config.retry.max_attempts == 0 {
                return Err(format!(
                    "Model '{}' has invalid retry max_attempts (must be > 0)",
                    model_name
                ));
            }

            if model_config.retry.backoff_ms > model_config.retry.max_backoff_ms {
                return Err(format!(
                    "Model '{}' has backoff_ms greater than max_backoff_ms",
                    model_name
                ));
            }

            if let Some(breaker) = &model_config.circuit_breaker {
                if breaker.failure_threshold == 0 {
                    return Err(format!(
                        "Model '{}' has invalid circuit_breaker failure_threshold (must be > 0)",
                        model_name
                    ));
                }
            }

            let target = model_config.resolved_target_model(model_name);
            if model_config.resolved_backend(&target) == BackendType::VertexAi {
                if model_config.project_id.as_deref().map_or(true, str::is_empty) {
                    return Err(format!(
                        "Model '{}' targets Vertex AI but has no project_id",
                        model_name
                    ));
                }

                let credentials = model_config.credentials.as_ref().unwrap_or(&self.credentials);
                if matches!(credentials.source, CredentialSource::ApiKey { .. }) {
                    return Err(format!(
                        "Model '{}' targets Vertex AI, which does not accept api_key credentials",
                        model_name
                    ));
                }
            }

            if let Some(credentials) = &model_config.credentials {
                validate_credentials(&format!("model '{}' credentials", model_name), credentials)?;
            }
        }

        Ok(())
    }
}

fn validate_credentials(context: &str, config: &CredentialConfig) -> Result<(), String> {
    match &config.source {
        CredentialSource::ApiKey { api_key } if api_key.is_empty() => {
            Err(format!("{} has an empty api_key", context))
        }
        CredentialSource::ServiceAccount { key_file }
        | CredentialSource::AuthorizedUser { key_file }
            if key_file.is_empty() =>
        {
            Err(format!("{} has an empty key_file", context))
        }
        CredentialSource::StaticToken { token, .. } if token.is_empty() => {
            Err(format!("{} has an empty token", context))
        }
        _ => Ok(()),
    }
}
