use super::models::{
    Config, CredentialConfig, CredentialSource, GenerationConfig, ModelConfig,
    ServerConfig, DEFAULT_LOCATION, DEFAULT_MODEL,
};
use crate::types::GatewayError;
use crate::types::Result;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

// Matches ${VAR_NAME} or ${VAR_NAME:-default}
static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .expect("environment variable pattern is valid")
});

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path.as_ref())
        .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

    let expanded = expand_env_vars(&content);

    // Try YAML first, then JSON
    let mut config: Config =
        if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&expanded)
                .map_err(|e| GatewayError::Config(format!("Failed to parse JSON config: {}", e)))?
        } else {
            serde_yaml::from_str(&expanded)
                .map_err(|e| GatewayError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    config
        .validate()
        .map_err(|e| GatewayError::Config(format!("Invalid configuration: {}", e)))?;

    Ok(config)
}

/// Builds a single-route configuration from the process environment, for
/// deployments that ship without a config file.
pub fn config_from_env() -> Result<Config> {
    config_from_lookup(|key| std::env::var(key).ok())
}

fn config_from_lookup<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = lookup("GOOGLE_API_KEY")
        .or_else(|| lookup("GEMINI_API_KEY"))
        .filter(|key| !key.is_empty());

    let source = match api_key {
        Some(api_key) => CredentialSource::ApiKey { api_key },
        None => CredentialSource::ApplicationDefault,
    };

    let model_name = lookup("MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let mut generation = GenerationConfig::default();
    if let Some(temperature) = lookup("TEMPERATURE") {
        generation.temperature = temperature
            .parse()
            .map_err(|_| GatewayError::Config(format!("Invalid TEMPERATURE '{}'", temperature)))?;
    }
    if let Some(max_tokens) = lookup("MAX_OUTPUT_TOKENS") {
        generation.max_output_tokens = max_tokens.parse().map_err(|_| {
            GatewayError::Config(format!("Invalid MAX_OUTPUT_TOKENS '{}'", max_tokens))
        })?;
    }

    // Backend is inferred per route after deprecated models are rewritten.
    let model = ModelConfig {
        project_id: lookup("PROJECT_ID"),
        location: lookup("LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        timeout_seconds: 60,
        ssl_verify: true,
        generation,
        ..Default::default()
    };

    let mut models = HashMap::new();
    models.insert(model_name.clone(), model);

    let mut config = Config {
        server: ServerConfig::default(),
        logging: Default::default(),
        credentials: CredentialConfig::new(source),
        default_model: Some(model_name),
        models,
    };

    apply_env_overrides(&mut config, &lookup)?;

    config
        .validate()
        .map_err(|e| GatewayError::Config(format!("Invalid configuration: {}", e)))?;

    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT") {
        config.server.port = port
            .parse()
            .map_err(|_| GatewayError::Config(format!("Invalid PORT '{}'", port)))?;
    }
    Ok(())
}

fn expand_env_vars(content: &str) -> String {
    ENV_VAR
        .replace_all(content, |cap: &Captures| {
            let var_name = &cap[1];
            let default_value = cap.get(3).map(|m| m.as_str());

            std::env::var(var_name)
                .ok()
                .or_else(|| default_value.map(|s| s.to_string()))
                .unwrap_or_else(|| {
                    tracing::warn!(
                        "Environment variable '{}' not found and no default provided",
                        var_name
                    );
                    String::new()
                })
        })
        .into_owned()
}
