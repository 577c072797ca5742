use crate::auth::{credential_manager, token_client, CredentialManager};
use crate::backends::{BackendClient, GoogleBackend};
use crate::config::{Config, ModelConfig};
use crate::logging::RequestLogger;
use crate::resilience::{CircuitBreaker, ResilientExecutor};
use crate::types::gateway::Target;
use crate::types::{GatewayError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A resolved model route: upstream target plus the executor that reaches it.
pub struct Route {
    pub name: String,
    pub config: ModelConfig,
    pub target: Arc<Target>,
    pub executor: Arc<ResilientExecutor>,
}

pub struct ModelRouter {
    routes: HashMap<String, Arc<Route>>,
    default_model: Option<String>,
}

impl ModelRouter {
    pub fn new(config: &Config, logger: RequestLogger) -> Result<Self> {
        Self::with_backends(config, |model_config| {
            let backend = GoogleBackend::new(model_config, logger.clone())?;
            Ok(Arc::new(backend) as Arc<dyn BackendClient>)
        })
    }

    /// Builds routes with a caller-supplied backend per model.
    pub fn with_backends<F>(config: &Config, mut make_backend: F) -> Result<Self>
    where
        F: FnMut(&ModelConfig) -> Result<Arc<dyn BackendClient>>,
    {
        let client = token_client()?;
        let shared = credential_manager(&config.credentials, client.clone())?;
        let mut routes = HashMap::new();

        for (model_name, model_config) in &config.models {
            let credentials: Arc<CredentialManager> = match &model_config.credentials {
                Some(own) => credential_manager(own, client.clone())?,
                None => shared.clone(),
            };

            let target = Arc::new(resolve_target(model_name, model_config));
            let mut executor = ResilientExecutor::new(
                make_backend(model_config)?,
                credentials.clone(),
                model_config.retry.clone(),
            );
            if let Some(breaker) = &model_config.circuit_breaker {
                executor = executor.with_circuit_breaker(CircuitBreaker::new(model_name, breaker));
            }

            tracing::info!(
                model = %model_name,
                target_model = %target.model,
                backend = target.backend.as_str(),
                endpoint = %target.endpoint,
                credentials = credentials.source_name(),
                max_attempts = executor.policy().max_attempts,
                circuit_breaker = executor.breaker().is_some(),
                ssl_verify = model_config.ssl_verify,
                "Registered model route"
            );

            routes.insert(
                model_name.clone(),
                Arc::new(Route {
                    name: model_name.clone(),
                    config: model_config.clone(),
                    target,
                    executor: Arc::new(executor),
                }),
            );
        }

        Ok(Self {
            routes,
            default_model: config.default_model.clone(),
        })
    }

    /// Looks up the route for `model`, falling back to the default route.
    pub fn resolve(&self, model: Option<&str>) -> Result<Arc<Route>> {
        let name = match model.map(str::trim).filter(|m| !m.is_empty()) {
            Some(name) => name,
            None => self.default_model.as_deref().ok_or_else(|| {
                GatewayError::InvalidRequest(
                    "model is required when no default model is configured".to_string(),
                )
            })?,
        };

        self.routes
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::ModelNotFound(name.to_string()))
    }

    pub fn list_models(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }
}

fn resolve_target(route: &str, config: &ModelConfig) -> Target {
    let requested = config.get_target_model(route);
    let model = config.resolved_target_model(route);
    if model != requested {
        tracing::warn!(
            route,
            deprecated = %requested,
            replacement = %model,
            "Deprecated model requested, switching target"
        );
    }

    let backend = config.resolved_backend(&model);
    let endpoint = config.resolved_endpoint(&backend);

    Target {
        route: route.to_string(),
        model,
        backend,
        endpoint,
        project_id: config.project_id.clone(),
        location: config.location.clone(),
    }
}
