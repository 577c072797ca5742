pub mod credential;
pub mod manager;
pub mod sources;

pub use credential::Credential;
pub use manager::CredentialManager;
pub use sources::build_source;

use crate::config::CredentialConfig;
use crate::types::AuthError;
use std::sync::Arc;
use std::time::Duration;

/// Builds a manager for the configured source, sharing `client` for token
/// endpoint calls.
pub fn credential_manager(
    config: &CredentialConfig,
    client: reqwest::Client,
) -> Result<Arc<CredentialManager>, AuthError> {
    let source = build_source(&config.source, client)?;
    Ok(Arc::new(CredentialManager::new(
        source,
        config.scopes.clone(),
        config.refresh_margin(),
    )))
}

/// Client used for OAuth2 token endpoints and the metadata server.
pub fn token_client() -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AuthError::InvalidConfig(format!("Failed to create token client: {}", e)))
}
