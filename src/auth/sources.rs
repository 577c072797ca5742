//! Credential sources.
//!
//! Each source knows how to obtain one fresh [`Credential`]. Caching and
//! refresh scheduling live in [`super::CredentialManager`]; sources are
//! stateless apart from the key material they were built from.

use super::credential::Credential;
use crate::config::CredentialSource;
use crate::types::AuthError;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const METADATA_ENDPOINT: &str = "http://metadata.google.internal";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, scopes: &[String]) -> Result<Credential, AuthError>;

    fn name(&self) -> &str;
}

/// Builds the source described by configuration. Key files are read eagerly so
/// a bad path fails at startup rather than on the first request.
pub fn build_source(
    source: &CredentialSource,
    client: Client,
) -> Result<Arc<dyn TokenSource>, AuthError> {
    let built: Arc<dyn TokenSource> = match source {
        CredentialSource::ApiKey { api_key } => Arc::new(ApiKeySource::new(api_key.clone())),
        CredentialSource::StaticToken {
            token,
            lifetime_seconds,
        } => Arc::new(StaticTokenSource::new(
            token.clone(),
            lifetime_seconds.map(Duration::from_secs),
        )),
        CredentialSource::ServiceAccount { key_file } => match KeyFile::load(key_file)? {
            KeyFile::ServiceAccount(key) => Arc::new(ServiceAccountSource::new(key, client)),
            KeyFile::AuthorizedUser(_) => {
                return Err(AuthError::InvalidConfig(format!(
                    "{} holds authorized_user credentials, not a service account key",
                    key_file
                )))
            }
        },
        CredentialSource::AuthorizedUser { key_file } => match KeyFile::load(key_file)? {
            KeyFile::AuthorizedUser(key) => Arc::new(AuthorizedUserSource::new(key, client)),
            KeyFile::ServiceAccount(_) => {
                return Err(AuthError::InvalidConfig(format!(
                    "{} holds a service account key, not authorized_user credentials",
                    key_file
                )))
            }
        },
        CredentialSource::Metadata { endpoint } => Arc::new(MetadataSource::new(
            endpoint.clone().unwrap_or_else(|| METADATA_ENDPOINT.to_string()),
            client,
        )),
        CredentialSource::ApplicationDefault => application_default(client)?,
    };

    tracing::info!(source = built.name(), "Credential source configured");
    Ok(built)
}

/// `GOOGLE_APPLICATION_CREDENTIALS`, then the gcloud well-known file, then the
/// metadata server.
fn application_default(client: Client) -> Result<Arc<dyn TokenSource>, AuthError> {
    let explicit = std::env::var("GOOGLE_APPLICATION_CREDENTIALS")
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);
    let well_known = well_known_file().filter(|p| p.exists());

    match explicit.or(well_known) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Using application default credentials file");
            Ok(match KeyFile::load(&path)? {
                KeyFile::ServiceAccount(key) => Arc::new(ServiceAccountSource::new(key, client)),
                KeyFile::AuthorizedUser(key) => Arc::new(AuthorizedUserSource::new(key, client)),
            })
        }
        None => {
            tracing::debug!("No credentials file found, falling back to the metadata server");
            Ok(Arc::new(MetadataSource::new(
                METADATA_ENDPOINT.to_string(),
                client,
            )))
        }
    }
}

fn well_known_file() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(
        Path::new(&home)
            .join(".config")
            .join("gcloud")
            .join("application_default_credentials.json"),
    )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUserKey),
}

impl KeyFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AuthError::KeyFile(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, AuthError> {
        serde_json::from_str(content).map_err(|e| AuthError::KeyFile(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedUserKey {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Sends a token request and turns the OAuth2 response into a credential.
async fn exchange(request: RequestBuilder, scopes: &[String]) -> Result<Credential, AuthError> {
    let response = request
        .send()
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;

    if !status.is_success() {
        return Err(AuthError::Rejected {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        });
    }

    let token: TokenResponse =
        serde_json::from_str(&body).map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
    if token.access_token.is_empty() {
        return Err(AuthError::MalformedResponse("empty access_token".to_string()));
    }

    let expires_at = token
        .expires_in
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

    Ok(Credential::bearer(token.access_token, expires_at, scopes.to_vec()))
}

pub struct ApiKeySource {
    key: String,
}

impl ApiKeySource {
    pub fn new(key: String) -> Self {
        Self { key }
    }
}

#[async_trait]
impl TokenSource for ApiKeySource {
    async fn fetch(&self, _scopes: &[String]) -> Result<Credential, AuthError> {
        Ok(Credential::api_key(self.key.clone()))
    }

    fn name(&self) -> &str {
        "api_key"
    }
}

pub struct StaticTokenSource {
    token: String,
    lifetime: Option<Duration>,
}

impl StaticTokenSource {
    pub fn new(token: String, lifetime: Option<Duration>) -> Self {
        Self { token, lifetime }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self, scopes: &[String]) -> Result<Credential, AuthError> {
        let expires_at = self
            .lifetime
            .and_then(|lifetime| chrono::Duration::from_std(lifetime).ok())
            .map(|lifetime| Utc::now() + lifetime);
        Ok(Credential::bearer(self.token.clone(), expires_at, scopes.to_vec()))
    }

    fn name(&self) -> &str {
        "static_token"
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

pub struct ServiceAccountSource {
    key: ServiceAccountKey,
    client: Client,
}

impl ServiceAccountSource {
    pub fn new(key: ServiceAccountKey, client: Client) -> Self {
        Self { key, client }
    }

    fn assertion(&self, scopes: &[String]) -> Result<String, AuthError> {
        let iat = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: scopes.join(" "),
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();

        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        jsonwebtoken::encode(&header, &claims, &key).map_err(|e| AuthError::Signing(e.to_string()))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountSource {
    async fn fetch(&self, scopes: &[String]) -> Result<Credential, AuthError> {
        let assertion = self.assertion(scopes)?;
        tracing::debug!(
            client_email = %self.key.client_email,
            token_uri = %self.key.token_uri,
            "Exchanging service account assertion"
        );

        let request = self.client.post(&self.key.token_uri).form(&[
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
        ]);
        exchange(request, scopes).await
    }

    fn name(&self) -> &str {
        "service_account"
    }
}

pub struct AuthorizedUserSource {
    key: AuthorizedUserKey,
    client: Client,
}

impl AuthorizedUserSource {
    pub fn new(key: AuthorizedUserKey, client: Client) -> Self {
        Self { key, client }
    }
}

#[async_trait]
impl TokenSource for AuthorizedUserSource {
    async fn fetch(&self, scopes: &[String]) -> Result<Credential, AuthError> {
        let request = self.client.post(&self.key.token_uri).form(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.key.client_id.as_str()),
            ("client_secret", self.key.client_secret.as_str()),
            ("refresh_token", self.key.refresh_token.as_str()),
        ]);
        exchange(request, scopes).await
    }

    fn name(&self) -> &str {
        "authorized_user"
    }
}

pub struct MetadataSource {
    endpoint: String,
    client: Client,
}

impl MetadataSource {
    pub fn new(endpoint: String, client: Client) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl TokenSource for MetadataSource {
    async fn fetch(&self, scopes: &[String]) -> Result<Credential, AuthError> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/token",
            self.endpoint
        );
        let mut request = self.client.get(url).header("Metadata-Flavor", "Google");
        if !scopes.is_empty() {
            request = request.query(&[("scopes", scopes.join(","))]);
        }
        exchange(request, scopes).await
    }

    fn name(&self) -> &str {
        "metadata"
    }
}
