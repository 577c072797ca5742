use crate::types::AuthError;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use std::fmt;
use std::time::Duration;

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// OAuth2 access token sent as `Authorization: Bearer`.
    Bearer,
    /// Google API key sent as `x-goog-api-key`.
    ApiKey,
}

/// A time-bounded authorization token. Never mutated; a refresh produces a new
/// value.
#[derive(Clone, PartialEq)]
pub struct Credential {
    token: String,
    kind: CredentialKind,
    expires_at: Option<DateTime<Utc>>,
    scopes: Vec<String>,
}

impl Credential {
    pub fn bearer(
        token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            token: token.into(),
            kind: CredentialKind::Bearer,
            expires_at,
            scopes,
        }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            token: key.into(),
            kind: CredentialKind::ApiKey,
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// True when the credential is still usable `margin` from `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => {
                let margin = chrono::Duration::from_std(margin)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                now + margin < expires_at
            }
        }
    }

    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.is_fresh_at(Utc::now(), margin)
    }

    /// Header carrying this credential on an outbound call.
    pub fn header(&self) -> Result<(HeaderName, HeaderValue), AuthError> {
        let (name, raw) = match self.kind {
            CredentialKind::Bearer => (AUTHORIZATION, format!("Bearer {}", self.token)),
            CredentialKind::ApiKey => (HeaderName::from_static(API_KEY_HEADER), self.token.clone()),
        };
        let mut value = HeaderValue::from_str(&raw)
            .map_err(|_| AuthError::InvalidConfig("credential contains invalid characters".into()))?;
        value.set_sensitive(true);
        Ok((name, value))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("kind", &self.kind)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}
