use super::credential::Credential;
use super::sources::TokenSource;
use crate::types::AuthError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Owns the cached credential for one credential source.
///
/// Readers take the fast path through `cached`. A refresh is serialised on
/// `refresh`, whose guarded value remembers the last failure so callers that
/// queued behind a failed refresh get its error instead of starting another.
pub struct CredentialManager {
    source: Arc<dyn TokenSource>,
    scopes: Vec<String>,
    margin: Duration,
    cached: RwLock<Option<Arc<Credential>>>,
    refresh: Mutex<Option<AuthError>>,
    generation: AtomicU64,
}

impl CredentialManager {
    pub fn new(source: Arc<dyn TokenSource>, scopes: Vec<String>, margin: Duration) -> Self {
        Self {
            source,
            scopes,
            margin,
            cached: RwLock::new(None),
            refresh: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Returns a credential that stays valid for at least the safety margin,
    /// refreshing first if needed.
    pub async fn get_token(&self) -> Result<Arc<Credential>, AuthError> {
        if let Some(credential) = self.fresh_cached().await {
            return Ok(credential);
        }

        let observed = self.generation.load(Ordering::Acquire);
        let mut last_failure = self.refresh.lock().await;

        if self.generation.load(Ordering::Acquire) != observed {
            // A refresh completed while we were queued; share its result.
            if let Some(err) = last_failure.as_ref() {
                return Err(err.clone());
            }
        }
        if let Some(credential) = self.fresh_cached().await {
            return Ok(credential);
        }

        self.refresh_locked(&mut last_failure).await
    }

    /// Replaces a credential the backend refused. If someone already swapped
    /// out `rejected`, the newer credential is returned without a fetch; if a
    /// refresh failed while we queued, its error is returned instead.
    pub async fn force_refresh(&self, rejected: &Credential) -> Result<Arc<Credential>, AuthError> {
        let observed = self.generation.load(Ordering::Acquire);
        let mut last_failure = self.refresh.lock().await;

        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(err) = last_failure.as_ref() {
                return Err(err.clone());
            }
        }

        if let Some(current) = self.cached.read().await.as_ref() {
            if current.token() != rejected.token() && current.is_fresh(self.margin) {
                return Ok(current.clone());
            }
        }

        tracing::info!(source = self.source.name(), "Credential rejected upstream, forcing refresh");
        self.refresh_locked(&mut last_failure).await
    }

    async fn fresh_cached(&self) -> Option<Arc<Credential>> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|credential| credential.is_fresh(self.margin))
            .cloned()
    }

    async fn refresh_locked(
        &self,
        last_failure: &mut Option<AuthError>,
    ) -> Result<Arc<Credential>, AuthError> {
        let result = self.source.fetch(&self.scopes).await;
        self.generation.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(credential) => {
                let credential = Arc::new(credential);
                tracing::debug!(
                    source = self.source.name(),
                    kind = ?credential.kind(),
                    scopes = ?credential.scopes(),
                    expires_at = ?credential.expires_at(),
                    "Credential refreshed"
                );
                *self.cached.write().await = Some(credential.clone());
                *last_failure = None;
                Ok(credential)
            }
            Err(err) => {
                tracing::error!(source = self.source.name(), error = %err, "Credential refresh failed");
                *last_failure = Some(err.clone());
                Err(err)
            }
        }
    }
}
