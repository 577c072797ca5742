use crate::auth::Credential;
use crate::types::{BackendRequest, BackendResponse};
use async_trait::async_trait;

/// One attempt against a generative backend. Implementations classify the
/// outcome and never retry.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn invoke(&self, request: &BackendRequest, credential: &Credential) -> BackendResponse;
}
