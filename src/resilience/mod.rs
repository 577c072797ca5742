//! Resilience layer.
//!
//! ```text
//! ResilientExecutor::execute
//!     → circuit_breaker.rs (fail fast while open)
//!     → CredentialManager::get_token
//!     → BackendClient::invoke (one attempt, classified)
//!     → retry.rs (retry / refresh credential / give up)
//!     → backoff.rs (jittered, non-decreasing delay)
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::CircuitBreaker;
pub use retry::{ExecutionOutcome, ResilientExecutor};
