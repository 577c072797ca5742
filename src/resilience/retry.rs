use super::backoff::next_delay;
use super::circuit_breaker::CircuitBreaker;
use crate::auth::{Credential, CredentialManager};
use crate::backends::BackendClient;
use crate::config::RetryConfig;
use crate::types::{
    AuthError, BackendOutcome, BackendRequest, FailureDetail, GatewayError, ResponsePayload,
    Result,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    Attempting,
    Retrying,
    Succeeded,
    FatalFailed,
    Exhausted,
}

impl RetryPhase {
    pub fn can_transition(&self, next: RetryPhase) -> bool {
        use RetryPhase::*;
        matches!(
            (self, next),
            (Idle, Attempting)
                | (Attempting, Attempting)
                | (Attempting, Succeeded)
                | (Attempting, FatalFailed)
                | (Attempting, Retrying)
                | (Attempting, Exhausted)
                | (Retrying, Attempting)
        )
    }
}

/// Bookkeeping for one logical call.
#[derive(Debug)]
pub struct RetryState {
    pub attempt: usize,
    pub started: Instant,
    pub last_error: Option<FailureDetail>,
    pub last_delay: Duration,
    pub phase: RetryPhase,
    pub credential_refreshed: bool,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            started: Instant::now(),
            last_error: None,
            last_delay: Duration::ZERO,
            phase: RetryPhase::Idle,
            credential_refreshed: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn transition(&mut self, next: RetryPhase) {
        debug_assert!(
            self.phase.can_transition(next),
            "invalid retry transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::trace!(from = ?self.phase, to = ?next, attempt = self.attempt, "Retry state transition");
        self.phase = next;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal result of a logical call. `attempts` is for logs and tests only;
/// it is never shown to callers.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded {
        payload: ResponsePayload,
        attempts: usize,
        latency: Duration,
    },
    FatalFailed {
        failure: FailureDetail,
        attempts: usize,
    },
    Exhausted {
        failure: FailureDetail,
        attempts: usize,
    },
}

impl ExecutionOutcome {
    pub fn attempts(&self) -> usize {
        match self {
            ExecutionOutcome::Succeeded { attempts, .. }
            | ExecutionOutcome::FatalFailed { attempts, .. }
            | ExecutionOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Retry, backoff and credential handling around a [`BackendClient`].
pub struct ResilientExecutor {
    backend: Arc<dyn BackendClient>,
    credentials: Arc<CredentialManager>,
    policy: RetryConfig,
    breaker: Option<CircuitBreaker>,
}

impl ResilientExecutor {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        credentials: Arc<CredentialManager>,
        policy: RetryConfig,
    ) -> Self {
        Self {
            backend,
            credentials,
            policy,
            breaker: None,
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn policy(&self) -> &RetryConfig {
        &self.policy
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub async fn execute(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let permit = match &self.breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    tracing::warn!(
                        route = %request.target.route,
                        state = ?breaker.state(),
                        "Circuit open, failing fast"
                    );
                    return Err(GatewayError::UpstreamUnavailable(format!(
                        "model '{}' is temporarily unavailable",
                        request.target.route
                    )));
                }
            },
            None => None,
        };

        let result = self.run(request, cancel).await;

        // An `Err` drops the permit without a verdict, as does dropping this future.
        if let Some(permit) = permit {
            match &result {
                Ok(ExecutionOutcome::Exhausted { .. }) => permit.fail(),
                // The backend answered, even if only to refuse the request.
                Ok(_) => permit.succeed(),
                Err(_) => {}
            }
        }

        result
    }

    async fn run(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let route = request.target.route.as_str();
        let mut state = RetryState::new();

        let mut credential = cancellable(cancel, self.credentials.get_token())
            .await?
            .map_err(GatewayError::from)?;

        state.attempt = 1;
        state.transition(RetryPhase::Attempting);

        loop {
            let response = cancellable(cancel, self.backend.invoke(request, &credential)).await?;
            tracing::debug!(
                route,
                attempt = state.attempt,
                status = ?response.status(),
                latency_ms = response.latency.as_millis() as u64,
                "Backend attempt finished"
            );

            let failure = match response.outcome {
                BackendOutcome::Success(payload) => {
                    state.transition(RetryPhase::Succeeded);
                    tracing::debug!(
                        route,
                        attempts = state.attempt,
                        elapsed_ms = state.elapsed().as_millis() as u64,
                        "Backend call succeeded"
                    );
                    return Ok(ExecutionOutcome::Succeeded {
                        payload,
                        attempts: state.attempt,
                        latency: response.latency,
                    });
                }
                BackendOutcome::FatalFailure(detail)
                    if detail.is_credential_rejected() && !state.credential_refreshed =>
                {
                    // Same attempt again with a new credential; budget untouched.
                    state.credential_refreshed = true;
                    state.last_error = Some(detail);
                    credential = self.refresh(cancel, &credential).await?;
                    state.transition(RetryPhase::Attempting);
                    continue;
                }
                BackendOutcome::FatalFailure(detail) => {
                    state.transition(RetryPhase::FatalFailed);
                    tracing::warn!(route, attempts = state.attempt, error = %detail, "Backend call failed");
                    return Ok(ExecutionOutcome::FatalFailed {
                        failure: detail,
                        attempts: state.attempt,
                    });
                }
                BackendOutcome::RetryableFailure(detail) => detail,
            };

            if state.attempt >= self.policy.max_attempts {
                state.transition(RetryPhase::Exhausted);
                tracing::warn!(
                    route,
                    attempts = state.attempt,
                    max_attempts = self.policy.max_attempts,
                    elapsed_ms = state.elapsed().as_millis() as u64,
                    error = %failure,
                    "Max retry attempts exceeded"
                );
                return Ok(ExecutionOutcome::Exhausted {
                    failure,
                    attempts: state.attempt,
                });
            }

            state.transition(RetryPhase::Retrying);
            let delay = next_delay(state.attempt, &self.policy, state.last_delay);
            tracing::info!(
                route,
                attempt = state.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Retrying request after error"
            );
            state.last_delay = delay;
            state.last_error = Some(failure);

            cancellable(cancel, sleep(delay)).await?;

            // The cached credential may have aged into its refresh margin while we slept.
            credential = cancellable(cancel, self.credentials.get_token())
                .await?
                .map_err(GatewayError::from)?;
            state.attempt += 1;
            state.transition(RetryPhase::Attempting);
        }
    }

    async fn refresh(
        &self,
        cancel: &CancellationToken,
        rejected: &Credential,
    ) -> Result<Arc<Credential>> {
        let refreshed: std::result::Result<Arc<Credential>, AuthError> =
            cancellable(cancel, self.credentials.force_refresh(rejected)).await?;
        Ok(refreshed?)
    }
}

/// Runs `future` unless `cancel` fires first; cancellation drops the future,
/// aborting whatever I/O or sleep it was waiting on.
async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        output = future => Ok(output),
    }
}
