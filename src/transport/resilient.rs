use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::{ApiRequest, ApiResponse, Transport};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::AppConfig;
use crate::errors::ServiceError;

/// Bounded exponential backoff for idempotent requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per transport, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_backoff: config.retry_backoff(),
            multiplier: config.retry_backoff_multiplier,
        }
    }

    /// No retries, no waiting. Handy in tests.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor)
    }
}

/// Primary transport behind a circuit breaker, plus an optional fallback
/// transport and legacy route tried with the same payload.
pub struct ResilientClient {
    primary: Arc<dyn Transport>,
    fallback: Option<Arc<dyn Transport>>,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(primary: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            primary,
            fallback: None,
            breaker: CircuitBreaker::new("primary-transport", CircuitBreakerConfig::default()),
            policy,
        }
    }

    pub fn from_config(primary: Arc<dyn Transport>, config: &AppConfig) -> Self {
        Self::new(primary, RetryPolicy::from_config(config)).with_breaker(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            timeout: config.circuit_breaker_timeout(),
            success_threshold: 1,
        })
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Transport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new("primary-transport", config);
        self
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Sends `request` on the primary transport, then on the fallback
    /// transport if one is configured.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ServiceError> {
        self.execute_with_fallback(request, None).await
    }

    /// Sends `primary` on the primary transport. When that fails with
    /// something another route could fix, sends `legacy` (or `primary` again
    /// if no legacy route exists) on the fallback transport. If both fail the
    /// more informative of the two errors is returned.
    #[instrument(skip(self, primary, legacy), fields(path = %primary.path))]
    pub async fn execute_with_fallback(
        &self,
        primary: &ApiRequest,
        legacy: Option<&ApiRequest>,
    ) -> Result<ApiResponse, ServiceError> {
        let first_err = match self
            .breaker
            .call(|| self.attempt_with_retry(self.primary.as_ref(), primary))
            .await
        {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        let fallback_transport = self.fallback.as_deref();
        if !should_fall_back(&first_err) || (fallback_transport.is_none() && legacy.is_none()) {
            return Err(first_err);
        }

        let transport = fallback_transport.unwrap_or(self.primary.as_ref());
        let request = legacy.unwrap_or(primary);
        warn!(
            error = %first_err,
            fallback_path = %request.path,
            "Primary route failed, trying fallback"
        );

        match self.attempt_with_retry(transport, request).await {
            Ok(response) => Ok(response),
            Err(second_err) => {
                debug!(primary = %first_err, fallback = %second_err, "Both routes failed");
                Err(most_informative(first_err, second_err))
            }
        }
    }

    async fn attempt_with_retry(
        &self,
        transport: &dyn Transport,
        request: &ApiRequest,
    ) -> Result<ApiResponse, ServiceError> {
        let max_attempts = if request.is_idempotent() {
            self.policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            match transport.execute(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let backoff = self.policy.backoff_for(attempt);
                    warn!(
                        "Request to {} failed: {} (attempt {}/{}), retrying in {:?}",
                        request.path, err, attempt, max_attempts, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Business rejections stand; broken routes and unhealthy servers do not.
fn should_fall_back(err: &ServiceError) -> bool {
    match err {
        ServiceError::ProviderError { status, .. } => {
            matches!(status, 404 | 405 | 501) || err.is_retryable()
        }
        ServiceError::TransportError { .. } | ServiceError::CircuitBreakerOpen => true,
        _ => false,
    }
}

fn most_informative(first: ServiceError, second: ServiceError) -> ServiceError {
    if second.informativeness() > first.informativeness() {
        second
    } else {
        first
    }
}
