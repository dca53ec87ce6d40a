//! Rate-limited, retrying front door to the reasoning backend.

use super::{ReasoningBackend, ReasoningError, ReasoningOutput, ReasoningRequest};
use crate::config::schema::ReasoningConfig;
use crate::ratelimit::RateLimiter;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ReasoningConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_with_jitter(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff(retry) + jitter
    }

    /// Run `op` until it succeeds or attempts run out. The last error is
    /// returned.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_with_jitter(attempt);
                    warn!(
                        "{} attempt {}/{} failed ({:#}), retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

pub struct ReasoningGateway {
    backend: Arc<dyn ReasoningBackend>,
    limiter: RateLimiter,
    policy: RetryPolicy,
    terminal_message: String,
}

impl ReasoningGateway {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        limiter: RateLimiter,
        policy: RetryPolicy,
        terminal_message: &str,
    ) -> Self {
        Self {
            backend,
            limiter,
            policy,
            terminal_message: terminal_message.to_string(),
        }
    }

    pub fn from_config(backend: Arc<dyn ReasoningBackend>, config: &ReasoningConfig) -> Self {
        Self::new(
            backend,
            RateLimiter::per_minute(config.calls_per_minute),
            RetryPolicy::from_config(config),
            &config.terminal_message,
        )
    }

    /// Invoke the backend. Every attempt waits for the rate limiter.
    ///
    /// Terminal failures become the fixed user-facing message. Transient
    /// failures are retried until attempts run out, then returned.
    pub async fn invoke(
        &self,
        request: &ReasoningRequest,
    ) -> Result<ReasoningOutput, ReasoningError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            match self.backend.invoke(request).await {
                Ok(output) => return Ok(output),
                Err(ReasoningError::TransientUpstream(msg)) => {
                    if attempt >= self.policy.max_attempts {
                        warn!("Reasoning gave up after {} attempts: {}", attempt, msg);
                        return Err(ReasoningError::TransientUpstream(msg));
                    }
                    let delay = self.policy.delay_with_jitter(attempt);
                    warn!(
                        "Reasoning attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, self.policy.max_attempts, msg, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ReasoningError::TerminalUpstream(msg)) => {
                    warn!("Reasoning backend refused service: {}", msg);
                    return Ok(ReasoningOutput::notice(self.terminal_message.clone()));
                }
                Err(ReasoningError::Unclassified(e)) => {
                    error!("Unclassified reasoning failure: {:?}", e);
                    return Err(ReasoningError::Unclassified(e));
                }
            }
        }
    }
}
