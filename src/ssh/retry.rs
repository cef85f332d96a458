//! Connection retry logic
//!
//! Bounded retry with exponential backoff for establishing a connection.
//! Worst case for a target that keeps failing with network errors:
//! `(max_retries + 1) * dial_timeout + sum(backoff(0..max_retries))`,
//! see [`RetryPolicy::worst_case`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::SshError;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for each retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.max(1.0).powi(attempt as i32))
        .min(self.max_backoff_ms as f64);

        Duration::from_millis(delay_ms as u64)
    }

    /// Upper bound on the time spent establishing one connection
    pub fn worst_case(&self, dial_timeout: Duration) -> Duration {
        let backoff: Duration = (0..self.max_retries).map(|a| self.backoff(a)).sum();
        dial_timeout * (self.max_retries + 1) + backoff
    }
}

/// Run `attempt_fn` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent.
///
/// Returns the value plus the number of attempts it took. Non-retryable
/// errors (configuration, host identity, authentication) are returned as-is
/// on first sight; an exhausted budget yields one
/// [`SshError::RetriesExhausted`] carrying the last cause.
pub async fn retry_connect<T, F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    mut attempt_fn: F,
) -> Result<(T, u32), SshError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SshError>>,
{
    let total = policy.max_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match attempt_fn().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("Connected to {} on attempt {}/{}", target, attempt, total);
                }
                return Ok((value, attempt));
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= total => {
                warn!("Giving up on {} after {} attempts: {}", target, attempt, e);
                return Err(SshError::RetriesExhausted {
                    target: target.to_string(),
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = policy.backoff(attempt - 1);
                warn!(
                    "Connection attempt {}/{} to {} failed: {}. Retrying in {:?}",
                    attempt, total, target, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
