//! Retry decisions for remote calls.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::config::RetryConfig;
use crate::error::CallError;
use crate::taxonomy::{ErrorTaxonomy, classify};

/// Whether a call reads or writes server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A cached read.
    Read,
    /// A mutation. Never retried.
    Write,
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and surface the error.
    Stop,
    /// Try again after the delay.
    RetryAfter(Duration),
}

/// Decides whether a failed call is tried again.
///
/// Only reads are retried, and only for transient transport kinds. Auth and
/// validation failures stop immediately since repeating them cannot succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from its configuration.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decides what to do after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn should_retry(&self, kind: RequestKind, attempt: u32, error: &CallError) -> RetryDecision {
        if kind == RequestKind::Write || attempt == 0 || attempt > self.config.max_retries {
            return RetryDecision::Stop;
        }
        let Some(remote) = error.remote() else {
            return RetryDecision::Stop;
        };
        let taxonomy = classify(error);
        if taxonomy.is_auth() || taxonomy == ErrorTaxonomy::ValidationWithMessage {
            return RetryDecision::Stop;
        }
        if !remote.kind.is_transient() {
            return RetryDecision::Stop;
        }
        RetryDecision::RetryAfter(self.backoff(attempt))
    }

    /// Delay before the retry following the `attempt`-th failure.
    ///
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.config
            .base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }

    /// Runs `call` until it succeeds or the policy says stop.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn run<T, F, Fut>(&self, kind: RequestKind, mut call: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) => match self.should_retry(kind, attempt, &error) {
                    RetryDecision::Stop => return Err(error),
                    RetryDecision::RetryAfter(delay) => {
                        debug!(attempt, ?delay, %error, "retrying call");
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }
}
