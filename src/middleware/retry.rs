// Retry/backoff policy shared by the model-fallback wrapper and every batching strategy
//
// Every wait and every wrapped call observes the run's cancellation token.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::errors::GenerationError;

/// How long to wait after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same wait after every attempt
    Fixed(Duration),
    /// `attempt * step + base` (attempt is 1-based)
    Linear { step: Duration, base: Duration },
}

impl Backoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { step, base } => step * attempt + base,
        }
    }
}

/// Bounded retry policy: max attempts, a backoff function and a retryable predicate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retryable: fn(&GenerationError) -> bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: GenerationError::is_retryable,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the attempt
    /// budget is spent.
    ///
    /// `operation` receives the 1-based attempt number. The error returned
    /// after exhaustion is the last one observed, so callers can still tell a
    /// spent budget (retryable error) from an immediate abort.
    pub async fn run<T, F, Fut>(
        &self,
        token: &CancellationToken,
        label: &str,
        mut operation: F,
    ) -> Result<T, GenerationError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(GenerationError::Cancelled) => return Err(GenerationError::Cancelled),
                Err(e) if (self.retryable)(&e) && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:.1}s",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        delay.as_secs_f64()
                    );
                    pause(token, delay).await?;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("{} giving up after attempt {}: {}", label, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Cancellable sleep. Returns `Err(Cancelled)` if the token fires first.
pub async fn pause(token: &CancellationToken, duration: Duration) -> Result<(), GenerationError> {
    if token.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = token.cancelled() => Err(GenerationError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Race a future against the cancellation token.
pub async fn cancellable<T, Fut>(token: &CancellationToken, future: Fut) -> Result<T, GenerationError>
where
    Fut: Future<Output = Result<T, GenerationError>>,
{
    if token.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    tokio::select! {
        _ = token.cancelled() => Err(GenerationError::Cancelled),
        result = future => result,
    }
}
