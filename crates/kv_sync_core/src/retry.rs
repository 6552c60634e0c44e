//! Budget-aware retry loop with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use crate::budget::TimeoutBudget;
use crate::error::{classify, ClassifiedError, ErrorContext, RawFailure};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 behave as 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay applied as symmetric random jitter.
    pub jitter_ratio: f64,
    /// Expected duration of one attempt, checked against the budget before
    /// each attempt and before each sleep.
    pub estimated_attempt_cost: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
            jitter_ratio: 0.1,
            estimated_attempt_cost: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Same policy with a different attempt cap.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// `unit` is a draw from `[0, 1)`; 0.5 yields the un-jittered delay.
    pub fn backoff_delay(&self, attempt: u32, unit: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);
        let jitter = self.jitter_ratio.clamp(0.0, 1.0) * (unit.clamp(0.0, 1.0) * 2.0 - 1.0);
        let nanos = (capped.as_nanos() as f64 * (1.0 + jitter)).round().max(0.0);
        Duration::from_nanos(nanos as u64).min(self.max_delay)
    }

    /// Delay for a failed attempt, preferring a server hint when present.
    pub fn delay_for(&self, attempt: u32, error: &ClassifiedError, unit: f64) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff_delay(attempt, unit),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub attempt: u32,
    pub succeeded: bool,
    pub error: Option<ClassifiedError>,
    pub elapsed_ms: u64,
}

/// Final result of a retried operation plus the attempts it took.
#[derive(Debug)]
pub struct RetryReport<T> {
    pub result: Result<T, ClassifiedError>,
    pub attempts: Vec<AttemptOutcome>,
}

impl<T> RetryReport<T> {
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    pub fn retries(&self) -> u32 {
        self.attempt_count().saturating_sub(1)
    }
}

/// Runs `attempt` until it succeeds, fails terminally, runs out of attempts,
/// or the budget can no longer cover another attempt.
///
/// Errors are classified with `classify_failure` after each attempt; budget
/// exhaustion is reported as a `TIMEOUT` that carries the last error seen.
pub async fn retry_with_budget<T, E, F, Fut, C>(
    operation: &str,
    policy: &RetryPolicy,
    budget: &TimeoutBudget,
    mut attempt: F,
    classify_failure: C,
) -> RetryReport<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(E) -> ClassifiedError,
{
    let max_attempts = policy.max_attempts.max(1);
    let cost = policy.estimated_attempt_cost;
    let mut attempts = Vec::new();
    let mut last_error: Option<ClassifiedError> = None;

    for number in 1..=max_attempts {
        if !budget.within_budget(cost) {
            return RetryReport {
                result: Err(exhausted(operation, budget, last_error.as_ref())),
                attempts,
            };
        }

        let started = tokio::time::Instant::now();
        let outcome = attempt(number).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let error = match outcome {
            Ok(value) => {
                attempts.push(AttemptOutcome {
                    attempt: number,
                    succeeded: true,
                    error: None,
                    elapsed_ms,
                });
                return RetryReport {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(raw) => classify_failure(raw),
        };

        attempts.push(AttemptOutcome {
            attempt: number,
            succeeded: false,
            error: Some(error.clone()),
            elapsed_ms,
        });

        if !error.is_retryable() || number == max_attempts {
            return RetryReport {
                result: Err(error),
                attempts,
            };
        }

        let wanted = policy.delay_for(number, &error, rand::random::<f64>());
        let Some(spare) = budget.remaining().checked_sub(cost) else {
            return RetryReport {
                result: Err(exhausted(operation, budget, Some(&error))),
                attempts,
            };
        };
        let delay = wanted.min(spare);

        tracing::warn!(
            component = "retry",
            event = "retry_scheduled",
            operation,
            attempt = number,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            kind = error.kind().as_str(),
            message = %error.message(),
        );
        last_error = Some(error);
        tokio::time::sleep(delay).await;
    }

    // Only reachable if max_attempts were zero, which the clamp above rules out.
    RetryReport {
        result: Err(exhausted(operation, budget, last_error.as_ref())),
        attempts,
    }
}

fn exhausted(
    operation: &str,
    budget: &TimeoutBudget,
    last_error: Option<&ClassifiedError>,
) -> ClassifiedError {
    classify(
        RawFailure::BudgetExhausted {
            operation: operation.to_string(),
            remaining_ms: u64::try_from(budget.remaining().as_millis()).unwrap_or(u64::MAX),
            last_error: last_error.map(ToString::to_string),
        },
        &ErrorContext::new("retry", operation),
    )
}
