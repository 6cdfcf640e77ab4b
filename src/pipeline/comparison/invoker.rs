use std::sync::Arc;
use std::time::{Duration, Instant};

use super::context::AnalysisContext;
use super::traits::{RawResponse, ReasoningEngine};
use super::{InvocationError, ReasoningFailure, ReasoningFailureKind};
use crate::config::AppConfig;

/// Bounded retry with exponential backoff around one engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wall-clock ceiling across all attempts and backoff sleeps.
    pub total_budget: Option<Duration>,
    pub retryable: Vec<ReasoningFailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            total_budget: Some(Duration::from_secs(300)),
            retryable: vec![
                ReasoningFailureKind::Timeout,
                ReasoningFailureKind::NetworkError,
                ReasoningFailureKind::ServerError,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            total_budget: Some(config.total_budget),
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, kind: ReasoningFailureKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Sleep before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Successful invocation plus how many calls it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub response: RawResponse,
    pub attempts: u32,
}

pub struct ReasoningInvoker {
    engine: Arc<dyn ReasoningEngine>,
    policy: RetryPolicy,
}

impl ReasoningInvoker {
    pub fn new(engine: Arc<dyn ReasoningEngine>, policy: RetryPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call the engine once, retrying transient failures per the policy.
    /// `timeout` bounds each call; the policy's total budget bounds the whole.
    pub fn invoke(
        &self,
        context: &AnalysisContext,
        timeout: Duration,
    ) -> Result<Invocation, InvocationError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let call_timeout = match self.policy.total_budget {
                Some(budget) => {
                    let remaining = budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return Err(InvocationError::Unavailable {
                            attempts: attempt,
                            last: ReasoningFailure::Timeout("total retry budget exhausted".into()),
                        });
                    }
                    timeout.min(remaining)
                }
                None => timeout,
            };
            attempt += 1;

            let failure = match self.engine.complete(context, call_timeout) {
                Ok(response) => {
                    tracing::info!(
                        patient_id = %context.patient_id,
                        attempts = attempt,
                        tokens = ?response.tokens_used,
                        "Reasoning engine responded"
                    );
                    return Ok(Invocation {
                        response,
                        attempts: attempt,
                    });
                }
                Err(failure) => failure,
            };

            let kind = failure.kind();
            if !self.policy.is_retryable(kind) {
                tracing::warn!(
                    patient_id = %context.patient_id,
                    attempt,
                    error = %failure,
                    "Reasoning call failed, not retryable"
                );
                return Err(match kind {
                    ReasoningFailureKind::Unauthorized | ReasoningFailureKind::RateLimited => {
                        InvocationError::Rejected {
                            attempts: attempt,
                            last: failure,
                        }
                    }
                    _ => InvocationError::Unavailable {
                        attempts: attempt,
                        last: failure,
                    },
                });
            }

            if attempt > self.policy.max_retries {
                tracing::warn!(
                    patient_id = %context.patient_id,
                    attempts = attempt,
                    error = %failure,
                    "Reasoning retries exhausted"
                );
                return Err(InvocationError::Unavailable {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = self.policy.delay_before_retry(attempt);
            if let Some(budget) = self.policy.total_budget {
                if started.elapsed() + delay >= budget {
                    tracing::warn!(
                        patient_id = %context.patient_id,
                        attempts = attempt,
                        error = %failure,
                        "Reasoning retry budget exhausted"
                    );
                    return Err(InvocationError::Unavailable {
                        attempts: attempt,
                        last: failure,
                    });
                }
            }

            tracing::warn!(
                patient_id = %context.patient_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Reasoning call failed, retrying"
            );
            std::thread::sleep(delay);
        }
    }
}
