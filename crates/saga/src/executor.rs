//! Bounded-retry execution of a single saga step.

use std::future::Future;

use common::IdempotencyKey;
use domain::StepName;

use crate::config::RetryConfig;
use crate::error::{Result, SagaError};
use crate::services::ServiceError;

/// Runs collaborator calls with timeout, classification, and exponential backoff.
///
/// Retryable failures (timeouts, unavailability) are retried up to
/// `max_attempts` and then surface as [`SagaError::RemoteUnavailable`].
/// Anything else surfaces on the first occurrence without consuming the
/// retry budget.
#[derive(Debug, Clone, Default)]
pub struct StepExecutor {
    config: RetryConfig,
}

impl StepExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Executes `operation` for `step`.
    ///
    /// `key` is only used for logging: the operation itself must send it, so
    /// that every attempt carries the same key.
    #[tracing::instrument(skip(self, operation), fields(key = key.map(IdempotencyKey::as_str)))]
    pub async fn execute<T, F, Fut>(
        &self,
        step: StepName,
        key: Option<&IdempotencyKey>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ServiceError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let outcome = match tokio::time::timeout(self.config.attempt_timeout, operation()).await
            {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout(format!(
                    "no response within {:?}",
                    self.config.attempt_timeout
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.delay_for(attempt - 1);
                    tracing::warn!(%step, attempt, error = %err, ?delay, "step failed, retrying");
                    metrics::counter!("checkout_step_retries_total", "step" => step.as_str())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(classify(step, attempt, err)),
            }
        }
    }
}

/// Maps the final collaborator error onto the saga taxonomy.
fn classify(step: StepName, attempts: u32, err: ServiceError) -> SagaError {
    match err {
        ServiceError::NotFound(what) => SagaError::NotFound(what),
        ServiceError::BadRequest(reason) => SagaError::Validation(reason),
        ServiceError::InsufficientStock {
            product_id,
            requested,
            available,
        } => SagaError::InsufficientStock {
            product_id,
            requested,
            available,
        },
        transient @ (ServiceError::Timeout(_) | ServiceError::Unavailable(_)) => {
            SagaError::RemoteUnavailable {
                step,
                attempts,
                last_error: transient.to_string(),
            }
        }
    }
}
