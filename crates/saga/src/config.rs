//! Configuration values for the orchestrator, its step executor, and the recovery sweep.
//!
//! Everything here is a plain value passed to constructors. Nothing is read
//! from the environment.

use std::time::Duration;

use crate::error::{Result, SagaError};

/// Retry behavior for collaborator calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Time allowed for one attempt before it counts as a timeout.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Short delays, for tests and local development.
    pub const fn fast() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(1),
        }
    }

    /// More attempts and longer waits, for flaky networks.
    pub const fn patient() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.5,
            attempt_timeout: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }

    /// Longest one executed step can take: every attempt timing out, plus
    /// the backoff between attempts.
    pub fn worst_case_step(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let waiting: Duration = (0..attempts - 1).map(|retry| self.delay_for(retry)).sum();
        self.attempt_timeout.saturating_mul(attempts) + waiting
    }
}

/// What to do when the cart cannot be cleared after all items are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CartClearPolicy {
    /// Release the reservations and fail the order.
    #[default]
    Compensate,
    /// Keep the reservations, log the failure, and complete the order.
    BestEffort,
}

/// Settings for [`OrderOrchestrator`](crate::OrderOrchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry: RetryConfig,
    /// Overall budget for one saga. Once spent, no further forward step starts.
    pub saga_deadline: Duration,
    pub cart_clear_policy: CartClearPolicy,
    /// Flag consulted before accepting cash-on-delivery orders.
    pub cod_flag_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            saga_deadline: Duration::from_secs(30),
            cart_clear_policy: CartClearPolicy::default(),
            cod_flag_name: "enableCodPayment".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_saga_deadline(mut self, deadline: Duration) -> Self {
        self.saga_deadline = deadline;
        self
    }

    pub fn with_cart_clear_policy(mut self, policy: CartClearPolicy) -> Self {
        self.cart_clear_policy = policy;
        self
    }

    pub fn with_cod_flag_name(mut self, name: impl Into<String>) -> Self {
        self.cod_flag_name = name.into();
        self
    }
}

/// Settings for [`RecoverySweep`](crate::RecoverySweep).
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long an in-flight order may go without a write before it is picked up.
    pub staleness_threshold: Duration,
    /// Maximum orders handled per sweep.
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl RecoveryConfig {
    /// Checks that a live saga using `retry` can never look stale.
    ///
    /// A running saga writes its order after every collaborator call, so the
    /// longest silence is one worst-case step. The threshold must exceed it.
    pub fn validate(&self, retry: &RetryConfig) -> Result<()> {
        let silence = retry.worst_case_step();
        if self.staleness_threshold <= silence {
            return Err(SagaError::Validation(format!(
                "staleness threshold {:?} must exceed the worst-case step duration {:?}",
                self.staleness_threshold, silence
            )));
        }
        if self.interval.is_zero() {
            return Err(SagaError::Validation(
                "recovery interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
