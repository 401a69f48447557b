//! Retry with exponential backoff, and the per-kind policy table the
//! delivery worker reads.
//!
//! # Example
//!
//! ```rust
//! use gigbook::notify::NotificationKind;
//! use gigbook::notify::retry::{RetryPolicy, RetryPolicyTable};
//! use std::time::Duration;
//!
//! let table = RetryPolicyTable::default().with_policy(
//!     NotificationKind::NewMessage,
//!     RetryPolicy::builder().max_retries(0).build(),
//! );
//!
//! assert_eq!(table.policy_for(NotificationKind::NewMessage).max_retries, 0);
//! assert_eq!(table.policy_for(NotificationKind::BookingCreated).max_retries, 5);
//! assert_eq!(
//!     table.policy_for(NotificationKind::BookingReminder).initial_delay,
//!     Duration::from_millis(500)
//! );
//! ```

use super::NotificationKind;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 5
/// - `initial_delay`: 500ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for the exponential backoff
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

const DEFAULT_MAX_RETRIES: usize = 5;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 2.0;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Delay before retry number `attempt` (0-based):
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = delay_ms as u64;
        Duration::from_millis(millis)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            initial_delay: self.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY),
            max_delay: self.max_delay.unwrap_or(DEFAULT_MAX_DELAY),
            multiplier: self.multiplier.unwrap_or(DEFAULT_MULTIPLIER),
        }
    }
}

/// Retry policy per notification kind.
///
/// Booking state changes get the most retries. Reminders are re-sent by the
/// scheduler anyway, and chat messages are visible in the thread.
#[derive(Debug, Clone)]
pub struct RetryPolicyTable {
    policies: HashMap<NotificationKind, RetryPolicy>,
}

impl RetryPolicyTable {
    /// Standard retry counts with the given backoff bounds.
    #[must_use]
    pub fn standard(initial_delay: Duration, max_delay: Duration) -> Self {
        let policies = NotificationKind::ALL
            .into_iter()
            .map(|kind| {
                let max_retries = match kind {
                    NotificationKind::BookingReminder => 3,
                    NotificationKind::NewMessage => 2,
                    NotificationKind::BookingCreated
                    | NotificationKind::BookingApproved
                    | NotificationKind::BookingRejected
                    | NotificationKind::BookingCounterOffered
                    | NotificationKind::BookingCancelled => DEFAULT_MAX_RETRIES,
                };
                let policy = RetryPolicy::builder()
                    .max_retries(max_retries)
                    .initial_delay(initial_delay)
                    .max_delay(max_delay)
                    .build();
                (kind, policy)
            })
            .collect();

        Self { policies }
    }

    /// The same policy for every kind.
    #[must_use]
    pub fn uniform(policy: &RetryPolicy) -> Self {
        Self {
            policies: NotificationKind::ALL
                .into_iter()
                .map(|kind| (kind, policy.clone()))
                .collect(),
        }
    }

    /// Override the policy for one kind.
    #[must_use]
    pub fn with_policy(mut self, kind: NotificationKind, policy: RetryPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    /// Policy for `kind`
    #[must_use]
    pub fn policy_for(&self, kind: NotificationKind) -> RetryPolicy {
        self.policies.get(&kind).cloned().unwrap_or_default()
    }
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        Self::standard(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Retry an async operation while `is_retryable` says so.
///
/// Non-retryable errors return immediately. Retryable errors are retried up
/// to `policy.max_retries` times, sleeping `delay_for_attempt` in between;
/// the last error is returned once retries are exhausted.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    tracing::error!(attempt, error = %err, "Operation failed after max retries");
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
