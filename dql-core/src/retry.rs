use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior with exponential backoff.
///
/// Applied to every store call the engine issues. Only errors for which
/// `Error::is_retryable()` holds are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_attempts: u32,

    /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    pub max_backoff_ms: u64,

    /// Multiplier applied to backoff after each retry
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
            backoff_multiplier,
        }
    }

    /// Returns a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Returns a policy for quick transient failures.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_multiplier: 2.0,
        }
    }

    /// Returns the policy used against a remote store under normal load.
    pub fn standard() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }

    /// Calculates the backoff duration for a given attempt number (0-indexed).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(attempt as i32))
            .min(self.max_backoff_ms as f64) as u64;
        Duration::from_millis(backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Retries an operation according to the specified policy.
///
/// Non-retryable errors are returned immediately. When all attempts are
/// exhausted the last error is surfaced.
///
/// # Examples
///
/// ```
/// use dql_core::retry::{retry_with_policy, RetryPolicy};
/// use dql_core::{Error, Result};
///
/// let mut calls = 0;
/// let result: Result<u32> = retry_with_policy(&RetryPolicy::new(2, 0, 0, 1.0), || {
///     calls += 1;
///     if calls < 2 {
///         Err(Error::ThroughputExceeded("slow down".into()))
///     } else {
///         Ok(calls)
///     }
/// });
/// assert_eq!(result.unwrap(), 2);
/// ```
pub fn retry_with_policy<F, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_error = match operation() {
        Ok(result) => return Ok(result),
        Err(e) if !e.is_retryable() => return Err(e),
        Err(e) => e,
    };

    for attempt in 0..policy.max_attempts {
        let backoff = policy.backoff_duration(attempt);
        warn!(
            attempt = attempt + 1,
            max_attempts = policy.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %last_error,
            "retrying store call"
        );
        std::thread::sleep(backoff);

        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}

/// Retries an operation with the default policy.
pub fn retry<F, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    retry_with_policy(&RetryPolicy::default(), operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::{Arc, Mutex};

    fn throttled() -> Error {
        Error::ThroughputExceeded("ProvisionedThroughputExceededException".to_string())
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff_ms, 100);
        assert_eq!(policy.max_backoff_ms, 5000);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_backoff_duration_exponential() {
        let policy = RetryPolicy::new(5, 100, 10000, 2.0);

        assert_eq!(policy.backoff_duration(0).as_millis(), 100);
        assert_eq!(policy.backoff_duration(1).as_millis(), 200);
        assert_eq!(policy.backoff_duration(2).as_millis(), 400);
        assert_eq!(policy.backoff_duration(3).as_millis(), 800);
    }

    #[test]
    fn test_backoff_duration_respects_max() {
        let policy = RetryPolicy::new(10, 100, 500, 2.0);

        assert_eq!(policy.backoff_duration(5).as_millis(), 500);
        assert_eq!(policy.backoff_duration(10).as_millis(), 500);
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new(3, 1, 5, 2.0);
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_policy(&policy, || {
            let mut count = counter_clone.lock().unwrap();
            *count += 1;

            if *count < 3 {
                Err(throttled())
            } else {
                Ok::<i32, Error>(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*counter.lock().unwrap(), 3);
    }

    #[test]
    fn test_retry_fails_after_max_attempts() {
        let policy = RetryPolicy::new(2, 1, 10, 1.5);
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_policy(&policy, || {
            *counter_clone.lock().unwrap() += 1;
            Err::<i32, Error>(Error::Transient("connection reset".to_string()))
        });

        assert!(matches!(result, Err(Error::Transient(_))));
        // Initial attempt + 2 retries
        assert_eq!(*counter.lock().unwrap(), 3);
    }

    #[test]
    fn test_retry_does_not_retry_remote_error() {
        let policy = RetryPolicy::fast();
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_policy(&policy, || {
            *counter_clone.lock().unwrap() += 1;
            Err::<i32, Error>(Error::remote("ValidationException", "bad key"))
        });

        assert_eq!(*counter.lock().unwrap(), 1);
        match result {
            Err(Error::Remote { code, .. }) => assert_eq!(code, "ValidationException"),
            _ => panic!("Expected Remote error"),
        }
    }

    #[test]
    fn test_retry_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_policy(&policy, || {
            *counter_clone.lock().unwrap() += 1;
            Err::<i32, Error>(throttled())
        });

        assert!(result.is_err());
        assert_eq!(*counter.lock().unwrap(), 1);
    }
}
