//! Bounded retries with exponential backoff for port calls.
//!
//! Only transient errors are retried. Permanent errors (bad input, missing
//! credentials, remote rejection) return on the first attempt.

use std::time::Duration;

use tracing::warn;

use crate::config::RetrySettings;
use crate::ports::{PortError, PortErrorKind, Provider};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            multiplier: settings.multiplier.max(1.0),
        }
    }

    /// Delay before the attempt following `failed_attempts` failures.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(30) as i32;
        let scaled = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn run<T, F>(&self, provider: Provider, operation: &str, call: F) -> Result<T, PortError>
    where
        F: FnMut(u32) -> Result<T, PortError>,
    {
        self.run_with_sleep(provider, operation, call, std::thread::sleep)
    }

    pub fn run_with_sleep<T, F, S>(
        &self,
        provider: Provider,
        operation: &str,
        mut call: F,
        mut sleep: S,
    ) -> Result<T, PortError>
    where
        F: FnMut(u32) -> Result<T, PortError>,
        S: FnMut(Duration),
    {
        let mut attempt = 1u32;
        loop {
            match call(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if error.kind == PortErrorKind::Permanent => return Err(error),
                Err(error) if attempt >= self.max_attempts => {
                    return Err(PortError::transient(
                        provider,
                        format!(
                            "{operation} failed after {attempt} attempt(s): {}",
                            error.message
                        ),
                    ));
                }
                Err(error) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        provider = provider.as_str(),
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.message,
                        "transient port failure, retrying"
                    );
                    sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_settings(&RetrySettings {
            max_attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            multiplier: 2.0,
        })
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff_for(1), Duration::from_millis(100));
        assert_eq!(p.backoff_for(2), Duration::from_millis(200));
        assert_eq!(p.backoff_for(3), Duration::from_millis(300));
        assert_eq!(p.backoff_for(10), Duration::from_millis(300));
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let mut sleeps = Vec::new();
        let result = policy(3).run_with_sleep(
            Provider::Copy,
            "angles",
            |attempt| {
                if attempt < 3 {
                    Err(PortError::transient(Provider::Copy, "HTTP 429"))
                } else {
                    Ok(attempt)
                }
            },
            |d| sleeps.push(d),
        );
        assert_eq!(result, Ok(3));
        assert_eq!(
            sleeps,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let err = policy(4)
            .run_with_sleep(
                Provider::Storefront,
                "productCreate",
                |_| -> Result<(), PortError> {
                    calls += 1;
                    Err(PortError::permanent(Provider::Storefront, "HTTP 401"))
                },
                |_| {},
            )
            .expect_err("permanent error should surface");
        assert_eq!(calls, 1);
        assert_eq!(err.kind, PortErrorKind::Permanent);
    }

    #[test]
    fn exhausted_transient_errors_stay_transient() {
        let mut calls = 0;
        let err = policy(2)
            .run_with_sleep(
                Provider::Images,
                "images/generations",
                |_| -> Result<(), PortError> {
                    calls += 1;
                    Err(PortError::transient(Provider::Images, "HTTP 503"))
                },
                |_| {},
            )
            .expect_err("exhausted retries should fail");
        assert_eq!(calls, 2);
        assert!(err.is_transient());
        assert!(err.message.contains("after 2 attempt(s)"));
    }
}
