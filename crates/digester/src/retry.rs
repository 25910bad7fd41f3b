//! Bounded retry with exponential backoff and a per-attempt timeout.
//!
//! Every outbound call the pipeline makes (listing pages, LLM calls, PDF downloads) goes through
//! [`RetryPolicy::run`]. An attempt that exceeds the timeout fails with
//! [`DigestError::Timeout`], and only errors for which [`DigestError::is_transient`] holds are
//! retried.
//!
//! ```
//! use std::time::Duration;
//!
//! use digester::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.backoff(1), Duration::from_secs(1));
//! assert_eq!(policy.backoff(2), Duration::from_secs(2));
//! assert_eq!(policy.backoff(3), Duration::from_secs(4));
//! ```

use std::future::Future;

use super::*;
use crate::config::RetryConfig;

/// How often and how patiently a call is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Total attempts including the first
  pub max_attempts:    u32,
  /// Delay after the first failed attempt
  pub initial_backoff: Duration,
  /// Ceiling for a single delay
  pub max_backoff:     Duration,
  /// Growth factor between delays
  pub multiplier:      f64,
  /// Time budget for each attempt
  pub timeout:         Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts:    3,
      initial_backoff: Duration::from_secs(1),
      max_backoff:     Duration::from_secs(30),
      multiplier:      2.0,
      timeout:         Duration::from_secs(120),
    }
  }
}

impl RetryPolicy {
  /// Builds a policy from its configuration section and the caller's timeout.
  pub fn from_config(config: &RetryConfig, timeout: Duration) -> Self {
    Self {
      max_attempts: config.max_attempts.max(1),
      initial_backoff: Duration::from_millis(config.initial_backoff_ms),
      max_backoff: Duration::from_millis(config.max_backoff_ms),
      multiplier: if config.multiplier < 1.0 { 1.0 } else { config.multiplier },
      timeout,
    }
  }

  /// A policy without delays between attempts.
  pub fn immediate(max_attempts: u32, timeout: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      initial_backoff: Duration::ZERO,
      max_backoff: Duration::ZERO,
      multiplier: 1.0,
      timeout,
    }
  }

  /// Returns a copy with a different per-attempt timeout.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Delay after the `attempt`-th failure (one-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
    Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
  }

  /// Runs `operation` until it succeeds, fails permanently or attempts run out.
  ///
  /// `label` names the call in log output.
  pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>, {
    let attempts = self.max_attempts.max(1);
    let mut attempt = 0;
    loop {
      attempt += 1;
      let outcome = match tokio::time::timeout(self.timeout, operation()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(DigestError::Timeout(self.timeout)),
      };
      match outcome {
        Ok(value) => return Ok(value),
        Err(e) if e.is_transient() && attempt < attempts => {
          let delay = self.backoff(attempt);
          warn!("{label} failed (attempt {attempt}/{attempts}): {e}; retrying in {delay:?}");
          tokio::time::sleep(delay).await;
        },
        Err(e) => {
          if attempt > 1 {
            warn!("{label} failed after {attempt} attempts: {e}");
          }
          return Err(e);
        },
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use super::*;

  #[test]
  fn test_backoff_is_capped() {
    let policy = RetryPolicy { max_backoff: Duration::from_secs(5), ..RetryPolicy::default() };
    assert_eq!(policy.backoff(3), Duration::from_secs(4));
    assert_eq!(policy.backoff(4), Duration::from_secs(5));
    assert_eq!(policy.backoff(40), Duration::from_secs(5));
  }

  #[traced_test]
  #[tokio::test]
  async fn test_retries_transient_then_succeeds() {
    let policy = RetryPolicy::immediate(3, Duration::from_secs(1));
    let calls = AtomicU32::new(0);
    let value = policy
      .run("flaky call", || async {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
          Err(DigestError::Api { status: 503, message: "busy".into() })
        } else {
          Ok(7)
        }
      })
      .await
      .unwrap();
    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(logs_contain("flaky call failed (attempt 1/3)"));
  }

  #[tokio::test]
  async fn test_permanent_errors_are_not_retried() {
    let policy = RetryPolicy::immediate(5, Duration::from_secs(1));
    let calls = AtomicU32::new(0);
    let err = policy
      .run("bad request", || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(DigestError::Api { status: 400, message: "nope".into() })
      })
      .await
      .unwrap_err();
    assert!(matches!(err, DigestError::Api { status: 400, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_timeouts_exhaust_attempts() {
    let policy = RetryPolicy::immediate(2, Duration::from_millis(20));
    let calls = AtomicU32::new(0);
    let err = policy
      .run("slow call", || async {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
      })
      .await
      .unwrap_err();
    assert!(matches!(err, DigestError::Timeout(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
