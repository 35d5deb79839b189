use crate::RuntimeError;
use std::time::Duration;
use tracing::warn;

/// Fixed-attempt, fixed-backoff retry with a hard per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    /// Deadline handed to each attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration, timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            timeout,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut(u32) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("{what}: attempt {attempt}/{attempts} failed: {e}; retrying in {}s", self.backoff.as_secs());
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO, Duration::from_secs(1))
    }

    #[test]
    fn retries_transient_until_success() {
        let mut calls = 0;
        let result = fast(3).run("connect", |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(RuntimeError::Transient("reset".to_owned()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<(), _> = fast(2).run("connect", |_| {
            calls += 1;
            Err(RuntimeError::Transient("reset".to_owned()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = fast(5).run("script", |_| {
            calls += 1;
            Err(RuntimeError::CommandFailed {
                command: "bash x".to_owned(),
                exit_code: 2,
                stderr: String::new(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::from_secs(1));
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.run("x", |_| Ok::<_, RuntimeError>(7)).unwrap(), 7);
    }
}
