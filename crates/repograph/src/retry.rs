#![forbid(unsafe_code)]

//! Bounded exponential backoff shared by source fetches and graph writes.

use std::time::Duration;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn for_fetch(config: &PipelineConfig) -> Self {
        Self::from_config(config, config.fetch_retries)
    }

    pub fn for_write(config: &PipelineConfig) -> Self {
        Self::from_config(config, config.write_retries)
    }

    fn from_config(config: &PipelineConfig, max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based). A server hint wins
    /// over the computed backoff; both are capped at `max_delay`.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let computed = self.base_delay.saturating_mul(1 << shift);
        hint.unwrap_or(computed).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `classify` returns `None` for fatal errors and
    /// `Some(hint)` for retryable ones.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        classify: impl Fn(&E) -> Option<Option<Duration>>,
        mut on_retry: impl FnMut(u32, Duration, &E),
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let Some(hint) = classify(&err) else {
                        return Err(err);
                    };
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.delay(attempt, hint);
                    on_retry(attempt, delay, &err);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.delay(1, None), Duration::from_millis(100));
        assert_eq!(p.delay(2, None), Duration::from_millis(200));
        assert_eq!(p.delay(4, None), Duration::from_millis(800));
        assert_eq!(p.delay(5, None), Duration::from_millis(1_000));
        assert_eq!(p.delay(30, None), Duration::from_millis(1_000));
    }

    #[test]
    fn server_hint_overrides_but_is_capped() {
        let p = policy(3);
        assert_eq!(
            p.delay(1, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
        assert_eq!(
            p.delay(1, Some(Duration::from_secs(60))),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn stops_after_budget() {
        let p = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::none()
        };
        let mut calls = 0;
        let result: Result<(), &str> = p.run(
            |_| {
                calls += 1;
                Err("down")
            },
            |_| Some(None),
            |_, _, _| {},
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let p = RetryPolicy {
            max_retries: 5,
            ..RetryPolicy::none()
        };
        let mut calls = 0;
        let result: Result<(), &str> = p.run(
            |_| {
                calls += 1;
                Err("forbidden")
            },
            |_| None,
            |_, _, _| {},
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn recovers_on_later_attempt() {
        let p = RetryPolicy {
            max_retries: 3,
            ..RetryPolicy::none()
        };
        let mut retries = Vec::new();
        let result: Result<u32, &str> = p.run(
            |attempt| if attempt < 2 { Err("busy") } else { Ok(attempt) },
            |_| Some(None),
            |attempt, _, _| retries.push(attempt),
        );
        assert_eq!(result, Ok(2));
        assert_eq!(retries, vec![1, 2]);
    }
}
