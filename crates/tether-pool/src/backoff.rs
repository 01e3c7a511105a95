//! Exponential reconnect backoff.

use std::time::Duration;

use tether_mcp::ServerConfig;

/// Reconnect schedule for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// delay = min(base_delay * 2^(attempt-1), max_delay)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let base = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let cap = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(cap))
    }

    /// Attempt number and delay for the next retry, given how many have
    /// already been made. `None` once the budget is spent.
    pub fn next_attempt(&self, retries_so_far: u32) -> Option<(u32, Duration)> {
        if retries_so_far >= self.max_retries {
            return None;
        }
        let attempt = retries_so_far + 1;
        Some((attempt, self.delay(attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = policy(1000, 60_000, 5);
        assert_eq!(p.delay(1), Duration::from_millis(1000));
        assert_eq!(p.delay(2), Duration::from_millis(2000));
        assert_eq!(p.delay(3), Duration::from_millis(4000));
        assert_eq!(p.delay(5), Duration::from_millis(16_000));
    }

    #[test]
    fn delay_is_capped() {
        let p = policy(1000, 5000, 10);
        assert_eq!(p.delay(3), Duration::from_millis(4000));
        assert_eq!(p.delay(4), Duration::from_millis(5000));
        assert_eq!(p.delay(64), Duration::from_millis(5000));
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(policy(1000, 5000, 3).delay(0), Duration::ZERO);
    }

    #[test]
    fn no_attempt_after_max_retries() {
        let p = policy(100, 10_000, 3);
        assert_eq!(p.next_attempt(0), Some((1, Duration::from_millis(100))));
        assert_eq!(p.next_attempt(2), Some((3, Duration::from_millis(400))));
        assert_eq!(p.next_attempt(3), None);
        assert_eq!(p.next_attempt(7), None);
        assert_eq!(policy(100, 10_000, 0).next_attempt(0), None);
    }

    #[test]
    fn policy_from_server_config() {
        let config = ServerConfig {
            max_retries: 2,
            retry_delay_ms: 250,
            retry_max_delay_ms: 1000,
            ..ServerConfig::http("web", "http://localhost/")
        };
        assert_eq!(ReconnectPolicy::from_config(&config), policy(250, 1000, 2));
    }
}
