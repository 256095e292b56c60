use std::time::Duration;

use phasegate_core::config::RetryConfig;
use phasegate_core::types::ExecutorFailure;

/// Delay before the attempt following failed attempt number `attempt` (1-based):
/// `initial * 2^(attempt-1)`, capped at `max_backoff_ms`, with 0.8x-1.2x jitter
/// that never exceeds the cap.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    let jittered = ((ms as f64 * jitter) as u64).min(config.max_backoff_ms);
    Duration::from_millis(jittered)
}

/// Whether another attempt is allowed after `entry_attempts` attempts since
/// the node was last entered.
pub fn should_retry(entry_attempts: u32, failure: &ExecutorFailure, config: &RetryConfig) -> bool {
    failure.retryable && entry_attempts < config.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let c = config();
        for _ in 0..20 {
            let first = calculate_backoff(1, &c).as_millis();
            assert!((80..=120).contains(&first), "{first}");
            let third = calculate_backoff(3, &c).as_millis();
            assert!((320..=480).contains(&third), "{third}");
            assert!(calculate_backoff(30, &c).as_millis() <= 1_000);
        }
    }

    #[test]
    fn retry_budget_and_retryability() {
        let c = config();
        let transient = ExecutorFailure::new("io", "flaky");
        assert!(should_retry(1, &transient, &c));
        assert!(should_retry(2, &transient, &c));
        assert!(!should_retry(3, &transient, &c));
        assert!(!should_retry(1, &ExecutorFailure::killed(), &c));
    }
}
