// ── Reconnect backoff ──

use std::time::Duration;

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub base_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectConfig {
    /// `delay = min(base * 2^attempt, max)`.
    ///
    /// Deterministic on purpose: per-user clients reconnect alone, so
    /// jitter would only make delays harder to reason about and test.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(self.max_delay.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }

    /// Whether `attempt` has passed the configured ceiling.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_plateau_at_max() {
        let config = ReconnectConfig::default();
        let delays_ms: Vec<u64> = (0..8)
            .map(|attempt| config.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(
            delays_ms,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn exhaustion_respects_the_ceiling() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        };
        assert!(!config.exhausted(2));
        assert!(config.exhausted(3));

        let unbounded = ReconnectConfig {
            max_attempts: None,
            ..ReconnectConfig::default()
        };
        assert!(!unbounded.exhausted(u32::MAX));
    }
}
