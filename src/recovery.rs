use crate::config::RestartSettings;
use crate::error::SupervisionError;
use std::time::Duration;
use tracing::{error, info};

/// What the session runner should do after a failed capture run.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartAction {
    /// Build a fresh supervisor and start again after a delay
    RetryAfterDelay(Duration),
    /// Retry budget exhausted; surface the failure to the operator
    GiveUp,
}

/// Restart strategy configuration.
#[derive(Debug, Clone)]
pub struct RestartConfig {
    /// Maximum number of consecutive restart attempts
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay between restarts
    pub max_delay: Duration,
    /// Whether to use exponential backoff
    pub exponential_backoff: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_backoff: true,
        }
    }
}

impl From<&RestartSettings> for RestartConfig {
    fn from(settings: &RestartSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            exponential_backoff: settings.exponential_backoff,
        }
    }
}

/// Caller-side restart policy for capture runs.
///
/// The supervisor itself never retries; every failed run lands here and
/// the policy decides whether a fresh supervisor gets built.
pub struct RestartPolicy {
    config: RestartConfig,
    attempts: u32,
}

impl RestartPolicy {
    /// Create a new restart policy with default configuration
    pub fn new() -> Self {
        Self::with_config(RestartConfig::default())
    }

    /// Create a new restart policy with custom configuration
    pub fn with_config(config: RestartConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Determine the restart action for a failed run.
    pub fn on_failure(&mut self, error: &SupervisionError) -> RestartAction {
        if self.attempts >= self.config.max_retries {
            error!(
                "Maximum restarts ({}) exceeded: {}",
                self.config.max_retries, error
            );
            return RestartAction::GiveUp;
        }

        let delay = self.calculate_delay(self.attempts);
        self.attempts += 1;

        info!(
            "Scheduling capture restart (attempt {}/{}): {}",
            self.attempts, self.config.max_retries, error
        );

        RestartAction::RetryAfterDelay(delay)
    }

    /// Reset the attempt counter after a run that stayed healthy long
    /// enough to count as a recovery.
    pub fn reset(&mut self) {
        if self.attempts > 0 {
            info!("Capture recovered; restart counter reset");
            self.attempts = 0;
        }
    }

    /// Calculate delay for a restart with exponential backoff
    fn calculate_delay(&self, attempt: u32) -> Duration {
        if !self.config.exponential_backoff {
            return self.config.base_delay;
        }

        let delay_ms = self.config.base_delay.as_millis() as u64 * 2_u64.pow(attempt);
        let delay = Duration::from_millis(delay_ms);

        if delay > self.config.max_delay {
            self.config.max_delay
        } else {
            delay
        }
    }

    /// Restart attempts consumed since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_retry_logic() {
        let mut policy = RestartPolicy::new();
        let error = SupervisionError::Stall;

        // First failure should trigger a delayed retry
        let action = policy.on_failure(&error);
        assert!(matches!(action, RestartAction::RetryAfterDelay(_)));
        assert_eq!(policy.attempts(), 1);

        // After max retries, should give up
        for _ in 1..policy.config.max_retries {
            policy.on_failure(&error);
        }

        let final_action = policy.on_failure(&error);
        assert_eq!(final_action, RestartAction::GiveUp);
    }

    #[test]
    fn test_restart_policy_backoff_growth() {
        let mut policy = RestartPolicy::with_config(RestartConfig {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            exponential_backoff: true,
        });
        let error = SupervisionError::LowThroughput;

        let mut delays = Vec::new();
        for _ in 0..5 {
            if let RestartAction::RetryAfterDelay(delay) = policy.on_failure(&error) {
                delays.push(delay);
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_restart_policy_reset() {
        let mut policy = RestartPolicy::new();
        policy.on_failure(&SupervisionError::Stall);
        policy.on_failure(&SupervisionError::Stall);
        assert_eq!(policy.attempts(), 2);

        policy.reset();
        assert_eq!(policy.attempts(), 0);

        let action = policy.on_failure(&SupervisionError::Stall);
        assert!(matches!(action, RestartAction::RetryAfterDelay(_)));
    }
}
