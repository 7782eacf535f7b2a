use std::time::Duration;

use crate::config::AdwConfig;

/// Local retry budget for transient phase outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before retry N is `delays[N-1]`; the last entry repeats.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays: [60, 120, 180].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AdwConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            delays: config
                .toml
                .retry
                .backoff_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        }
    }

    /// Retries without waiting.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            delays: vec![Duration::ZERO],
        }
    }

    /// Whether retry number `retry` (1-based) is within budget.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let index = retry.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}
