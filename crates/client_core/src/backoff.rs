use std::{str::FromStr, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffGrowth {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

impl FromStr for BackoffGrowth {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(BackoffGrowth::Linear),
            "exponential" => Ok(BackoffGrowth::Exponential),
            other => Err(format!("unknown backoff growth '{other}'")),
        }
    }
}

/// Reconnect delay schedule for the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub growth: BackoffGrowth,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            growth: BackoffGrowth::Linear,
            max_attempts: Some(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let scaled = match self.growth {
            BackoffGrowth::Linear => self.base_delay.saturating_mul(attempt),
            BackoffGrowth::Exponential => {
                let exponent = (attempt - 1).min(16);
                self.base_delay.saturating_mul(1_u32 << exponent)
            }
        };
        scaled.min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}
