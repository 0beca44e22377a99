//! Randomized exponential backoff for signaling reconnection

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection policy configuration
///
/// Controls how the signaling transport re-establishes a lost channel.
/// After `max_attempts` failed attempts the transport gives up and reports
/// a final failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnection attempts (default: 3)
    pub max_attempts: u32,
    /// Delay before the first attempt in milliseconds (default: 1000ms)
    pub delay_initial_ms: u64,
    /// Maximum delay in milliseconds (default: 4000ms)
    pub delay_max_ms: u64,
    /// Delay multiplier per attempt (default: 2.0)
    pub multiplier: f64,
    /// Random deviation as a fraction of the delay, 0.0-1.0 (default: 0.5)
    pub randomization_factor: f64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_initial_ms: 1000,
            delay_max_ms: 4000,
            multiplier: 2.0,
            randomization_factor: 0.5,
        }
    }
}

impl ReconnectionPolicy {
    /// Policy without jitter, useful when delays must be predictable
    pub fn deterministic(max_attempts: u32, delay_initial_ms: u64, delay_max_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_initial_ms,
            delay_max_ms,
            multiplier: 2.0,
            randomization_factor: 0.0,
        }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.delay_initial_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnection delay_initial_ms must be greater than 0".to_string(),
            ));
        }

        if self.delay_max_ms < self.delay_initial_ms {
            return Err(Error::InvalidConfig(format!(
                "reconnection delay_max_ms ({}) must be >= delay_initial_ms ({})",
                self.delay_max_ms, self.delay_initial_ms
            )));
        }

        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnection multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }

        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(Error::InvalidConfig(format!(
                "reconnection randomization_factor must be in range 0.0-1.0, got {}",
                self.randomization_factor
            )));
        }

        Ok(())
    }

    /// Calculate the delay before a given attempt
    ///
    /// # Arguments
    /// * `attempt` - Current attempt number (0-indexed)
    ///
    /// The nominal delay `initial * multiplier^attempt` deviates up or down by
    /// at most `randomization_factor` of itself, then is clamped to the maximum.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, rand::thread_rng().gen::<f64>())
    }

    /// Check if more attempts are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Inclusive lower and upper bound of the delay for an attempt
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal_ms(attempt);
        let deviation = (nominal * self.randomization_factor).floor();
        let max = self.delay_max_ms as f64;
        (
            Duration::from_millis((nominal - deviation).min(max) as u64),
            Duration::from_millis((nominal + deviation).min(max) as u64),
        )
    }

    fn nominal_ms(&self, attempt: u32) -> f64 {
        (self.delay_initial_ms as f64) * self.multiplier.powi(attempt as i32)
    }

    fn backoff_with(&self, attempt: u32, sample: f64) -> Duration {
        let mut ms = self.nominal_ms(attempt);

        if self.randomization_factor > 0.0 {
            let deviation = (sample * self.randomization_factor * ms).floor();
            // The low decimal digit of the sample decides the direction
            if ((sample * 10.0).floor() as u64) & 1 == 0 {
                ms -= deviation;
            } else {
                ms += deviation;
            }
        }

        Duration::from_millis(ms.min(self.delay_max_ms as f64) as u64)
    }
}
