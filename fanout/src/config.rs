use serde::Deserialize;
use shared::retry::Backoff;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("controller needs at least one worker")]
    NoWorkers,
    #[error("resync interval cannot be 0")]
    InvalidResyncInterval,
    #[error("backoff initial delay must be non-zero and below the maximum")]
    InvalidBackoff,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of targets reconciled concurrently
    pub workers: usize,
    /// Interval between full resyncs of every multiclusterapp
    pub resync_interval_secs: u64,
    /// First requeue delay after a failed reconcile
    pub backoff_initial_ms: u64,
    /// Upper bound of the requeue delay
    pub backoff_max_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            workers: 4,
            resync_interval_secs: 30,
            backoff_initial_ms: 500,
            backoff_max_secs: 60,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::NoWorkers);
        }
        if self.resync_interval_secs == 0 {
            return Err(ValidationError::InvalidResyncInterval);
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial() > self.backoff_max() {
            return Err(ValidationError::InvalidBackoff);
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_initial(), self.backoff_max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_partial_yaml() {
        let config: ControllerConfig = serde_yaml::from_str("workers: 8").unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.resync_interval_secs, 30);
        assert!(config.validate().is_ok());
        assert_eq!(config.backoff().delay(1), Duration::from_secs(1));
    }

    #[test]
    fn test_validation() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::NoWorkers));

        let config = ControllerConfig {
            backoff_initial_ms: 120_000,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::InvalidBackoff));
    }
}
