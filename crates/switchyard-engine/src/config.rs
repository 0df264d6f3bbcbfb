//! Runtime settings of the run engine.

use std::time::Duration;

use switchyard_config::{EngineSection, SwitchyardConfig};

use crate::retry::BackoffPolicy;

/// Limits and retry timing applied to every run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum active execution time of a run. Time spent suspended does not count.
    pub run_timeout: Duration,
    /// Runs driven at the same time; further runs wait for a slot.
    pub max_concurrent_runs: usize,
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            run_timeout: Duration::from_secs(section.run_timeout_secs),
            max_concurrent_runs: section.max_concurrent_runs.max(1),
            backoff: BackoffPolicy::from(&section.backoff),
        }
    }
}

impl From<&SwitchyardConfig> for EngineConfig {
    fn from(config: &SwitchyardConfig) -> Self {
        Self::from(&config.engine())
    }
}

impl EngineConfig {
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_config_file_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.run_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_concurrent_runs, 64);
    }

    #[test]
    fn test_from_toml() {
        let file = SwitchyardConfig::from_toml(
            r#"
[engine]
run_timeout_secs = 30
max_concurrent_runs = 4

[engine.backoff]
initial_ms = 10
max_ms = 80
multiplier = 3.0
"#,
        )
        .unwrap();
        let config = EngineConfig::from(&file);
        assert_eq!(config.run_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_runs, 4);
        assert_eq!(config.backoff.delay(2), Duration::from_millis(30));
    }
}
