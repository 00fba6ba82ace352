//! Registry configuration

use std::time::Duration;

use serde::Deserialize;

use crate::config::duration_ms;

/// Configuration for the room registry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long a transport may stay unconnected before it is reclaimed
    #[serde(with = "duration_ms")]
    pub transport_idle_timeout: Duration,

    /// Interval between idle-transport sweeps
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            transport_idle_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    /// Set the idle timeout for unconnected transports
    pub fn transport_idle_timeout(mut self, timeout: Duration) -> Self {
        self.transport_idle_timeout = timeout;
        self
    }

    /// Set the cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.transport_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.cleanup_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_builder() {
        let config = RegistryConfig::default()
            .transport_idle_timeout(Duration::from_millis(50))
            .cleanup_interval(Duration::from_millis(10));
        assert_eq!(config.transport_idle_timeout, Duration::from_millis(50));
        assert_eq!(config.cleanup_interval, Duration::from_millis(10));
    }
}
