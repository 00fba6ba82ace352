//! Service configuration
//!
//! Every section has built-in defaults and can be overridden from a TOML
//! file. Sections left out of the file keep their defaults:
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:3016"
//!
//! [worker]
//! num_workers = 2
//! rtc_min_port = 40000
//! rtc_max_port = 40099
//!
//! [webrtc_transport]
//! listen_ips = [{ ip = "0.0.0.0", announced_ip = "203.0.113.10" }]
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::engine::{WebRtcTransportConfig, WorkerSettings};
use crate::error::{Error, Result};
use crate::media::{default_media_codecs, RtpCodecCapability};
use crate::registry::RegistryConfig;
use crate::server::ServerConfig;
use crate::stats::MonitorConfig;

/// (De)serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    pub server: ServerConfig,
    pub worker: WorkerSettings,
    pub webrtc_transport: WebRtcTransportConfig,
    /// Codecs every router offers
    pub media_codecs: Vec<RtpCodecCapability>,
    pub registry: RegistryConfig,
    pub monitor: MonitorConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            worker: WorkerSettings::default(),
            webrtc_transport: WebRtcTransportConfig::default(),
            media_codecs: default_media_codecs(),
            registry: RegistryConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl SfuConfig {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn worker(mut self, worker: WorkerSettings) -> Self {
        self.worker = worker;
        self
    }

    pub fn webrtc_transport(mut self, transport: WebRtcTransportConfig) -> Self {
        self.webrtc_transport = transport;
        self
    }

    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.webrtc_transport.validate()?;
        if self.media_codecs.is_empty() {
            return Err(Error::Config("media_codecs must not be empty".into()));
        }
        crate::media::router_capabilities(&self.media_codecs)
            .map_err(|e| Error::Config(format!("media_codecs: {}", e)))?;
        Ok(())
    }
}
