//! Worker and transport configuration

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::Deserialize;

use crate::config::duration_ms;
use crate::error::{Error, Result};

/// Worker pool settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Number of media workers
    pub num_workers: usize,

    /// Lowest RTC port shared out between workers
    pub rtc_min_port: u16,

    /// Highest RTC port shared out between workers
    pub rtc_max_port: u16,

    /// Delay between a worker dying and the process exiting
    #[serde(with = "duration_ms")]
    pub death_grace_period: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            num_workers: 4,
            rtc_min_port: 10_000,
            rtc_max_port: 10_100,
            death_grace_period: Duration::from_secs(2),
        }
    }
}

impl WorkerSettings {
    /// Set the number of workers
    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// Set the RTC port range
    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.rtc_min_port = min;
        self.rtc_max_port = max;
        self
    }

    /// Set the grace period before a dead worker takes the process down
    pub fn death_grace_period(mut self, period: Duration) -> Self {
        self.death_grace_period = period;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(Error::Config("num_workers must be at least 1".into()));
        }
        if self.rtc_min_port > self.rtc_max_port {
            return Err(Error::Config(format!(
                "rtc port range {}-{} is inverted",
                self.rtc_min_port, self.rtc_max_port
            )));
        }
        let ports = self.rtc_max_port as usize - self.rtc_min_port as usize + 1;
        if ports < self.num_workers {
            return Err(Error::Config(format!(
                "{} ports cannot be split between {} workers",
                ports, self.num_workers
            )));
        }
        Ok(())
    }

    /// Disjoint port range for each worker; the last one takes the remainder
    pub fn worker_port_ranges(&self) -> Vec<RangeInclusive<u16>> {
        let n = self.num_workers.max(1);
        let total = self.rtc_max_port as usize - self.rtc_min_port as usize + 1;
        let chunk = (total / n).max(1);

        (0..n)
            .map(|i| {
                let start = self.rtc_min_port as usize + i * chunk;
                let end = if i + 1 == n {
                    self.rtc_max_port as usize
                } else {
                    start + chunk - 1
                };
                start as u16..=end as u16
            })
            .collect()
    }
}

/// An address transports listen on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenIp {
    pub ip: IpAddr,
    /// Address advertised in ICE candidates (for NAT traversal)
    #[serde(default)]
    pub announced_ip: Option<String>,
}

impl ListenIp {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            announced_ip: None,
        }
    }

    /// Address clients should connect to
    pub fn candidate_address(&self) -> String {
        self.announced_ip
            .clone()
            .unwrap_or_else(|| self.ip.to_string())
    }
}

/// WebRTC transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    /// Bitrate floor for outgoing estimation
    pub minimum_available_outgoing_bitrate: u32,
    /// Bitrate ceiling for what a client may send
    pub max_incoming_bitrate: u32,
    pub enable_sctp: bool,
    pub max_sctp_message_size: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp::new(IpAddr::V4(Ipv4Addr::LOCALHOST))],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            minimum_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
            enable_sctp: true,
            max_sctp_message_size: 262_144,
        }
    }
}

impl WebRtcTransportConfig {
    /// Replace the listen addresses with a single one
    pub fn listen_ip(mut self, ip: IpAddr, announced_ip: Option<String>) -> Self {
        self.listen_ips = vec![ListenIp { ip, announced_ip }];
        self
    }

    /// Set the incoming bitrate ceiling
    pub fn max_incoming_bitrate(mut self, bitrate: u32) -> Self {
        self.max_incoming_bitrate = bitrate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_ips.is_empty() {
            return Err(Error::Config("at least one listen ip is required".into()));
        }
        if !self.enable_udp && !self.enable_tcp {
            return Err(Error::Config("udp and tcp are both disabled".into()));
        }
        if self.minimum_available_outgoing_bitrate > self.initial_available_outgoing_bitrate {
            return Err(Error::Config(
                "minimum outgoing bitrate exceeds the initial outgoing bitrate".into(),
            ));
        }
        if self.max_incoming_bitrate == 0 {
            return Err(Error::Config("max_incoming_bitrate must be positive".into()));
        }
        Ok(())
    }
}
