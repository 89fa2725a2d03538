//! Engine configuration as delivered by the host.
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::SUPPORTED_FAMILY;
use crate::session::{Backoff, KeepalivePolicy, SessionConfig, REFRESH_DELAY};

pub const DEFAULT_DEVICE_PORT: u16 = 5959;
pub const DEFAULT_LISTEN_PORT: u16 = 5999;
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device ip address not set")]
    MissingDeviceIp,
    #[error("invalid device ip address {0:?}")]
    InvalidDeviceIp(String),
    #[error("invalid listen host {0:?}")]
    InvalidListenHost(String),
    #[error("poll interval {0}s is below the 10s minimum")]
    PollIntervalTooShort(u64),
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_device_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_poll_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_backoff_initial() -> u64 {
    60
}

fn default_backoff_max() -> u64 {
    7200
}

fn default_backoff_multiplier() -> u32 {
    4
}

fn default_poll_retries() -> u32 {
    3
}

fn default_handshake_timeout() -> Option<u64> {
    Some(60)
}

fn default_family() -> String {
    SUPPORTED_FAMILY.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default, alias = "optIp")]
    pub device_ip: String,
    #[serde(default = "default_device_port")]
    pub device_port: u16,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password_unicode_escaped: bool,
    #[serde(default = "default_poll_interval", alias = "optPollTime")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default = "default_poll_retries")]
    pub poll_retries: u32,
    /// `null` waits for the device's dial-back indefinitely.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: Option<u64>,
    #[serde(default = "default_family")]
    pub supported_family: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_ip: String::new(),
            device_port: default_device_port(),
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            password: String::new(),
            password_unicode_escaped: false,
            poll_interval_secs: default_poll_interval(),
            request_timeout_ms: default_request_timeout(),
            backoff_initial_secs: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            backoff_multiplier: default_backoff_multiplier(),
            poll_retries: default_poll_retries(),
            handshake_timeout_secs: default_handshake_timeout(),
            supported_family: default_family(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device_addr()?;
        self.listen_addr()?;
        if self.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            return Err(ConfigError::PollIntervalTooShort(self.poll_interval_secs));
        }
        Ok(())
    }

    pub fn device_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self.device_ip.trim();
        if ip.is_empty() {
            return Err(ConfigError::MissingDeviceIp);
        }
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| ConfigError::InvalidDeviceIp(self.device_ip.clone()))?;
        Ok(SocketAddr::new(ip, self.device_port))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .listen_host
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidListenHost(self.listen_host.clone()))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Session settings; `handoff_port` is the port the device will dial back to.
    pub fn session_config(&self, handoff_port: u16) -> SessionConfig {
        let poll_interval = self.poll_interval();
        SessionConfig {
            password: self.password.clone(),
            password_unicode_escaped: self.password_unicode_escaped,
            handoff_port,
            poll_interval,
            keepalive: KeepalivePolicy::for_poll_interval(poll_interval),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            backoff: Backoff::new(
                Duration::from_secs(self.backoff_initial_secs),
                Duration::from_secs(self.backoff_max_secs),
                self.backoff_multiplier,
            ),
            poll_retries: self.poll_retries.max(1),
            handshake_timeout: self.handshake_timeout_secs.map(Duration::from_secs),
            supported_family: self.supported_family.clone(),
            refresh_delay: REFRESH_DELAY,
        }
    }
}
