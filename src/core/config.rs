//! config.rs
//! Hub configuration: stream endpoints, worker periods, shutdown budget.
//!
//! Defaults are the standard league multicast groups, so a zero-config hub
//! listens where the field network sends. A JSON file can override any field;
//! durations are given there in milliseconds.

use serde::Deserialize;
use std::{fs, net::Ipv4Addr, path::Path, time::Duration};

use crate::core::error::{HubError, Result};

pub const DEFAULT_VISION_ADDR: Ipv4Addr = Ipv4Addr::new(224, 5, 23, 2);
pub const DEFAULT_VISION_PORT: u16 = 10006;
pub const DEFAULT_REFEREE_ADDR: Ipv4Addr = Ipv4Addr::new(224, 5, 23, 1);
pub const DEFAULT_REFEREE_PORT: u16 = 10003;
pub const DEFAULT_TRACKER_ADDR: Ipv4Addr = Ipv4Addr::new(224, 5, 23, 2);
pub const DEFAULT_TRACKER_PORT: u16 = 10010;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub vision_addr: Ipv4Addr,
    pub vision_port: u16,
    pub referee_addr: Ipv4Addr,
    pub referee_port: u16,
    pub tracker_addr: Ipv4Addr,
    pub tracker_port: u16,

    /// Processor tick period.
    #[serde(with = "millis")]
    pub processor_tick: Duration,
    /// Frame period of the built-in vision simulator at scaling 1.0.
    #[serde(with = "millis")]
    pub simulator_period: Duration,
    #[serde(with = "millis")]
    pub interface_poll: Duration,
    /// Upper bound on how long a receiver blocks before re-checking its control inbox.
    #[serde(with = "millis")]
    pub receiver_read_timeout: Duration,
    /// Budget per worker when joining on stop; stragglers are detached.
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,

    /// Pin the processor thread to this core.
    pub pin_processor_core: Option<usize>,
    /// Start with the simulator as the vision source.
    pub simulator_only: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            vision_addr: DEFAULT_VISION_ADDR,
            vision_port: DEFAULT_VISION_PORT,
            referee_addr: DEFAULT_REFEREE_ADDR,
            referee_port: DEFAULT_REFEREE_PORT,
            tracker_addr: DEFAULT_TRACKER_ADDR,
            tracker_port: DEFAULT_TRACKER_PORT,
            processor_tick: Duration::from_millis(10),
            simulator_period: Duration::from_millis(16),
            interface_poll: Duration::from_secs(1),
            receiver_read_timeout: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(2),
            pin_processor_core: None,
            simulator_only: false,
        }
    }
}

impl HubConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: HubConfig = serde_json::from_str(&raw)
            .map_err(|e| HubError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (what, port) in [
            ("vision", self.vision_port),
            ("referee", self.referee_port),
            ("tracker", self.tracker_port),
        ] {
            if port == 0 {
                return Err(HubError::InvalidPort { what, value: 0 });
            }
        }
        for (name, period) in [
            ("processor_tick", self.processor_tick),
            ("simulator_period", self.simulator_period),
            ("interface_poll", self.interface_poll),
            ("receiver_read_timeout", self.receiver_read_timeout),
        ] {
            if period.is_zero() {
                return Err(HubError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

/// Checks a port coming from an untyped boundary (CLI, config UI).
pub fn validate_port(value: i64, what: &'static str) -> Result<u16> {
    if (1..=u16::MAX as i64).contains(&value) {
        Ok(value as u16)
    } else {
        Err(HubError::InvalidPort { what, value })
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
