//! Timing and buffering knobs for the protocol engine.

use std::path::Path;
use std::time::Duration;

use config::{Config, File};
use serde::{Deserialize, Serialize};

use seadaq_core::{DriverResult, InstrumentError};

/// Engine settings. Every field has a default, so a settings file only
/// needs the keys it changes; durations use humantime strings
/// (`"250ms"`, `"10s"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// How often the command engine re-inspects the response buffer
    /// while waiting for a prompt.
    #[serde(with = "humantime_serde")]
    pub response_poll_interval: Duration,
    /// Command timeout when a command spec does not carry its own.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Break-and-inspect rounds before discovery gives up.
    pub discovery_attempts: u32,
    /// How long each discovery round watches for a recognizable
    /// response.
    #[serde(with = "humantime_serde")]
    pub discovery_delay: Duration,
    /// Pause between a wakeup write and the command that follows it.
    #[serde(with = "humantime_serde")]
    pub wakeup_delay: Duration,
    /// Cap on unframed bytes buffered per session, for the chunker and
    /// the response buffer alike.
    pub max_frame_buffer: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            response_poll_interval: Duration::from_millis(100),
            default_timeout: Duration::from_secs(10),
            discovery_attempts: 2,
            discovery_delay: Duration::from_millis(500),
            wakeup_delay: Duration::from_millis(200),
            max_frame_buffer: 64 * 1024,
        }
    }
}

impl ProtocolSettings {
    pub fn validate(&self) -> DriverResult<()> {
        if self.response_poll_interval.is_zero() {
            return Err(InstrumentError::Configuration(
                "response_poll_interval must be non-zero".into(),
            ));
        }
        if self.discovery_attempts == 0 {
            return Err(InstrumentError::Configuration(
                "discovery_attempts must be at least 1".into(),
            ));
        }
        if self.max_frame_buffer == 0 {
            return Err(InstrumentError::Configuration(
                "max_frame_buffer must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Load from a TOML file, filling unset keys with defaults.
    pub fn load(path: &Path) -> DriverResult<Self> {
        let cfg = Config::builder()
            .add_source(File::from(path))
            .build()
            .map_err(|e| {
                InstrumentError::Configuration(format!("cannot read settings file: {e}"))
            })?;
        let settings: Self = cfg
            .try_deserialize()
            .map_err(|e| InstrumentError::Configuration(format!("bad settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }
}
