use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::serial::interface::{BAUD_RATE, ROTATOR_PID, ROTATOR_VID};

// Maximum rotator count handed out by one scan
const MAX_DEVICES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Pacing and timeout constants of the rotator protocol.
///
/// The delays pace the rotator's own command loop; lowering them on a fast
/// host does not make the instrument process commands faster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait before every command write
    pub command_delay_ms: u64,
    /// Wait after each unanswered handshake probe
    pub handshake_retry_delay_ms: u64,
    pub handshake_attempts: u32,
    /// Timeout for one status or position frame
    pub frame_timeout_ms: u64,
    /// Timeout for the first completion frame of a move
    pub move_timeout_ms: u64,
    /// Wait before sending the return half of an overshoot
    pub overshoot_return_delay_ms: u64,
    /// Wait before flushing stale input ahead of a move
    pub move_settle_delay_ms: u64,
}

impl TimingConfig {
    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn handshake_retry_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_delay_ms)
    }

    pub fn overshoot_return_delay(&self) -> Duration {
        Duration::from_millis(self.overshoot_return_delay_ms)
    }

    pub fn move_settle_delay(&self) -> Duration {
        Duration::from_millis(self.move_settle_delay_ms)
    }

    /// No pacing delays; timeouts unchanged
    pub fn without_delays(mut self) -> Self {
        self.command_delay_ms = 0;
        self.handshake_retry_delay_ms = 0;
        self.overshoot_return_delay_ms = 0;
        self.move_settle_delay_ms = 0;
        self
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_delay_ms: 100,
            handshake_retry_delay_ms: 200,
            handshake_attempts: 5,
            frame_timeout_ms: 3000,
            move_timeout_ms: 90_000,
            overshoot_return_delay_ms: 50,
            move_settle_delay_ms: 50,
        }
    }
}

/// Driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorSettings {
    pub baud_rate: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub max_devices: usize,
    pub timing: TimingConfig,
}

impl RotatorSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let settings = Self::from_json_str(&text)?;
        log::info!("Loaded rotator settings from {}", path.as_ref().display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".to_string()));
        }
        if self.timing.handshake_attempts == 0 {
            return Err(ConfigError::Invalid("handshake_attempts must be at least 1".to_string()));
        }
        if self.max_devices == 0 {
            return Err(ConfigError::Invalid("max_devices must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for RotatorSettings {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            vendor_id: ROTATOR_VID,
            product_id: ROTATOR_PID,
            max_devices: MAX_DEVICES,
            timing: TimingConfig::default(),
        }
    }
}
