use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Drive and cadence defaults from the production firmware
pub const DEFAULT_NODE_ID: u8 = 0x3F;
const MOTION_PERIOD_MS: u64 = 100;
const MONITOR_PERIOD_MS: u64 = 250;
const LINK_WAIT_MS: u64 = 250;
const LIVENESS_THRESHOLD_MS: u64 = 1000;

/// Blocking waits inside the supervisor's action sequences, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DwellTimings {
    /// Hold and release time of the error acknowledge pulse.
    pub acknowledge_ms: u64,
    /// Time with switch-on cleared before it is asserted again.
    pub enable_off_ms: u64,
    /// Time given to the drive to enable after switch-on is asserted.
    pub enable_on_ms: u64,
    /// How long the home flag stays asserted.
    pub home_hold_ms: u64,
    pub home_release_ms: u64,
    /// Backoff between evaluations while the drive reports an unknown error.
    pub fault_backoff_ms: u64,
    pub move_settle_ms: u64,
}

impl Default for DwellTimings {
    fn default() -> Self {
        Self {
            acknowledge_ms: 50,
            enable_off_ms: 50,
            enable_on_ms: 250,
            home_hold_ms: 5000,
            home_release_ms: 50,
            fault_backoff_ms: 5000,
            move_settle_ms: 100,
        }
    }
}

/// Fixed point-to-point profile used for every move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionProfile {
    pub set_point_a: u16,
    pub set_point_b: u16,
    pub max_velocity: u16,
    pub acceleration: u16,
    pub deceleration: u16,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            set_point_a: 0x01F4,
            set_point_b: 0x03E8,
            max_velocity: 0x03E8 * 5,
            acceleration: 0x00FF,
            deceleration: 0x00FF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub node_id: u8,
    pub motion_period_ms: u64,
    pub monitor_period_ms: u64,
    pub link_wait_ms: u64,
    pub liveness_threshold_ms: u64,
    pub dwell: DwellTimings,
    pub profile: MotionProfile,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            node_id: DEFAULT_NODE_ID,
            motion_period_ms: MOTION_PERIOD_MS,
            monitor_period_ms: MONITOR_PERIOD_MS,
            link_wait_ms: LINK_WAIT_MS,
            liveness_threshold_ms: LIVENESS_THRESHOLD_MS,
            dwell: DwellTimings::default(),
            profile: MotionProfile::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SupervisorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 || self.node_id > 0x7F {
            return Err(ConfigError::Invalid {
                field: "node_id",
                reason: "CANopen node ids are 1..=127",
            });
        }
        if self.motion_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "motion_period_ms",
                reason: "must be greater than zero",
            });
        }
        if self.monitor_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor_period_ms",
                reason: "must be greater than zero",
            });
        }
        if self.link_wait_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "link_wait_ms",
                reason: "must be greater than zero",
            });
        }
        if self.liveness_threshold_ms < self.monitor_period_ms {
            return Err(ConfigError::Invalid {
                field: "liveness_threshold_ms",
                reason: "must not be shorter than the monitor period",
            });
        }
        if self.profile.set_point_a == self.profile.set_point_b {
            return Err(ConfigError::Invalid {
                field: "profile",
                reason: "set points must differ",
            });
        }
        if self.profile.max_velocity == 0 {
            return Err(ConfigError::Invalid {
                field: "profile.max_velocity",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn motion_period(&self) -> Duration {
        Duration::from_millis(self.motion_period_ms)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }

    pub fn link_wait(&self) -> Duration {
        Duration::from_millis(self.link_wait_ms)
    }
}
