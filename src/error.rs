use crate::bus::EntryId;
use thiserror::Error;

/// Failures reported by a [`FieldBus`](crate::bus::FieldBus) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("dictionary entry {entry}:{sub:#04x} is not mapped")]
    EntryNotMapped { entry: EntryId, sub: u8 },
    #[error("fieldbus link is down")]
    LinkDown,
    #[error("object dictionary lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("telemetry sink closed")]
    SinkClosed,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
