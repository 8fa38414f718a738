//! Dashboard telemetry for the supervised drive.
//!
//! The reporter samples a [`DeviceSnapshot`] together with the current
//! [`SupervisorState`] and forwards one scalar per [`TelemetryChannel`] to a
//! [`TelemetrySink`]. Publishing is fire-and-forget: a failing channel is counted and
//! logged, never returned to the caller.

use crate::error::TelemetryError;
use crate::status::DeviceSnapshot;
use crate::supervisor::SupervisorState;
use core::fmt::Write;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub const FRAME_BROADCAST_CAPACITY: usize = 64;
const CSV_LINE_CAPACITY: usize = 160;

pub const CSV_HEADER: &str = "timestamp_ms,state,status_word,run_state,actual_position,\
                              demand_position,demand_current,model_temp,real_temp,\
                              motor_voltage,power_loss";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryChannel {
    StatusWord,
    RunState,
    StateCode,
    StateLabel,
    ActualPosition,
    DemandPosition,
    DemandCurrent,
    ModelTemp,
    RealTemp,
    MotorVoltage,
    PowerLoss,
}

impl TelemetryChannel {
    /// Reporting order of a frame.
    pub const ALL: [TelemetryChannel; 11] = [
        TelemetryChannel::StatusWord,
        TelemetryChannel::RunState,
        TelemetryChannel::StateCode,
        TelemetryChannel::StateLabel,
        TelemetryChannel::ActualPosition,
        TelemetryChannel::DemandPosition,
        TelemetryChannel::DemandCurrent,
        TelemetryChannel::ModelTemp,
        TelemetryChannel::RealTemp,
        TelemetryChannel::MotorVoltage,
        TelemetryChannel::PowerLoss,
    ];

    /// Dashboard pin the channel is mapped to.
    pub fn id(self) -> u8 {
        match self {
            TelemetryChannel::StatusWord => 0,
            TelemetryChannel::RunState => 1,
            TelemetryChannel::StateLabel => 2,
            TelemetryChannel::StateCode => 3,
            TelemetryChannel::ActualPosition => 11,
            TelemetryChannel::DemandCurrent => 12,
            TelemetryChannel::DemandPosition => 13,
            TelemetryChannel::ModelTemp => 14,
            TelemetryChannel::RealTemp => 15,
            TelemetryChannel::MotorVoltage => 16,
            TelemetryChannel::PowerLoss => 17,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TelemetryChannel::StatusWord => "status_word",
            TelemetryChannel::RunState => "run_state",
            TelemetryChannel::StateCode => "state_code",
            TelemetryChannel::StateLabel => "state",
            TelemetryChannel::ActualPosition => "actual_position",
            TelemetryChannel::DemandPosition => "demand_position",
            TelemetryChannel::DemandCurrent => "demand_current",
            TelemetryChannel::ModelTemp => "model_temp",
            TelemetryChannel::RealTemp => "real_temp",
            TelemetryChannel::MotorVoltage => "motor_voltage",
            TelemetryChannel::PowerLoss => "power_loss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TelemetryValue {
    Float(f32),
    Text(&'static str),
}

impl core::fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TelemetryValue::Float(value) => write!(f, "{}", value),
            TelemetryValue::Text(text) => f.write_str(text),
        }
    }
}

/// Destination of reported values.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, channel: TelemetryChannel, value: TelemetryValue) -> Result<(), TelemetryError>;

    /// Called once per report after every channel was published.
    fn publish_frame(&self, _frame: &TelemetryFrame) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Writes every channel as a `debug` event, and a one-line frame summary at `info`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn publish(&self, channel: TelemetryChannel, value: TelemetryValue) -> Result<(), TelemetryError> {
        debug!("telemetry V{} {} = {}", channel.id(), channel.name(), value);
        Ok(())
    }

    fn publish_frame(&self, frame: &TelemetryFrame) -> Result<(), TelemetryError> {
        info!(
            "📡 {} status={:#06x} pos={} temp={}",
            frame.state.label(),
            frame.status_word,
            frame.actual_position,
            frame.real_temp
        );
        Ok(())
    }
}

/// Fans complete frames out to any number of subscribers.
///
/// Individual channels are dropped; only whole frames are broadcast. Publishing fails
/// with [`TelemetryError::SinkClosed`] while nobody is subscribed.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<TelemetryFrame>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<TelemetryFrame>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.sender.subscribe()
    }
}

impl TelemetrySink for BroadcastSink {
    fn publish(&self, _channel: TelemetryChannel, _value: TelemetryValue) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn publish_frame(&self, frame: &TelemetryFrame) -> Result<(), TelemetryError> {
        self.sender
            .send(frame.clone())
            .map(|_| ())
            .map_err(|_| TelemetryError::SinkClosed)
    }
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for std::sync::Arc<T> {
    fn publish(&self, channel: TelemetryChannel, value: TelemetryValue) -> Result<(), TelemetryError> {
        (**self).publish(channel, value)
    }

    fn publish_frame(&self, frame: &TelemetryFrame) -> Result<(), TelemetryError> {
        (**self).publish_frame(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub timestamp_ms: u64,
    pub state: SupervisorState,
    pub status_word: u16,
    pub run_state: u8,
    pub actual_position: u16,
    pub demand_position: u16,
    pub demand_current: u16,
    pub model_temp: u16,
    pub real_temp: u16,
    pub motor_voltage: u16,
    pub power_loss: u16,
}

impl TelemetryFrame {
    pub fn new(timestamp_ms: u64, snapshot: &DeviceSnapshot, state: SupervisorState) -> Self {
        Self {
            timestamp_ms,
            state,
            status_word: snapshot.status_word,
            run_state: snapshot.run_state(),
            actual_position: snapshot.actual_position,
            demand_position: snapshot.demand_position,
            demand_current: snapshot.demand_current,
            model_temp: snapshot.model_temp,
            real_temp: snapshot.real_temp,
            motor_voltage: snapshot.motor_voltage,
            power_loss: snapshot.power_loss,
        }
    }

    pub fn value(&self, channel: TelemetryChannel) -> TelemetryValue {
        let float = |v: u16| TelemetryValue::Float(f32::from(v));
        match channel {
            TelemetryChannel::StatusWord => float(self.status_word),
            TelemetryChannel::RunState => TelemetryValue::Float(f32::from(self.run_state)),
            TelemetryChannel::StateCode => TelemetryValue::Float(f32::from(self.state.code())),
            TelemetryChannel::StateLabel => TelemetryValue::Text(self.state.label()),
            TelemetryChannel::ActualPosition => float(self.actual_position),
            TelemetryChannel::DemandPosition => float(self.demand_position),
            TelemetryChannel::DemandCurrent => float(self.demand_current),
            TelemetryChannel::ModelTemp => float(self.model_temp),
            TelemetryChannel::RealTemp => float(self.real_temp),
            TelemetryChannel::MotorVoltage => float(self.motor_voltage),
            TelemetryChannel::PowerLoss => float(self.power_loss),
        }
    }

    pub fn to_csv_line(&self) -> Result<heapless::String<CSV_LINE_CAPACITY>, core::fmt::Error> {
        let mut line = heapless::String::new();
        write!(
            line,
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.timestamp_ms,
            self.state.label(),
            self.status_word,
            self.run_state,
            self.actual_position,
            self.demand_position,
            self.demand_current,
            self.model_temp,
            self.real_temp,
            self.motor_voltage,
            self.power_loss
        )?;
        Ok(line)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReporterStats {
    pub frames_reported: u32,
    pub values_published: u32,
    pub failed_publishes: u32,
}

#[derive(Debug, Default)]
pub struct TelemetryReporter {
    stats: ReporterStats,
    last_frame: Option<TelemetryFrame>,
}

impl TelemetryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &ReporterStats {
        &self.stats
    }

    pub fn last_frame(&self) -> Option<&TelemetryFrame> {
        self.last_frame.as_ref()
    }

    /// Publishes every channel of one frame. Sink failures are counted and skipped.
    pub fn report<S: TelemetrySink + ?Sized>(
        &mut self,
        timestamp_ms: u64,
        snapshot: &DeviceSnapshot,
        state: SupervisorState,
        sink: &S,
    ) -> TelemetryFrame {
        let frame = TelemetryFrame::new(timestamp_ms, snapshot, state);

        for channel in TelemetryChannel::ALL {
            match sink.publish(channel, frame.value(channel)) {
                Ok(()) => self.stats.values_published = self.stats.values_published.saturating_add(1),
                Err(e) => self.record_failure(channel.name(), e),
            }
        }
        if let Err(e) = sink.publish_frame(&frame) {
            self.record_failure("frame", e);
        }

        self.stats.frames_reported = self.stats.frames_reported.saturating_add(1);
        self.last_frame = Some(frame.clone());
        frame
    }

    fn record_failure(&mut self, what: &str, error: TelemetryError) {
        self.stats.failed_publishes = self.stats.failed_publishes.saturating_add(1);
        debug!("telemetry publish of {} dropped: {}", what, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            status_word: 0x0C37,
            run_word: 0x0812,
            actual_position: 500,
            real_temp: 31,
            ..Default::default()
        }
    }

    #[test]
    fn test_channel_ids_are_unique() {
        let mut ids: heapless::Vec<u8, 16> = TelemetryChannel::ALL.iter().map(|c| c.id()).collect();
        ids.sort_unstable();
        assert!(ids.windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn test_frame_carries_run_state_and_label() {
        let frame = TelemetryFrame::new(10, &sample_snapshot(), SupervisorState::Moving);
        assert_eq!(frame.run_state, 0x08);
        assert_eq!(frame.value(TelemetryChannel::StateLabel), TelemetryValue::Text("MOVING"));
        assert_eq!(frame.value(TelemetryChannel::ActualPosition), TelemetryValue::Float(500.0));
    }

    #[test]
    fn test_csv_line_matches_header_columns() {
        let frame = TelemetryFrame::new(250, &sample_snapshot(), SupervisorState::ActiveIdle);
        let line = frame.to_csv_line().unwrap();
        assert!(line.starts_with("250,ACTIVE_IDLE,3127,8,500"));
        assert_eq!(line.split(',').count(), CSV_HEADER.split(',').count());
    }

    #[test]
    fn test_broadcast_without_subscribers_is_counted_not_raised() {
        let (sink, receiver) = BroadcastSink::new(4);
        drop(receiver);
        let mut reporter = TelemetryReporter::new();
        reporter.report(0, &sample_snapshot(), SupervisorState::Disabled, &sink);
        assert_eq!(reporter.stats().frames_reported, 1);
        assert_eq!(reporter.stats().failed_publishes, 1);
    }
}
