use linmot_supervisor::error::TelemetryError;
use linmot_supervisor::status::DeviceSnapshot;
use linmot_supervisor::telemetry::*;
use linmot_supervisor::SupervisorState;
use std::sync::Mutex;

#[derive(Default)]
struct RecordingSink {
    values: Mutex<Vec<(TelemetryChannel, TelemetryValue)>>,
    frames: Mutex<Vec<TelemetryFrame>>,
}

impl TelemetrySink for RecordingSink {
    fn publish(&self, channel: TelemetryChannel, value: TelemetryValue) -> Result<(), TelemetryError> {
        self.values.lock().unwrap().push((channel, value));
        Ok(())
    }

    fn publish_frame(&self, frame: &TelemetryFrame) -> Result<(), TelemetryError> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

/// Drops every temperature channel, accepts the rest.
struct FlakySink;

impl TelemetrySink for FlakySink {
    fn publish(&self, channel: TelemetryChannel, _value: TelemetryValue) -> Result<(), TelemetryError> {
        match channel {
            TelemetryChannel::ModelTemp | TelemetryChannel::RealTemp => Err(TelemetryError::SinkClosed),
            _ => Ok(()),
        }
    }
}

fn snapshot() -> DeviceSnapshot {
    DeviceSnapshot {
        status_word: 0x2C37,
        run_word: 0x0800,
        error_word: 0,
        warn_word: 0,
        actual_position: 0x0123,
        demand_position: 0x03E8,
        demand_current: 120,
        model_temp: 310,
        real_temp: 295,
        motor_voltage: 720,
        power_loss: 30,
    }
}

#[test]
fn test_report_publishes_every_channel_in_order() {
    let sink = RecordingSink::default();
    let mut reporter = TelemetryReporter::new();

    reporter.report(1250, &snapshot(), SupervisorState::Moving, &sink);

    let values = sink.values.lock().unwrap();
    let channels: Vec<TelemetryChannel> = values.iter().map(|(c, _)| *c).collect();
    assert_eq!(channels, TelemetryChannel::ALL.to_vec());
    assert_eq!(values[0].1, TelemetryValue::Float(f32::from(0x2C37u16)));
    assert_eq!(values[1].1, TelemetryValue::Float(8.0));
    assert_eq!(values[2].1, TelemetryValue::Float(4.0));
    assert_eq!(values[3].1, TelemetryValue::Text("MOVING"));
    assert_eq!(values[10].1, TelemetryValue::Float(30.0));
    assert_eq!(sink.frames.lock().unwrap().len(), 1);
}

#[test]
fn test_frame_mirrors_snapshot() {
    let sink = RecordingSink::default();
    let mut reporter = TelemetryReporter::new();

    let frame = reporter.report(500, &snapshot(), SupervisorState::FaultRecoverable, &sink);

    assert_eq!(frame.timestamp_ms, 500);
    assert_eq!(frame.state, SupervisorState::FaultRecoverable);
    assert_eq!(frame.run_state, 0x08);
    assert_eq!(frame.demand_position, 0x03E8);
    assert_eq!(frame.motor_voltage, 720);
    assert_eq!(reporter.last_frame(), Some(&frame));
}

#[test]
fn test_failed_publishes_are_counted_not_escalated() {
    let mut reporter = TelemetryReporter::new();

    reporter.report(0, &snapshot(), SupervisorState::ActiveIdle, &FlakySink);
    reporter.report(250, &snapshot(), SupervisorState::ActiveIdle, &FlakySink);

    let stats = reporter.stats();
    assert_eq!(stats.frames_reported, 2);
    assert_eq!(stats.failed_publishes, 4);
    assert_eq!(stats.values_published, 18);
}

#[test]
fn test_frame_round_trips_through_json() {
    let frame = TelemetryFrame::new(42, &snapshot(), SupervisorState::Homing);
    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains("\"state\":\"Homing\""));
    let decoded: TelemetryFrame = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, frame);
}

#[tokio::test]
async fn test_broadcast_sink_delivers_frames() {
    let (sink, mut receiver) = BroadcastSink::new(FRAME_BROADCAST_CAPACITY);
    let mut second = sink.subscribe();
    let mut reporter = TelemetryReporter::new();

    reporter.report(100, &snapshot(), SupervisorState::ActiveIdle, &sink);

    let frame = receiver.recv().await.unwrap();
    assert_eq!(frame.actual_position, 0x0123);
    assert_eq!(second.recv().await.unwrap(), frame);
    assert_eq!(reporter.stats().failed_publishes, 0);
}

#[test]
fn test_tracing_sink_accepts_everything() {
    let mut reporter = TelemetryReporter::new();
    reporter.report(0, &snapshot(), SupervisorState::Disabled, &TracingSink);
    assert_eq!(reporter.stats().failed_publishes, 0);
    assert_eq!(reporter.stats().values_published, 11);
}
