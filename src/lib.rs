//! # LinMot Drive Supervisor
//!
//! Supervisory control for a single LinMot linear-motor drive on a CANopen link: brings
//! the drive from power-on through enable and homing into repeated point-to-point moves,
//! acknowledges the faults it knows how to clear, watches the cyclic status frame for
//! liveness and reports live status to a dashboard.
//!
//! ## Features
//!
//! - **Motion supervisor**: pure per-tick decision over the drive status word, executed as
//!   a plan of control-word edges and dwells
//! - **Heartbeat monitor**: lock-free liveness timestamp with NMT re-sync on timeout
//! - **Command encoder**: "go to position" command with a 4-bit rolling counter
//! - **Telemetry reporter**: fixed channel set, tracing and broadcast sinks, CSV export
//! - **Simulated drive**: in-process [`FieldBus`] model with fault and outage injection
//!
//! ## Quick Start
//!
//! ```rust
//! use linmot_supervisor::status::{DeviceSnapshot, StatusWord};
//! use linmot_supervisor::supervisor::{decide_action, Action, SupervisorState};
//!
//! let snapshot = DeviceSnapshot {
//!     status_word: (StatusWord::OPERATION_ENABLED | StatusWord::SWITCH_ON | StatusWord::HOMED).bits(),
//!     ..Default::default()
//! };
//!
//! let decision = decide_action(SupervisorState::Homing, &snapshot);
//! assert_eq!(decision.state, SupervisorState::ActiveIdle);
//! assert_eq!(decision.action, Action::DispatchMove);
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Fieldbus access contract and dictionary layout
//! - [`status`] / [`control`] - Drive status and control words
//! - [`supervisor`] - Motion supervisor state machine
//! - [`heartbeat`] - Status frame liveness and NMT re-sync
//! - [`command`] - Motion command encoding
//! - [`telemetry`] - Dashboard reporting
//! - [`session`] - Task wiring for a supervisory session
//! - [`sim`] - Simulated drive

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod bus;
pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod heartbeat;
pub mod session;
pub mod sim;
pub mod status;
pub mod supervisor;
pub mod telemetry;

// Re-export main public types for convenience
pub use bus::{EntryId, FieldBus, NmtCommand};
pub use config::SupervisorConfig;
pub use error::{BusError, SupervisorError};
pub use heartbeat::{HeartbeatMonitor, LivenessTracker};
pub use session::{Session, SessionHandle};
pub use sim::SimulatedDrive;
pub use supervisor::{MotionSupervisor, SupervisorState};
pub use telemetry::{TelemetryReporter, TelemetrySink};
