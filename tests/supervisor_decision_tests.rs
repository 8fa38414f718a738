use linmot_supervisor::config::DwellTimings;
use linmot_supervisor::control::ControlWord;
use linmot_supervisor::status::{error_code, DeviceSnapshot, StatusWord};
use linmot_supervisor::supervisor::*;
use std::time::Duration;

fn snapshot(status: StatusWord) -> DeviceSnapshot {
    DeviceSnapshot {
        status_word: status.bits(),
        ..Default::default()
    }
}

fn faulted(code: u16) -> DeviceSnapshot {
    DeviceSnapshot {
        status_word: StatusWord::ERROR.bits(),
        error_word: code,
        ..Default::default()
    }
}

fn ready() -> StatusWord {
    StatusWord::OPERATION_ENABLED | StatusWord::SWITCH_ON | StatusWord::HOMED
}

const ALL_STATES: [SupervisorState; 7] = [
    SupervisorState::Disabled,
    SupervisorState::Enabling,
    SupervisorState::Homing,
    SupervisorState::ActiveIdle,
    SupervisorState::Moving,
    SupervisorState::FaultRecoverable,
    SupervisorState::FaultUnknown,
];

#[test]
fn test_recoverable_errors_acknowledge_from_every_live_state() {
    for state in ALL_STATES.iter().copied().filter(|s| *s != SupervisorState::FaultUnknown) {
        for code in error_code::RECOVERABLE {
            let decision = decide_action(state, &faulted(code));
            assert_eq!(decision.state, SupervisorState::FaultRecoverable);
            assert_eq!(decision.action, Action::AcknowledgeError { code });
            assert_eq!(decision.final_state(), SupervisorState::FaultRecoverable);
        }
    }
}

#[test]
fn test_recoverable_error_never_dispatches_motion() {
    // Error bit wins even when the rest of the status says "ready to move"
    let mut snapshot = snapshot(ready() | StatusWord::ERROR);
    snapshot.error_word = error_code::CAN_BUS_GUARD_TIMEOUT;

    let decision = decide_action(SupervisorState::ActiveIdle, &snapshot);
    assert_eq!(decision.state, SupervisorState::FaultRecoverable);
    let plan = decision.action.plan(&DwellTimings::default());
    assert!(!plan.contains(&Step::DispatchMove));
}

#[test]
fn test_unknown_error_backs_off() {
    let decision = decide_action(SupervisorState::Moving, &faulted(0x0F12));
    assert_eq!(decision.state, SupervisorState::FaultUnknown);
    assert_eq!(decision.action, Action::Backoff { code: 0x0F12 });

    let plan = decision.action.plan(&DwellTimings::default());
    assert_eq!(plan.as_slice(), &[Step::Dwell(Duration::from_millis(5000))]);
}

#[test]
fn test_error_word_without_error_bit_is_ignored() {
    let mut snapshot = snapshot(ready());
    snapshot.error_word = 0x0F12;
    let decision = decide_action(SupervisorState::ActiveIdle, &snapshot);
    assert_eq!(decision.action, Action::DispatchMove);
}

#[test]
fn test_fault_unknown_is_sticky() {
    // Even a perfectly healthy drive does not bring the supervisor out of FAULT_UNKNOWN
    for status in [ready(), StatusWord::empty(), StatusWord::ERROR] {
        let decision = decide_action(SupervisorState::FaultUnknown, &snapshot(status));
        assert_eq!(decision.state, SupervisorState::FaultUnknown);
        assert!(matches!(decision.action, Action::Backoff { .. }));
    }
}

#[test]
fn test_disabled_drive_toggles_enable() {
    for state in [SupervisorState::Disabled, SupervisorState::ActiveIdle, SupervisorState::FaultRecoverable] {
        let decision = decide_action(state, &snapshot(StatusWord::HOMED));
        assert_eq!(decision.state, SupervisorState::Enabling);
        assert_eq!(decision.action, Action::ToggleEnable);
    }

    let plan = Action::ToggleEnable.plan(&DwellTimings::default());
    assert_eq!(
        plan.as_slice(),
        &[
            Step::RemoveFlag(ControlWord::SWITCH_ON),
            Step::Dwell(Duration::from_millis(50)),
            Step::AddFlag(ControlWord::SWITCH_ON),
            Step::Dwell(Duration::from_millis(250)),
        ]
    );
}

#[test]
fn test_unhomed_drive_is_homed() {
    let decision = decide_action(
        SupervisorState::Enabling,
        &snapshot(StatusWord::OPERATION_ENABLED | StatusWord::SWITCH_ON),
    );
    assert_eq!(decision.state, SupervisorState::Homing);
    assert_eq!(decision.action, Action::Home);
    assert_eq!(decision.settles_to, Some(SupervisorState::ActiveIdle));

    let plan = Action::Home.plan(&DwellTimings::default());
    assert_eq!(plan[0], Step::AddFlag(ControlWord::HOME));
    assert_eq!(plan[2], Step::RemoveFlag(ControlWord::HOME));
}

#[test]
fn test_unhomed_but_moving_drive_waits() {
    let decision = decide_action(
        SupervisorState::Homing,
        &snapshot(StatusWord::OPERATION_ENABLED | StatusWord::MOTION_ACTIVE),
    );
    assert_eq!(decision.state, SupervisorState::Moving);
    assert_eq!(decision.action, Action::Idle);
}

#[test]
fn test_ready_drive_gets_a_move() {
    let decision = decide_action(SupervisorState::ActiveIdle, &snapshot(ready()));
    assert_eq!(decision.state, SupervisorState::ActiveIdle);
    assert_eq!(decision.action, Action::DispatchMove);
    assert_eq!(
        decision.action.plan(&DwellTimings::default()).first(),
        Some(&Step::DispatchMove)
    );
}

#[test]
fn test_moving_drive_is_left_alone() {
    let decision = decide_action(SupervisorState::ActiveIdle, &snapshot(ready() | StatusWord::MOTION_ACTIVE));
    assert_eq!(decision.state, SupervisorState::Moving);
    assert_eq!(decision.action, Action::Idle);
    assert!(decision.action.plan(&DwellTimings::default()).is_empty());
}

#[test]
fn test_acknowledge_pulse_uses_configured_dwell() {
    let dwell = DwellTimings {
        acknowledge_ms: 20,
        ..Default::default()
    };
    let plan = Action::AcknowledgeError { code: 0xCD }.plan(&dwell);
    assert_eq!(
        plan.as_slice(),
        &[
            Step::AddFlag(ControlWord::ERROR_ACKNOWLEDGE),
            Step::Dwell(Duration::from_millis(20)),
            Step::RemoveFlag(ControlWord::ERROR_ACKNOWLEDGE),
            Step::Dwell(Duration::from_millis(20)),
        ]
    );
}

#[test]
fn test_state_labels_and_codes() {
    let labels: Vec<&str> = ALL_STATES.iter().map(|s| s.label()).collect();
    assert_eq!(
        labels,
        ["DISABLED", "ENABLING", "HOMING", "ACTIVE_IDLE", "MOVING", "FAULT_RECOVERABLE", "FAULT_UNKNOWN"]
    );
    for (expected, state) in ALL_STATES.iter().enumerate() {
        assert_eq!(usize::from(state.code()), expected);
    }
    assert!(SupervisorState::FaultUnknown.is_fault());
    assert!(!SupervisorState::Moving.is_fault());
}
