//! Summary-state lifecycle against the simulator.

use super::harness::{announced_states, next_notice, wait_for_ack, wait_for_state, TestHarness};
use crate::error::CoreError;
use crate::subscribers::EventNotice;
use attcpip_protocol::{CommandStatus, Parameters, SummaryState};
use attcpip_simulator::{CommandResponse, SimulatorOptions};

#[tokio::test]
async fn test_full_lifecycle_round_trip() {
    let h = TestHarness::start().await;

    h.session.start().await.unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Disabled);
    h.session.enable().await.unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Enabled);
    h.session.disable().await.unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Disabled);
    h.session.standby().await.unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Standby);

    assert_eq!(h.sim.summary_state(), SummaryState::Standby);
    let names: Vec<String> = h
        .sim
        .received_commands()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["start", "enable", "disable", "standby"]);
    assert_eq!(h.session.pending_count(), 0);
}

#[tokio::test]
async fn test_transitions_announced_to_subscribers() {
    let h = TestHarness::start().await;
    let mut events = h.session.subscribe_events();

    h.enable().await;

    let mut states = Vec::new();
    for _ in 0..2 {
        states.extend(announced_states(&[next_notice(&mut events).await]));
    }
    assert_eq!(states, vec![SummaryState::Disabled, SummaryState::Enabled]);
    assert!(events.try_recv().is_none(), "remote confirmations are not forwarded");
}

#[tokio::test]
async fn test_unexpected_remote_state_faults_with_cause() {
    let h = TestHarness::start().await;
    let mut events = h.session.subscribe_events();
    h.enable().await;

    h.sim.emit_summary_state(SummaryState::Standby).unwrap();
    assert!(wait_for_state(&h.session, SummaryState::Fault).await);
    assert_eq!(
        h.session.fault_cause().as_deref(),
        Some("unexpected remote state: STANDBY while ENABLED")
    );
    assert_eq!(h.session.remote_state(), Some(SummaryState::Standby));

    let mut states = Vec::new();
    for _ in 0..3 {
        let notice = next_notice(&mut events).await;
        if let EventNotice::Event(event) = &notice {
            if event.reported_summary_state() == Some(SummaryState::Fault) {
                assert_eq!(
                    event.str_parameter("cause"),
                    Some("unexpected remote state: STANDBY while ENABLED")
                );
            }
        }
        states.extend(announced_states(&[notice]));
    }
    assert_eq!(
        states,
        vec![SummaryState::Disabled, SummaryState::Enabled, SummaryState::Fault]
    );

    // Recover: the controller reports FAULT, then accepts clearFault.
    h.sim.emit_summary_state(SummaryState::Fault).unwrap();
    h.session.clear_fault().await.unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Standby);
    assert_eq!(h.session.fault_cause(), None);
}

#[tokio::test]
async fn test_controller_faulting_on_enable() {
    let h = TestHarness::start_with(SimulatorOptions {
        go_to_fault_on_enable: true,
        ..SimulatorOptions::default()
    })
    .await;

    h.session.start().await.unwrap();
    h.session.enable().await.unwrap();

    assert!(wait_for_state(&h.session, SummaryState::Fault).await);
    assert_eq!(h.sim.summary_state(), SummaryState::Fault);
    assert_eq!(
        h.session.fault_cause().as_deref(),
        Some("unexpected remote state: FAULT while ENABLED")
    );

    h.session.clear_fault().await.unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Standby);
    assert_eq!(h.sim.summary_state(), SummaryState::Standby);
}

#[tokio::test]
async fn test_fault_rejects_commands_locally() {
    let h = TestHarness::start_with_move().await;
    h.enable().await;
    h.sim.emit_summary_state(SummaryState::Disabled).unwrap();
    assert!(wait_for_state(&h.session, SummaryState::Fault).await);

    let sent = h.sim.received_count();
    for result in [
        h.session.standby().await,
        h.session.disable().await,
        h.session
            .execute("moveToTarget", Parameters::new())
            .await
            .map(|_| ()),
    ] {
        assert!(matches!(
            result,
            Err(CoreError::InvalidState { state: SummaryState::Fault, .. })
        ));
    }
    assert_eq!(h.sim.received_count(), sent, "nothing reached the wire");

    let outcome = h.session.execute("status", Parameters::new()).await.unwrap();
    assert_eq!(outcome.status, CommandStatus::Complete);
}

#[tokio::test]
async fn test_transition_outside_table_rejected() {
    let h = TestHarness::start().await;

    let err = h.session.enable().await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::InvalidState { state: SummaryState::Standby, .. }
    ));
    assert!(matches!(
        h.session.clear_fault().await,
        Err(CoreError::InvalidState { .. })
    ));
    assert_eq!(h.sim.received_count(), 0);
}

#[tokio::test]
async fn test_failed_transition_reports_reason() {
    let h = TestHarness::start().await;
    h.sim
        .queue_response(CommandResponse::Fail(Some("drive not ready".to_string())));

    let err = h.session.start().await.unwrap_err();
    match err {
        CoreError::CommandFailed { command, message } => {
            assert_eq!(command, "start");
            assert_eq!(message, "drive not ready");
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }
    assert_eq!(h.session.current_state(), SummaryState::Standby);

    // The failed transition no longer blocks a retry.
    h.session.start().await.unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Disabled);
}

#[tokio::test]
async fn test_failed_without_reason() {
    let h = TestHarness::start().await;
    h.sim.queue_response(CommandResponse::Fail(None));

    let outcome = h.session.execute("start", Parameters::new()).await.unwrap();
    assert_eq!(outcome.status, CommandStatus::Failed);
    assert_eq!(outcome.message, None);
    h.session.start().await.unwrap();
}

#[tokio::test]
async fn test_error_code_reply_is_failure() {
    let h = TestHarness::start_with_move().await;
    h.sim.queue_response(CommandResponse::ErrorCode {
        code: 12,
        description: "limit switch".to_string(),
    });

    let outcome = h
        .session
        .execute("moveToTarget", Parameters::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, CommandStatus::Failed);
    assert_eq!(outcome.message.as_deref(), Some("error code 12: limit switch"));
}

#[tokio::test]
async fn test_exit_and_enter_control() {
    let h = TestHarness::start().await;
    let mut events = h.session.subscribe_events();

    h.session.exit_control().unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Offline);
    assert!(matches!(
        h.session.start().await,
        Err(CoreError::InvalidState { state: SummaryState::Offline, .. })
    ));

    // status still goes through; the remote's STANDBY report is no fault.
    h.session.execute("status", Parameters::new()).await.unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Offline);

    h.session.enter_control().unwrap();
    assert_eq!(h.session.current_state(), SummaryState::Standby);
    assert!(h.session.enter_control().is_err());

    let states = announced_states(&[
        next_notice(&mut events).await,
        next_notice(&mut events).await,
    ]);
    assert_eq!(states, vec![SummaryState::Offline, SummaryState::Standby]);

    // Only status went out.
    assert_eq!(h.sim.received_count(), 1);
}

#[tokio::test]
async fn test_one_transition_in_flight() {
    let h = TestHarness::start().await;
    h.sim.queue_response(CommandResponse::Deferred);

    let start = h
        .session
        .issue_command("start", Parameters::new())
        .await
        .unwrap();
    assert!(matches!(
        h.session.issue_command("start", Parameters::new()).await,
        Err(CoreError::InvalidState { .. })
    ));
    assert!(h.session.exit_control().is_err());

    wait_for_ack(&start).await;
    h.sim.complete_deferred(start.correlation_id()).unwrap();
    assert!(start.wait().await.unwrap().is_success());
    assert_eq!(h.session.current_state(), SummaryState::Disabled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_settled_when_transition_returns() {
    let h = TestHarness::start().await;

    for _ in 0..25 {
        h.session.start().await.unwrap();
        assert_eq!(h.session.current_state(), SummaryState::Disabled);
        h.session.enable().await.unwrap();
        assert_eq!(h.session.current_state(), SummaryState::Enabled);
        h.session.disable().await.unwrap();
        assert_eq!(h.session.current_state(), SummaryState::Disabled);
        h.session.standby().await.unwrap();
        assert_eq!(h.session.current_state(), SummaryState::Standby);
    }
    assert_eq!(h.session.pending_count(), 0);
}
