//! Summary-state machine.
//!
//! ```text
//!            start            enable
//! STANDBY ----------> DISABLED -------> ENABLED
//!    ^   <----------     |    <-------     |
//!    |     standby       |     disable     |
//!    |                   +----standby------+
//!    | clearFault
//!  FAULT  <---- unexpected remote state / connection loss
//!
//! STANDBY <--> OFFLINE  via enter_control / exit_control
//! ```
//!
//! Every method takes the lock, applies at most one transition and
//! returns it; publishing the resulting event is the caller's job.

use crate::connection::{ConnectionState, DisconnectReason};
use crate::error::{CoreError, CoreResult};
use attcpip_protocol::{
    CommandOutcome, CommandStatus, CorrelationId, StateCommand, SummaryState, STATUS_COMMAND,
};
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

/// A summary-state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SummaryState,
    pub to: SummaryState,
    /// Present for transitions into FAULT.
    pub cause: Option<String>,
    /// In-flight state command overridden by this transition.
    pub aborted: Option<CorrelationId>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: CorrelationId,
    command: StateCommand,
}

#[derive(Debug)]
struct Inner {
    current: SummaryState,
    remote: Option<SummaryState>,
    fault_cause: Option<String>,
    in_flight: Option<InFlight>,
}

impl Inner {
    fn fault(&mut self, cause: String) -> Transition {
        let from = self.current;
        warn!(from = %from, cause = %cause, "Entering FAULT");
        self.current = SummaryState::Fault;
        self.fault_cause = Some(cause.clone());
        Transition {
            from,
            to: SummaryState::Fault,
            cause: Some(cause),
            aborted: self.in_flight.take().map(|f| f.id),
        }
    }

    fn move_to(&mut self, to: SummaryState) -> Transition {
        let from = self.current;
        info!(from = %from, to = %to, "Summary state changed");
        self.current = to;
        if to != SummaryState::Fault {
            self.fault_cause = None;
        }
        Transition {
            from,
            to,
            cause: None,
            aborted: None,
        }
    }
}

fn is_operational(state: SummaryState) -> bool {
    matches!(
        state,
        SummaryState::Standby | SummaryState::Disabled | SummaryState::Enabled
    )
}

/// Local view of the controller's summary state.
pub struct SummaryStateMachine {
    inner: Mutex<Inner>,
}

impl Default for SummaryStateMachine {
    fn default() -> Self {
        Self::new(SummaryState::Standby)
    }
}

impl SummaryStateMachine {
    pub fn new(initial: SummaryState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: initial,
                remote: None,
                fault_cause: None,
                in_flight: None,
            }),
        }
    }

    pub fn current(&self) -> SummaryState {
        self.inner.lock().current
    }

    /// Last state reported by the remote, if any.
    pub fn remote(&self) -> Option<SummaryState> {
        self.inner.lock().remote
    }

    /// Why the last FAULT happened. Cleared on leaving FAULT.
    pub fn fault_cause(&self) -> Option<String> {
        self.inner.lock().fault_cause.clone()
    }

    /// The state command awaiting completion, if any.
    pub fn in_flight(&self) -> Option<(CorrelationId, StateCommand)> {
        self.inner.lock().in_flight.map(|f| (f.id, f.command))
    }

    /// Gate a command and, if admitted, register it.
    ///
    /// `register` runs under the state lock so two state commands cannot
    /// both pass the in-flight check. `is_pending` tells whether a
    /// previously admitted state command is still awaiting its reply.
    pub fn admit<T>(
        &self,
        name: &str,
        connection: ConnectionState,
        is_pending: impl Fn(CorrelationId) -> bool,
        register: impl FnOnce() -> CoreResult<(CorrelationId, T)>,
    ) -> CoreResult<T> {
        let mut inner = self.inner.lock();
        let state = inner.current;
        let command = StateCommand::from_name(name);
        let reject = |reason| CoreError::InvalidState {
            command: name.to_string(),
            state,
            reason,
        };

        if !is_operational(state)
            && command != Some(StateCommand::ClearFault)
            && name != STATUS_COMMAND
        {
            return Err(reject("only clearFault and status are accepted"));
        }
        if let Some(command) = command {
            if !command.allowed_from(state) {
                return Err(reject("transition not allowed from this state"));
            }
            if let Some(f) = inner.in_flight {
                if is_pending(f.id) {
                    return Err(reject("another state transition is in flight"));
                }
            }
        }
        if connection != ConnectionState::Connected {
            return Err(CoreError::NotConnected);
        }

        let (id, value) = register()?;
        if let Some(command) = command {
            inner.in_flight = Some(InFlight { id, command });
        }
        Ok(value)
    }

    /// Forget an admitted command that never made it onto the wire.
    pub fn abandon(&self, id: CorrelationId) {
        let mut inner = self.inner.lock();
        if inner.in_flight.is_some_and(|f| f.id == id) {
            inner.in_flight = None;
        }
    }

    /// Take the state lock for a multi-step update.
    ///
    /// Lock order is state, then tracker: code holding the guard may call
    /// into the [`CommandTracker`](crate::tracker::CommandTracker), never the
    /// other way round.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            inner: self.inner.lock(),
        }
    }

    /// Apply a terminal reply. Only the in-flight state command matters.
    pub fn on_reply(&self, id: CorrelationId, outcome: &CommandOutcome) -> Option<Transition> {
        self.lock().apply_reply(id, outcome)
    }

    /// Apply a state reported by the remote.
    ///
    /// A report is consistent when it matches the current state or the
    /// target of the in-flight state command. Anything else from an
    /// operational state is a FAULT.
    pub fn on_remote_state(&self, reported: SummaryState) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.remote = Some(reported);

        let current = inner.current;
        let expected = inner.in_flight.map(|f| f.command.target());
        if reported == current || Some(reported) == expected {
            return None;
        }
        if !is_operational(current) {
            return None;
        }
        Some(inner.fault(format!(
            "unexpected remote state: {reported} while {current}"
        )))
    }

    /// Apply a `summaryState` report whose state could not be parsed.
    pub fn on_invalid_remote_state(&self, raw: &str) -> Option<Transition> {
        let mut inner = self.inner.lock();
        if !is_operational(inner.current) {
            return None;
        }
        Some(inner.fault(format!("invalid remote state: {raw}")))
    }

    /// Apply loss of the connection.
    pub fn on_disconnect(&self, reason: &DisconnectReason) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.in_flight = None;
        if reason.is_local() || !is_operational(inner.current) {
            return None;
        }
        Some(inner.fault(format!("connection lost: {reason}")))
    }

    /// STANDBY -> OFFLINE, a local change.
    pub fn exit_control(&self) -> CoreResult<Transition> {
        self.local_move("exitControl", SummaryState::Standby, SummaryState::Offline)
    }

    /// OFFLINE -> STANDBY, a local change.
    pub fn enter_control(&self) -> CoreResult<Transition> {
        self.local_move("enterControl", SummaryState::Offline, SummaryState::Standby)
    }

    fn local_move(
        &self,
        name: &str,
        from: SummaryState,
        to: SummaryState,
    ) -> CoreResult<Transition> {
        let mut inner = self.inner.lock();
        if inner.current != from {
            return Err(CoreError::InvalidState {
                command: name.to_string(),
                state: inner.current,
                reason: "transition not allowed from this state",
            });
        }
        if inner.in_flight.is_some() {
            return Err(CoreError::InvalidState {
                command: name.to_string(),
                state: inner.current,
                reason: "another state transition is in flight",
            });
        }
        Ok(inner.move_to(to))
    }
}

/// Exclusive access to the state machine, from [`SummaryStateMachine::lock`].
pub struct StateGuard<'a> {
    inner: MutexGuard<'a, Inner>,
}

impl StateGuard<'_> {
    /// Apply a terminal reply. Only the in-flight state command matters.
    pub fn apply_reply(&mut self, id: CorrelationId, outcome: &CommandOutcome) -> Option<Transition> {
        let inner = &mut *self.inner;
        let f = inner.in_flight.filter(|f| f.id == id)?;

        match outcome.status {
            CommandStatus::Complete => {
                inner.in_flight = None;
                if !f.command.allowed_from(inner.current) {
                    warn!(
                        command = %f.command,
                        state = %inner.current,
                        "State command completed after state moved on, ignoring"
                    );
                    return None;
                }
                Some(inner.move_to(f.command.target()))
            }
            CommandStatus::Failed => {
                inner.in_flight = None;
                warn!(
                    command = %f.command,
                    state = %inner.current,
                    reason = outcome.message.as_deref().unwrap_or(""),
                    "State command failed"
                );
                None
            }
            CommandStatus::Ack | CommandStatus::Noack => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTED: ConnectionState = ConnectionState::Connected;

    fn admit(machine: &SummaryStateMachine, name: &str, id: u64) -> CoreResult<CorrelationId> {
        machine.admit(name, CONNECTED, |_| true, || {
            let id = CorrelationId::new(id);
            Ok((id, id))
        })
    }

    fn complete(machine: &SummaryStateMachine, id: CorrelationId) -> Option<Transition> {
        machine.on_reply(id, &CommandOutcome::complete())
    }

    #[test]
    fn test_start_enable_disable_standby() {
        let machine = SummaryStateMachine::default();

        let id = admit(&machine, "start", 1).unwrap();
        let t = complete(&machine, id).unwrap();
        assert_eq!((t.from, t.to), (SummaryState::Standby, SummaryState::Disabled));

        let id = admit(&machine, "enable", 2).unwrap();
        complete(&machine, id).unwrap();
        assert_eq!(machine.current(), SummaryState::Enabled);

        let id = admit(&machine, "disable", 3).unwrap();
        complete(&machine, id).unwrap();
        assert_eq!(machine.current(), SummaryState::Disabled);

        let id = admit(&machine, "standby", 4).unwrap();
        complete(&machine, id).unwrap();
        assert_eq!(machine.current(), SummaryState::Standby);
        assert_eq!(machine.in_flight(), None);
    }

    #[test]
    fn test_transition_not_in_table_rejected() {
        let machine = SummaryStateMachine::default();
        let err = admit(&machine, "enable", 1).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidState { state: SummaryState::Standby, .. }
        ));
    }

    #[test]
    fn test_one_state_command_in_flight() {
        let machine = SummaryStateMachine::new(SummaryState::Disabled);
        admit(&machine, "enable", 1).unwrap();
        assert!(admit(&machine, "standby", 2).is_err());
        assert!(admit(&machine, "status", 3).is_ok(), "ordinary commands unaffected");

        let released = machine.admit("standby", CONNECTED, |_| false, || {
            Ok((CorrelationId::new(4), ()))
        });
        assert!(released.is_ok(), "a timed-out transition no longer blocks");
    }

    #[test]
    fn test_not_connected_checked_after_state() {
        let machine = SummaryStateMachine::default();
        let err = machine
            .admit("start", ConnectionState::Disconnected, |_| true, || {
                Ok((CorrelationId::new(1), ()))
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::NotConnected));
    }

    #[test]
    fn test_fault_only_accepts_clear_fault_and_status() {
        let machine = SummaryStateMachine::new(SummaryState::Enabled);
        machine.on_disconnect(&DisconnectReason::RemoteClosed).unwrap();
        assert_eq!(machine.current(), SummaryState::Fault);

        assert!(admit(&machine, "moveToTarget", 1).is_err());
        assert!(admit(&machine, "standby", 2).is_err());
        assert!(admit(&machine, "status", 3).is_ok());

        let id = admit(&machine, "clearFault", 4).unwrap();
        let t = complete(&machine, id).unwrap();
        assert_eq!((t.from, t.to), (SummaryState::Fault, SummaryState::Standby));
        assert_eq!(machine.fault_cause(), None);
    }

    #[test]
    fn test_offline_rejects_everything_but_status() {
        let machine = SummaryStateMachine::default();
        machine.exit_control().unwrap();
        assert_eq!(machine.current(), SummaryState::Offline);
        assert!(admit(&machine, "start", 1).is_err());
        assert!(admit(&machine, "clearFault", 2).is_err());
        assert!(admit(&machine, "status", 3).is_ok());

        machine.enter_control().unwrap();
        assert_eq!(machine.current(), SummaryState::Standby);
        assert!(machine.enter_control().is_err());
    }

    #[test]
    fn test_failed_reply_clears_in_flight() {
        let machine = SummaryStateMachine::default();
        let id = admit(&machine, "start", 1).unwrap();
        assert!(machine
            .on_reply(id, &CommandOutcome::failed("hardware not ready"))
            .is_none());
        assert_eq!(machine.current(), SummaryState::Standby);
        assert_eq!(machine.in_flight(), None);
    }

    #[test]
    fn test_remote_report_matching_target_is_consistent() {
        let machine = SummaryStateMachine::default();
        admit(&machine, "start", 1).unwrap();
        assert!(machine.on_remote_state(SummaryState::Disabled).is_none());
        assert!(machine.on_remote_state(SummaryState::Standby).is_none());
        assert_eq!(machine.remote(), Some(SummaryState::Standby));
    }

    #[test]
    fn test_unexpected_remote_state_overrides_in_flight() {
        let machine = SummaryStateMachine::new(SummaryState::Enabled);
        let id = admit(&machine, "disable", 9).unwrap();

        let t = machine.on_remote_state(SummaryState::Standby).unwrap();
        assert_eq!(t.to, SummaryState::Fault);
        assert_eq!(t.aborted, Some(id));
        assert_eq!(
            t.cause.as_deref(),
            Some("unexpected remote state: STANDBY while ENABLED")
        );
        assert_eq!(machine.fault_cause(), t.cause);
        assert!(complete(&machine, id).is_none(), "late completion ignored");
    }

    #[test]
    fn test_invalid_remote_state_faults() {
        let machine = SummaryStateMachine::new(SummaryState::Disabled);
        let t = machine.on_invalid_remote_state("\"RUNNING\"").unwrap();
        assert_eq!(t.to, SummaryState::Fault);
        assert!(machine.on_invalid_remote_state("7").is_none(), "already faulted");
    }

    #[test]
    fn test_local_close_does_not_fault() {
        let machine = SummaryStateMachine::new(SummaryState::Enabled);
        assert!(machine.on_disconnect(&DisconnectReason::LocalClose).is_none());
        assert_eq!(machine.current(), SummaryState::Enabled);
    }

    #[test]
    fn test_disconnect_while_offline_or_fault_keeps_state() {
        let machine = SummaryStateMachine::new(SummaryState::Offline);
        assert!(machine.on_disconnect(&DisconnectReason::RemoteClosed).is_none());
        assert_eq!(machine.current(), SummaryState::Offline);
    }
}
