//! Designated command and event names shared by both ends of the link.

use crate::message::SummaryState;

/// Event that reports the remote summary state. Carries `{state}`.
pub const SUMMARY_STATE_EVENT: &str = "summaryState";

/// Event that reports a remote error. Carries `{code, description}`.
pub const ERROR_CODE_EVENT: &str = "errorCode";

/// Status query; allowed in every summary state.
pub const STATUS_COMMAND: &str = "status";

/// Commands that move the summary state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateCommand {
    Start,
    Enable,
    Disable,
    Standby,
    ClearFault,
}

impl StateCommand {
    pub const ALL: [StateCommand; 5] = [
        StateCommand::Start,
        StateCommand::Enable,
        StateCommand::Disable,
        StateCommand::Standby,
        StateCommand::ClearFault,
    ];

    /// Wire name of the command.
    pub fn name(self) -> &'static str {
        match self {
            StateCommand::Start => "start",
            StateCommand::Enable => "enable",
            StateCommand::Disable => "disable",
            StateCommand::Standby => "standby",
            StateCommand::ClearFault => "clearFault",
        }
    }

    /// Look up a state command by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.name() == name)
    }

    /// State reached once the command completes.
    pub fn target(self) -> SummaryState {
        match self {
            StateCommand::Start => SummaryState::Disabled,
            StateCommand::Enable => SummaryState::Enabled,
            StateCommand::Disable => SummaryState::Disabled,
            StateCommand::Standby => SummaryState::Standby,
            StateCommand::ClearFault => SummaryState::Standby,
        }
    }

    /// Whether the command may be issued from `state`.
    pub fn allowed_from(self, state: SummaryState) -> bool {
        match self {
            StateCommand::Start => state == SummaryState::Standby,
            StateCommand::Enable => state == SummaryState::Disabled,
            StateCommand::Disable => state == SummaryState::Enabled,
            StateCommand::Standby => {
                matches!(state, SummaryState::Disabled | SummaryState::Enabled)
            }
            StateCommand::ClearFault => state == SummaryState::Fault,
        }
    }
}

impl std::fmt::Display for StateCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
