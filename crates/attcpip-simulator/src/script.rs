//! How the simulator answers commands.

use attcpip_protocol::{
    Command, CorrelationId, Event, Message, Parameters, Reply, StateCommand, SummaryState,
    STATUS_COMMAND,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Scripted answer to the next command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    /// ACK, then COMPLETE (state commands also move the simulated state
    /// and emit `summaryState`).
    Normal,
    /// NOACK with an optional reason.
    NoAck(Option<String>),
    /// ACK, then FAILED with an optional reason.
    Fail(Option<String>),
    /// A single `error_code` reply.
    ErrorCode { code: i64, description: String },
    /// ACK and nothing else.
    AckOnly,
    /// No reply at all.
    NeverRespond,
    /// ACK, wait, then behave like `Normal`.
    DelayThenComplete(Duration),
    /// ACK now; finish later through `complete_deferred`.
    Deferred,
    /// Drop the connection without replying.
    CloseConnection,
}

/// Parameter keys a command accepts. Commands whose parameters do not
/// match are NOACKed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSchema {
    required: Vec<String>,
    optional: Vec<String>,
    allow_extra: bool,
}

impl CommandSchema {
    /// No parameters at all.
    pub fn no_parameters() -> Self {
        Self::default()
    }

    /// Any parameters.
    pub fn open() -> Self {
        Self {
            allow_extra: true,
            ..Self::default()
        }
    }

    /// Exactly these keys, all required.
    pub fn requiring(keys: &[&str]) -> Self {
        Self {
            required: keys.iter().map(|k| k.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Also accept `keys` when present.
    pub fn with_optional(mut self, keys: &[&str]) -> Self {
        self.optional.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn check(&self, parameters: &Parameters) -> Result<(), String> {
        if let Some(missing) = self.required.iter().find(|k| !parameters.contains_key(*k)) {
            return Err(format!("missing parameter {missing}"));
        }
        if self.allow_extra {
            return Ok(());
        }
        match parameters
            .keys()
            .find(|k| !self.required.contains(k) && !self.optional.contains(k))
        {
            Some(unexpected) => Err(format!("unexpected parameter {unexpected}")),
            None => Ok(()),
        }
    }
}

/// One thing to do in reply to a command.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Send(Message),
    Sleep(Duration),
    Close,
}

/// Simulated controller state.
#[derive(Debug)]
pub(crate) struct ControllerState {
    pub(crate) summary: SummaryState,
    pub(crate) last_correlation_id: Option<u64>,
    pub(crate) go_to_fault_on_enable: bool,
    pub(crate) commands: HashMap<String, CommandSchema>,
    pub(crate) responses: VecDeque<CommandResponse>,
    pub(crate) default_response: CommandResponse,
    pub(crate) deferred: HashMap<CorrelationId, Command>,
    pub(crate) received: Vec<Command>,
    event_sequence: u64,
}

impl ControllerState {
    pub(crate) fn new(initial: SummaryState, extra_commands: &[String]) -> Self {
        let mut commands: HashMap<String, CommandSchema> = StateCommand::ALL
            .iter()
            .map(|cmd| (cmd.name().to_string(), CommandSchema::no_parameters()))
            .collect();
        commands.insert(STATUS_COMMAND.to_string(), CommandSchema::no_parameters());
        commands.extend(
            extra_commands
                .iter()
                .map(|name| (name.clone(), CommandSchema::open())),
        );

        Self {
            summary: initial,
            last_correlation_id: None,
            go_to_fault_on_enable: false,
            commands,
            responses: VecDeque::new(),
            default_response: CommandResponse::Normal,
            deferred: HashMap::new(),
            received: Vec::new(),
            event_sequence: 0,
        }
    }

    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.event_sequence += 1;
        self.event_sequence
    }

    pub(crate) fn summary_event(&mut self, state: SummaryState) -> Message {
        let sequence = self.next_sequence();
        Message::Event(Event::summary_state(state, None, sequence))
    }

    /// Decide the replies to `command` and apply its effects.
    pub(crate) fn plan(&mut self, command: &Command) -> Vec<Step> {
        let id = command.correlation_id;
        self.received.push(command.clone());

        let previous = self.last_correlation_id.replace(id.value());
        if let Some(last) = previous {
            if id.value() != last.wrapping_add(1) {
                return vec![Step::Send(Message::Reply(Reply::noack(
                    id,
                    Some(format!("correlation id {id} does not follow {last}")),
                )))];
            }
        }
        let Some(schema) = self.commands.get(&command.name) else {
            return vec![Step::Send(Message::Reply(Reply::noack(
                id,
                Some(format!("unknown command {}", command.name)),
            )))];
        };
        if let Err(reason) = schema.check(&command.parameters) {
            return vec![Step::Send(Message::Reply(Reply::noack(
                id,
                Some(format!("invalid parameters for {}: {reason}", command.name)),
            )))];
        }

        let ack = Step::Send(Message::Reply(Reply::ack(id)));
        let response = self
            .responses
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone());

        match response {
            CommandResponse::Normal => {
                let mut steps = vec![ack];
                steps.extend(self.finish(command));
                steps
            }
            CommandResponse::NoAck(reason) => {
                vec![Step::Send(Message::Reply(Reply::noack(id, reason)))]
            }
            CommandResponse::Fail(reason) => {
                vec![ack, Step::Send(Message::Reply(Reply::failed(id, reason)))]
            }
            CommandResponse::ErrorCode { code, description } => {
                vec![Step::Send(Message::Reply(Reply::error_code(id, code, &description)))]
            }
            CommandResponse::AckOnly => vec![ack],
            CommandResponse::NeverRespond => Vec::new(),
            CommandResponse::DelayThenComplete(delay) => {
                let mut steps = vec![ack, Step::Sleep(delay)];
                steps.extend(self.finish(command));
                steps
            }
            CommandResponse::Deferred => {
                self.deferred.insert(id, command.clone());
                vec![ack]
            }
            CommandResponse::CloseConnection => vec![Step::Close],
        }
    }

    /// Terminal reply for an accepted command, plus its state effects.
    pub(crate) fn finish(&mut self, command: &Command) -> Vec<Step> {
        let id = command.correlation_id;
        let complete = Step::Send(Message::Reply(Reply::complete(id)));

        if command.name == STATUS_COMMAND {
            let current = self.summary;
            return vec![complete, Step::Send(self.summary_event(current))];
        }
        let Some(state_command) = StateCommand::from_name(&command.name) else {
            return vec![complete];
        };
        if !state_command.allowed_from(self.summary) {
            return vec![Step::Send(Message::Reply(Reply::failed(
                id,
                Some(format!(
                    "{} not allowed in state {}",
                    state_command, self.summary
                )),
            )))];
        }

        let next = if state_command == StateCommand::Enable && self.go_to_fault_on_enable {
            SummaryState::Fault
        } else {
            state_command.target()
        };
        self.summary = next;
        vec![complete, Step::Send(self.summary_event(next))]
    }
}
