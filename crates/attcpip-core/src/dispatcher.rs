//! Routing of decoded inbound messages.

use crate::config::LinkConfig;
use crate::connection::{DisconnectReason, InboundHandler};
use crate::state::{SummaryStateMachine, Transition};
use crate::subscribers::{EventBus, TelemetrySink};
use crate::tracker::{CommandTracker, Resolution};
use attcpip_protocol::{
    CommandStatus, Event, Message, Reply, ERROR_CODE_EVENT, SUMMARY_STATE_EVENT,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routes inbound messages to the tracker, the state machine and the
/// subscribers.
///
/// Routing never suspends, so the read task hands over each message and
/// moves on. Messages from one connection are routed in arrival order.
pub struct Dispatcher {
    tracker: CommandTracker,
    state: Arc<SummaryStateMachine>,
    events: EventBus,
    telemetry: TelemetrySink,
    known_events: HashSet<String>,
    last_sequence: Mutex<Option<u64>>,
    local_sequence: AtomicU64,
    disconnected: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: &LinkConfig,
        tracker: CommandTracker,
        state: Arc<SummaryStateMachine>,
    ) -> Self {
        Self {
            tracker,
            state,
            events: EventBus::new(),
            telemetry: TelemetrySink::new(
                config.telemetry_capacity,
                config.known_telemetry_topics.iter().cloned(),
            ),
            known_events: config.known_events.iter().cloned().collect(),
            last_sequence: Mutex::new(None),
            local_sequence: AtomicU64::new(1),
            disconnected: AtomicBool::new(true),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    /// Start a new connection epoch: sequence checking restarts and the
    /// next disconnect will be reported.
    pub fn begin_connection(&self) {
        *self.last_sequence.lock() = None;
        self.disconnected.store(false, Ordering::SeqCst);
    }

    /// Route one message.
    pub fn route(&self, message: Message) {
        match message {
            Message::Reply(reply) => self.route_reply(reply),
            Message::Event(event) => self.route_event(event),
            Message::Telemetry(frame) => {
                self.telemetry.publish(frame);
            }
            Message::Command(command) => {
                warn!(command = %command.name, "Remote sent a command, dropping");
            }
        }
    }

    /// Announce a summary-state change to event subscribers and fail any
    /// state command it overrode.
    pub fn publish_transition(&self, transition: &Transition) {
        if let Some(id) = transition.aborted {
            let cause = transition.cause.as_deref().unwrap_or("state command overridden");
            self.tracker.fail_where(|pending, _| pending == id, cause);
        }
        let sequence = self.local_sequence.fetch_add(1, Ordering::SeqCst);
        let event = Event::summary_state(transition.to, transition.cause.as_deref(), sequence);
        self.events.publish(event);
    }

    fn route_reply(&self, reply: Reply) {
        let id = reply.correlation_id;
        let outcome = reply.outcome();

        // The transition lands before the waiter wakes, so a caller whose
        // command completed already sees the new state.
        let mut transition = None;
        let resolution = {
            let mut state = self.state.lock();
            self.tracker.resolve_then(id, outcome.clone(), |_| {
                transition = state.apply_reply(id, &outcome);
            })
        };

        match resolution {
            Resolution::Unmatched => {}
            Resolution::Updated { name } => {
                debug!(correlation_id = %id, command = %name, status = %outcome.status, "Command progress");
            }
            Resolution::Resolved { name } => {
                if outcome.status == CommandStatus::Failed {
                    warn!(
                        correlation_id = %id,
                        command = %name,
                        reason = outcome.message.as_deref().unwrap_or(""),
                        "Command failed"
                    );
                }
            }
        }

        if let Some(transition) = transition {
            self.publish_transition(&transition);
        }
    }

    fn route_event(&self, event: Event) {
        self.check_sequence(event.sequence_number);

        match event.name.as_str() {
            SUMMARY_STATE_EVENT => {
                let transition = match event.reported_summary_state() {
                    Some(reported) => {
                        debug!(state = %reported, "Remote summary state");
                        self.state.on_remote_state(reported)
                    }
                    None => {
                        let raw = event
                            .parameters
                            .get("state")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "<missing>".to_string());
                        warn!(state = %raw, "Remote reported an invalid summary state");
                        self.state.on_invalid_remote_state(&raw)
                    }
                };
                if let Some(transition) = transition {
                    self.publish_transition(&transition);
                }
            }
            ERROR_CODE_EVENT => {
                warn!(
                    code = ?event.parameters.get("code"),
                    description = event.str_parameter("description").unwrap_or(""),
                    "Remote reported an error code"
                );
                self.events.publish(event);
            }
            name => {
                if !self.known_events.is_empty() && !self.known_events.contains(name) {
                    debug!(event = name, "Ignoring unknown event");
                    return;
                }
                self.events.publish(event);
            }
        }
    }

    fn check_sequence(&self, sequence: u64) {
        let mut last = self.last_sequence.lock();
        if let Some(previous) = *last {
            if sequence <= previous {
                warn!(sequence, previous, "Event sequence number did not increase");
            }
        }
        *last = Some(sequence);
    }
}

impl InboundHandler for Dispatcher {
    fn on_message(&self, message: Message) {
        self.route(message);
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason = %reason, "Link disconnected");

        let failed = self.tracker.fail_all(&reason.to_string());
        if failed > 0 {
            warn!(failed, "Failed pending commands on disconnect");
        }
        if let Some(transition) = self.state.on_disconnect(&reason) {
            self.publish_transition(&transition);
        }
        self.events.disconnected(reason.clone());
        self.telemetry.disconnected(reason);
    }
}
