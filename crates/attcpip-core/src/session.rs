//! Session facade: the interface the supervisory process talks to.

use crate::config::LinkConfig;
use crate::connection::{ConnectOptions, ConnectionManager, ConnectionState, InboundHandler};
use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, CoreResult};
use crate::state::SummaryStateMachine;
use crate::subscribers::{EventSubscription, TelemetrySubscription};
use crate::tracker::{CommandTracker, PendingCommandHandle};
use attcpip_protocol::{
    encode, Command, CommandOutcome, CorrelationId, Message, Parameters, StateCommand,
    SummaryState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A controlled session with one remote controller.
///
/// Owns the links (commands/events and optional telemetry), the command
/// tracker and the summary-state machine. All methods take `&self`, so a
/// session can be shared behind an `Arc`.
pub struct Session {
    id: Uuid,
    config: LinkConfig,
    tracker: CommandTracker,
    state: Arc<SummaryStateMachine>,
    dispatcher: Arc<Dispatcher>,
    cmd_evt: ConnectionManager,
    telemetry: Option<ConnectionManager>,
    // Held from id allocation until the bytes are written, so ids hit the
    // wire in increasing order.
    issue_lock: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create a disconnected session in STANDBY.
    pub fn new(config: LinkConfig) -> CoreResult<Self> {
        config.validate()?;

        let tracker = CommandTracker::new();
        let state = Arc::new(SummaryStateMachine::new(SummaryState::Standby));
        let dispatcher = Arc::new(Dispatcher::new(&config, tracker.clone(), state.clone()));
        let telemetry = config
            .telemetry_port
            .map(|_| ConnectionManager::new("telemetry"));

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            tracker,
            state,
            dispatcher,
            cmd_evt: ConnectionManager::new("cmd_evt"),
            telemetry,
            issue_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Session id used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Open the links. A no-op when already connected.
    pub async fn connect(&self) -> CoreResult<()> {
        if self.connection_state() == ConnectionState::Connected {
            info!(session = %self.id, "Already connected");
            return Ok(());
        }

        self.close_links().await;
        self.dispatcher.begin_connection();

        let options = ConnectOptions {
            connect_timeout: self.config.connect_timeout,
            nodelay: true,
        };
        let handler: Arc<dyn InboundHandler> = self.dispatcher.clone();

        self.cmd_evt
            .connect(&self.config.host, self.config.cmd_evt_port, &options, handler.clone())
            .await?;

        if let (Some(link), Some(port)) = (&self.telemetry, self.config.telemetry_port) {
            if let Err(e) = link.connect(&self.config.host, port, &options, handler).await {
                warn!(session = %self.id, error = %e, "Telemetry connect failed, closing command link");
                self.cmd_evt.close().await;
                return Err(e);
            }
        }

        info!(
            session = %self.id,
            host = %self.config.host,
            cmd_evt_port = self.config.cmd_evt_port,
            telemetry_port = ?self.config.telemetry_port,
            "Session connected"
        );
        Ok(())
    }

    /// Close the links. Pending commands fail with `Disconnected`; the
    /// summary state is left alone.
    pub async fn disconnect(&self) {
        info!(session = %self.id, "Disconnecting");
        self.close_links().await;
    }

    async fn close_links(&self) {
        self.cmd_evt.close().await;
        if let Some(link) = &self.telemetry {
            link.close().await;
        }
    }

    /// Issue a command with the configured timeout.
    pub async fn issue_command(
        &self,
        name: &str,
        parameters: Parameters,
    ) -> CoreResult<PendingCommandHandle> {
        self.issue_command_with_timeout(name, parameters, self.config.command_timeout)
            .await
    }

    /// Issue a command and return its handle without waiting.
    ///
    /// The command is gated by the summary state before anything is sent.
    pub async fn issue_command_with_timeout(
        &self,
        name: &str,
        parameters: Parameters,
        timeout: Duration,
    ) -> CoreResult<PendingCommandHandle> {
        let _issuing = self.issue_lock.lock().await;

        let handle = self.state.admit(
            name,
            self.connection_state(),
            |id| self.tracker.is_pending(id),
            || {
                let handle = self.tracker.issue(name, timeout)?;
                Ok((handle.correlation_id(), handle))
            },
        )?;
        let id = handle.correlation_id();

        let command = Command::with_parameters(name, id, parameters);
        let sent = match encode(&Message::Command(command)) {
            Ok(bytes) => self.cmd_evt.send(&bytes).await,
            Err(e) => Err(CoreError::Json(e)),
        };
        if let Err(e) = sent {
            warn!(session = %self.id, correlation_id = %id, command = name, error = %e, "Failed to send command");
            self.tracker.cancel(id);
            self.state.abandon(id);
            return Err(e);
        }

        debug!(session = %self.id, correlation_id = %id, command = name, "Command sent");
        Ok(handle)
    }

    /// Issue a command and wait for its terminal outcome.
    ///
    /// A FAILED outcome is returned as `Ok`; timeouts, cancellation and
    /// disconnects are errors.
    pub async fn execute(&self, name: &str, parameters: Parameters) -> CoreResult<CommandOutcome> {
        let handle = self.issue_command(name, parameters).await?;
        Ok(handle.wait().await?)
    }

    /// Cancel a pending command. Returns whether it was still pending.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let cancelled = self.tracker.cancel(id);
        self.state.abandon(id);
        cancelled
    }

    pub fn subscribe_events(&self) -> EventSubscription {
        self.dispatcher.events().subscribe()
    }

    pub fn subscribe_telemetry(&self) -> TelemetrySubscription {
        self.dispatcher.telemetry().subscribe()
    }

    pub fn current_state(&self) -> SummaryState {
        self.state.current()
    }

    pub fn remote_state(&self) -> Option<SummaryState> {
        self.state.remote()
    }

    pub fn fault_cause(&self) -> Option<String> {
        self.state.fault_cause()
    }

    /// Combined state of the links: connected only when every link is.
    pub fn connection_state(&self) -> ConnectionState {
        let cmd_evt = self.cmd_evt.state();
        match &self.telemetry {
            Some(link) => combine(cmd_evt, link.state()),
            None => cmd_evt,
        }
    }

    /// Commands still awaiting a terminal reply.
    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    pub async fn start(&self) -> CoreResult<()> {
        self.transition(StateCommand::Start).await
    }

    pub async fn enable(&self) -> CoreResult<()> {
        self.transition(StateCommand::Enable).await
    }

    pub async fn disable(&self) -> CoreResult<()> {
        self.transition(StateCommand::Disable).await
    }

    pub async fn standby(&self) -> CoreResult<()> {
        self.transition(StateCommand::Standby).await
    }

    pub async fn clear_fault(&self) -> CoreResult<()> {
        self.transition(StateCommand::ClearFault).await
    }

    /// STANDBY -> OFFLINE. Local only; nothing is sent.
    pub fn exit_control(&self) -> CoreResult<()> {
        let transition = self.state.exit_control()?;
        self.dispatcher.publish_transition(&transition);
        Ok(())
    }

    /// OFFLINE -> STANDBY. Local only; nothing is sent.
    pub fn enter_control(&self) -> CoreResult<()> {
        let transition = self.state.enter_control()?;
        self.dispatcher.publish_transition(&transition);
        Ok(())
    }

    async fn transition(&self, command: StateCommand) -> CoreResult<()> {
        let outcome = self.execute(command.name(), Parameters::new()).await?;
        if outcome.is_success() {
            return Ok(());
        }
        Err(CoreError::CommandFailed {
            command: command.name().to_string(),
            message: outcome
                .message
                .unwrap_or_else(|| "no reason given".to_string()),
        })
    }
}

fn combine(a: ConnectionState, b: ConnectionState) -> ConnectionState {
    use ConnectionState::*;
    match (a, b) {
        (Connected, Connected) => Connected,
        (Closing, _) | (_, Closing) => Closing,
        (Connecting, _) | (_, Connecting) => Connecting,
        _ => Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_connection_state() {
        use ConnectionState::*;
        assert_eq!(combine(Connected, Connected), Connected);
        assert_eq!(combine(Connected, Disconnected), Disconnected);
        assert_eq!(combine(Connecting, Connected), Connecting);
        assert_eq!(combine(Disconnected, Closing), Closing);
    }

    #[tokio::test]
    async fn test_new_session_is_disconnected_standby() {
        let session = Session::new(LinkConfig::new("127.0.0.1", 5000)).unwrap();
        assert_eq!(session.current_state(), SummaryState::Standby);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(session.remote_state(), None);
        assert_eq!(session.fault_cause(), None);
    }

    #[tokio::test]
    async fn test_issue_while_disconnected() {
        let session = Session::new(LinkConfig::new("127.0.0.1", 5000)).unwrap();
        let err = session.issue_command("start", Parameters::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        assert!(Session::new(LinkConfig::new("", 5000)).is_err());
    }
}
