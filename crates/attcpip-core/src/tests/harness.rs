//! Test harness: a simulator and a session connected to it.

use crate::config::LinkConfig;
use crate::session::Session;
use crate::subscribers::{EventNotice, EventSubscription};
use crate::tracker::PendingCommandHandle;
use attcpip_protocol::{CommandStatus, SummaryState};
use attcpip_simulator::{AtSimulator, SimulatorOptions};
use std::net::SocketAddr;
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub(crate) const WAIT: Duration = Duration::from_secs(2);

/// Timeout for commands expected to time out.
pub(crate) const SHORT: Duration = Duration::from_millis(200);

pub(crate) struct TestHarness {
    pub sim: AtSimulator,
    pub session: Session,
}

impl TestHarness {
    /// Simulator with defaults, session connected.
    pub async fn start() -> Self {
        Self::start_with(SimulatorOptions::default()).await
    }

    pub async fn start_with(options: SimulatorOptions) -> Self {
        let sim = AtSimulator::start_with(options).await.unwrap();

        let mut config = LinkConfig::new("127.0.0.1", sim.cmd_evt_port());
        config.telemetry_port = sim.telemetry_port();
        config.command_timeout = WAIT;
        config.connect_timeout = Duration::from_secs(1);
        let session = Session::new(config).unwrap();

        session.connect().await.unwrap();
        assert!(sim.wait_for_client(WAIT).await, "simulator never saw the client");
        if sim.telemetry_port().is_some() {
            assert!(sim.wait_for_telemetry_client(WAIT).await);
        }

        Self { sim, session }
    }

    /// Simulator serving telemetry on its own port.
    pub async fn start_with_telemetry_port() -> Self {
        Self::start_with(SimulatorOptions {
            telemetry_addr: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
            ..SimulatorOptions::default()
        })
        .await
    }

    /// Simulator that also accepts `moveToTarget`.
    pub async fn start_with_move() -> Self {
        Self::start_with(SimulatorOptions {
            extra_commands: vec!["moveToTarget".to_string()],
            ..SimulatorOptions::default()
        })
        .await
    }

    /// STANDBY -> DISABLED -> ENABLED.
    pub async fn enable(&self) {
        self.session.start().await.unwrap();
        self.session.enable().await.unwrap();
        assert_eq!(self.session.current_state(), SummaryState::Enabled);
    }
}

/// Poll until the session reaches `state`.
pub(crate) async fn wait_for_state(session: &Session, state: SummaryState) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if session.current_state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    session.current_state() == state
}

/// Wait until the remote has acknowledged `handle`'s command.
pub(crate) async fn wait_for_ack(handle: &PendingCommandHandle) {
    let mut status = handle.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == Some(CommandStatus::Ack)))
        .await
        .expect("timed out waiting for ACK")
        .expect("command finished before ACK");
}

/// Next event notice, panicking if none arrives in time.
pub(crate) async fn next_notice(events: &mut EventSubscription) -> EventNotice {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

/// Collect notices up to and including the first `Disconnected`.
pub(crate) async fn notices_until_disconnect(events: &mut EventSubscription) -> Vec<EventNotice> {
    let mut seen = Vec::new();
    loop {
        let notice = next_notice(events).await;
        let done = matches!(notice, EventNotice::Disconnected(_));
        seen.push(notice);
        if done {
            return seen;
        }
    }
}

/// Summary states announced in `notices`, in order.
pub(crate) fn announced_states(notices: &[EventNotice]) -> Vec<SummaryState> {
    notices
        .iter()
        .filter_map(|notice| match notice {
            EventNotice::Event(event) => event.reported_summary_state(),
            EventNotice::Disconnected(_) => None,
        })
        .collect()
}
