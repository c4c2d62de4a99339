//! TCP side of the simulator.

use crate::error::{SimulatorError, SimulatorResult};
use crate::script::{CommandResponse, CommandSchema, ControllerState, Step};
use attcpip_protocol::{
    decode, encode, Command, CorrelationId, Event, Message, Parameters, SummaryState,
    TelemetryFrame, ERROR_CODE_EVENT,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Simulator options.
#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    /// Address for commands and events. Port 0 picks a free port.
    pub cmd_evt_addr: SocketAddr,
    /// Address for a separate telemetry server, if any.
    pub telemetry_addr: Option<SocketAddr>,
    /// Summary state at startup.
    pub initial_state: SummaryState,
    /// Answer `enable` by going to FAULT.
    pub go_to_fault_on_enable: bool,
    /// Command names accepted besides the state commands and `status`.
    pub extra_commands: Vec<String>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            cmd_evt_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            telemetry_addr: None,
            initial_state: SummaryState::Standby,
            go_to_fault_on_enable: false,
            extra_commands: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum Outgoing {
    Bytes(Vec<u8>),
    Close,
}

type ClientTx = mpsc::UnboundedSender<Outgoing>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    CmdEvt,
    Telemetry,
}

impl Link {
    fn name(self) -> &'static str {
        match self {
            Link::CmdEvt => "cmd_evt",
            Link::Telemetry => "telemetry",
        }
    }
}

struct Shared {
    controller: Mutex<ControllerState>,
    cmd_client: Mutex<Option<ClientTx>>,
    telemetry_client: Mutex<Option<ClientTx>>,
    cmd_accepted: watch::Sender<u64>,
    telemetry_accepted: watch::Sender<u64>,
}

impl Shared {
    fn slot(&self, link: Link) -> &Mutex<Option<ClientTx>> {
        match link {
            Link::CmdEvt => &self.cmd_client,
            Link::Telemetry => &self.telemetry_client,
        }
    }

    fn accepted(&self, link: Link) -> &watch::Sender<u64> {
        match link {
            Link::CmdEvt => &self.cmd_accepted,
            Link::Telemetry => &self.telemetry_accepted,
        }
    }

    fn client(&self, link: Link) -> SimulatorResult<ClientTx> {
        self.slot(link)
            .lock()
            .clone()
            .ok_or(SimulatorError::NoClient(link.name()))
    }
}

/// In-process stand-in for an AT hardware controller.
///
/// Serves one client per link; a new connection replaces the previous
/// one. Commands are answered according to a queue of scripted
/// [`CommandResponse`]s, falling back to a default.
pub struct AtSimulator {
    cmd_evt_addr: SocketAddr,
    telemetry_addr: Option<SocketAddr>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl AtSimulator {
    /// Start on a free loopback port with default behavior.
    pub async fn start() -> SimulatorResult<Self> {
        Self::start_with(SimulatorOptions::default()).await
    }

    /// Start with explicit options.
    pub async fn start_with(options: SimulatorOptions) -> SimulatorResult<Self> {
        let mut controller = ControllerState::new(options.initial_state, &options.extra_commands);
        controller.go_to_fault_on_enable = options.go_to_fault_on_enable;

        let shared = Arc::new(Shared {
            controller: Mutex::new(controller),
            cmd_client: Mutex::new(None),
            telemetry_client: Mutex::new(None),
            cmd_accepted: watch::channel(0).0,
            telemetry_accepted: watch::channel(0).0,
        });

        let cmd_listener = TcpListener::bind(options.cmd_evt_addr).await?;
        let cmd_evt_addr = cmd_listener.local_addr()?;
        let mut tasks = vec![tokio::spawn(accept_loop(
            cmd_listener,
            shared.clone(),
            Link::CmdEvt,
        ))];

        let telemetry_addr = match options.telemetry_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let addr = listener.local_addr()?;
                tasks.push(tokio::spawn(accept_loop(
                    listener,
                    shared.clone(),
                    Link::Telemetry,
                )));
                Some(addr)
            }
            None => None,
        };

        info!(cmd_evt = %cmd_evt_addr, telemetry = ?telemetry_addr, "Simulator listening");

        Ok(Self {
            cmd_evt_addr,
            telemetry_addr,
            shared,
            tasks,
        })
    }

    pub fn cmd_evt_addr(&self) -> SocketAddr {
        self.cmd_evt_addr
    }

    pub fn cmd_evt_port(&self) -> u16 {
        self.cmd_evt_addr.port()
    }

    pub fn telemetry_port(&self) -> Option<u16> {
        self.telemetry_addr.map(|addr| addr.port())
    }

    /// Queue a response for the next command.
    pub fn queue_response(&self, response: CommandResponse) {
        self.shared.controller.lock().responses.push_back(response);
    }

    /// Response used when the queue is empty.
    pub fn set_default_response(&self, response: CommandResponse) {
        self.shared.controller.lock().default_response = response;
    }

    /// Accept another command name with any parameters.
    pub fn add_command(&self, name: &str) {
        self.add_command_schema(name, CommandSchema::open());
    }

    /// Accept `name` only with parameters matching `schema`.
    pub fn add_command_schema(&self, name: &str, schema: CommandSchema) {
        self.shared
            .controller
            .lock()
            .commands
            .insert(name.to_string(), schema);
    }

    pub fn set_go_to_fault_on_enable(&self, enabled: bool) {
        self.shared.controller.lock().go_to_fault_on_enable = enabled;
    }

    /// Simulated summary state.
    pub fn summary_state(&self) -> SummaryState {
        self.shared.controller.lock().summary
    }

    /// Commands received so far, in arrival order.
    pub fn received_commands(&self) -> Vec<Command> {
        self.shared.controller.lock().received.clone()
    }

    pub fn received_count(&self) -> usize {
        self.shared.controller.lock().received.len()
    }

    /// Wait until at least `count` command clients have connected in total.
    pub async fn wait_for_clients(&self, count: u64, timeout: Duration) -> bool {
        wait_for_count(&self.shared.cmd_accepted, count, timeout).await
    }

    /// Wait until a command client is connected.
    pub async fn wait_for_client(&self, timeout: Duration) -> bool {
        self.wait_for_clients(1, timeout).await
    }

    /// Wait until a telemetry client is connected.
    pub async fn wait_for_telemetry_client(&self, timeout: Duration) -> bool {
        wait_for_count(&self.shared.telemetry_accepted, 1, timeout).await
    }

    /// Set the simulated state and report it with a `summaryState` event.
    pub fn emit_summary_state(&self, state: SummaryState) -> SimulatorResult<()> {
        let message = {
            let mut controller = self.shared.controller.lock();
            controller.summary = state;
            controller.summary_event(state)
        };
        self.send(Link::CmdEvt, &message)
    }

    /// Send an event with the next sequence number.
    pub fn emit_event(&self, name: &str, parameters: Parameters) -> SimulatorResult<()> {
        let sequence = self.shared.controller.lock().next_sequence();
        self.send(
            Link::CmdEvt,
            &Message::Event(Event::new(name, parameters, sequence)),
        )
    }

    /// Send an `errorCode` event.
    pub fn emit_error_code(&self, code: i64, description: &str) -> SimulatorResult<()> {
        let mut parameters = Parameters::new();
        parameters.insert("code".to_string(), serde_json::json!(code));
        parameters.insert("description".to_string(), serde_json::json!(description));
        self.emit_event(ERROR_CODE_EVENT, parameters)
    }

    /// Send a telemetry frame stamped with the current time.
    ///
    /// Goes to the telemetry client when a telemetry server runs, else on
    /// the command link.
    pub fn emit_telemetry(&self, topic: &str, parameters: Parameters) -> SimulatorResult<()> {
        let timestamp = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let frame = Message::Telemetry(TelemetryFrame::new(topic, parameters, timestamp));
        let link = if self.telemetry_addr.is_some() {
            Link::Telemetry
        } else {
            Link::CmdEvt
        };
        self.send(link, &frame)
    }

    /// Write raw bytes on the command link.
    pub fn send_raw(&self, bytes: &[u8]) -> SimulatorResult<()> {
        let client = self.shared.client(Link::CmdEvt)?;
        client
            .send(Outgoing::Bytes(bytes.to_vec()))
            .map_err(|_| SimulatorError::NoClient(Link::CmdEvt.name()))
    }

    /// Finish a command answered with [`CommandResponse::Deferred`].
    pub fn complete_deferred(&self, id: CorrelationId) -> SimulatorResult<()> {
        let steps = {
            let mut controller = self.shared.controller.lock();
            let command = controller
                .deferred
                .remove(&id)
                .ok_or(SimulatorError::UnknownDeferred(id))?;
            controller.finish(&command)
        };
        run_steps(self.shared.client(Link::CmdEvt)?, steps);
        Ok(())
    }

    /// Close every client connection.
    pub fn drop_client(&self) {
        for link in [Link::CmdEvt, Link::Telemetry] {
            if let Some(client) = self.shared.slot(link).lock().take() {
                let _ = client.send(Outgoing::Close);
                info!(link = link.name(), "Dropping client");
            }
        }
    }

    fn send(&self, link: Link, message: &Message) -> SimulatorResult<()> {
        let bytes = encode(message)?;
        self.shared
            .client(link)?
            .send(Outgoing::Bytes(bytes))
            .map_err(|_| SimulatorError::NoClient(link.name()))
    }
}

impl Drop for AtSimulator {
    fn drop(&mut self) {
        self.drop_client();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn wait_for_count(accepted: &watch::Sender<u64>, count: u64, timeout: Duration) -> bool {
    let mut rx = accepted.subscribe();
    tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false)
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, link: Link) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(link = link.name(), error = %e, "Accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(link = link.name(), error = %e, "Failed to set TCP_NODELAY");
        }
        info!(link = link.name(), peer = %peer, "Client connected");

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));

        if let Some(previous) = shared.slot(link).lock().replace(tx.clone()) {
            let _ = previous.send(Outgoing::Close);
        }
        if link == Link::CmdEvt {
            shared.controller.lock().last_correlation_id = None;
        }
        shared.accepted(link).send_modify(|n| *n += 1);

        tokio::spawn(read_loop(reader, shared.clone(), link, tx));
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Bytes(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(error = %e, "Write to client failed");
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>, link: Link, tx: ClientTx) {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 4096];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if tx.is_closed() {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match decode(&buf) {
                Ok(decoded) => {
                    buf.drain(..decoded.consumed);
                    match decoded.message {
                        Message::Command(command) if link == Link::CmdEvt => {
                            debug!(command = %command.name, correlation_id = %command.correlation_id, "Command received");
                            let steps = shared.controller.lock().plan(&command);
                            run_steps(tx.clone(), steps);
                        }
                        other => {
                            warn!(link = link.name(), category = %other.category(), "Ignoring unexpected message");
                        }
                    }
                }
                Err(e) if e.is_incomplete() => {
                    buf.drain(..e.consumed);
                    break;
                }
                Err(e) => {
                    warn!(link = link.name(), error = %e, "Ignoring undecodable line");
                    buf.drain(..e.consumed);
                }
            }
        }
    }

    let mut slot = shared.slot(link).lock();
    if slot.as_ref().is_some_and(|current| current.same_channel(&tx)) {
        slot.take();
    }
    info!(link = link.name(), "Client disconnected");
}

/// Send steps in order. A `Sleep` moves the rest onto a spawned task.
fn run_steps(tx: ClientTx, steps: Vec<Step>) {
    let mut steps = steps.into_iter();
    while let Some(step) = steps.next() {
        match step {
            Step::Send(message) => match encode(&message) {
                Ok(bytes) => {
                    let _ = tx.send(Outgoing::Bytes(bytes));
                }
                Err(e) => warn!(error = %e, "Failed to encode reply"),
            },
            Step::Sleep(delay) => {
                let rest: Vec<Step> = steps.by_ref().collect();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    run_steps(tx, rest);
                });
                return;
            }
            Step::Close => {
                let _ = tx.send(Outgoing::Close);
                return;
            }
        }
    }
}
