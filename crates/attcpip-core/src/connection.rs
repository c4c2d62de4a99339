//! TCP connection to the remote controller.
//!
//! A [`ConnectionManager`] owns one logical link (commands/events, or
//! telemetry). Each successful connect spawns a read task that owns the
//! read half; writes go through the write half behind an async mutex.
//! Whichever side notices the connection is gone first reports it, and
//! the report happens once per connection.

use crate::error::{CoreError, CoreResult};
use crate::frame_buffer::FrameBuffer;
use attcpip_protocol::Message;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 8192;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed on request of the local side.
    LocalClose,
    /// The peer closed the socket.
    RemoteClosed,
    /// A read or write failed.
    Transport(String),
}

impl DisconnectReason {
    pub fn is_local(&self) -> bool {
        matches!(self, DisconnectReason::LocalClose)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalClose => f.write_str("closed locally"),
            DisconnectReason::RemoteClosed => f.write_str("closed by remote"),
            DisconnectReason::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Receives everything read from a connection.
///
/// Called from the read task, one message at a time and in arrival order.
/// Implementations must not block.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_message(&self, message: Message);
    fn on_disconnect(&self, reason: DisconnectReason);
}

/// Connect options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

/// State shared between one live connection and its read task.
struct LiveShared {
    label: &'static str,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reported: AtomicBool,
    stop: Notify,
    state: Arc<watch::Sender<ConnectionState>>,
    handler: Arc<dyn InboundHandler>,
}

impl LiveShared {
    /// First caller wins; later calls are no-ops.
    fn report_disconnect(&self, reason: DisconnectReason) -> bool {
        if self.reported.swap(true, Ordering::SeqCst) {
            return false;
        }
        match &reason {
            DisconnectReason::LocalClose => info!(link = self.label, "Connection closed"),
            DisconnectReason::RemoteClosed => warn!(link = self.label, "Connection closed by remote"),
            DisconnectReason::Transport(e) => error!(link = self.label, error = %e, "Connection lost"),
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.stop.notify_one();
        // Not CONNECTED before the handler runs: nothing admitted after the
        // pending commands are failed can reach the socket.
        self.state.send_replace(ConnectionState::Disconnected);
        self.handler.on_disconnect(reason);
        true
    }
}

struct Live {
    shared: Arc<LiveShared>,
    read_task: JoinHandle<()>,
}

/// One logical link to the controller.
pub struct ConnectionManager {
    label: &'static str,
    state: Arc<watch::Sender<ConnectionState>>,
    live: Mutex<Option<Live>>,
}

impl ConnectionManager {
    /// Create a disconnected manager. `label` names the link in logs.
    pub fn new(label: &'static str) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            label,
            state: Arc::new(state),
            live: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect to `host:port` and start the read task.
    ///
    /// Any previous connection is closed first.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> CoreResult<()> {
        self.close().await;

        let addr = format!("{host}:{port}");
        self.state.send_replace(ConnectionState::Connecting);
        debug!(link = self.label, addr = %addr, "Connecting");

        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                warn!(link = self.label, addr = %addr, error = %e, "Connect failed");
                return Err(CoreError::Io(e));
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Disconnected);
                warn!(link = self.label, addr = %addr, "Connect timed out");
                return Err(CoreError::ConnectTimeout {
                    addr,
                    timeout: options.connect_timeout,
                });
            }
        };
        if options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(link = self.label, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let (reader, writer) = stream.into_split();
        let shared = Arc::new(LiveShared {
            label: self.label,
            writer: tokio::sync::Mutex::new(Some(writer)),
            reported: AtomicBool::new(false),
            stop: Notify::new(),
            state: self.state.clone(),
            handler,
        });

        self.state.send_replace(ConnectionState::Connected);
        let read_task = tokio::spawn(read_loop(reader, shared.clone()));
        *self.live.lock() = Some(Live { shared, read_task });

        info!(link = self.label, addr = %addr, "Connected");
        Ok(())
    }

    /// Write one encoded message.
    ///
    /// Fails with `NotConnected` unless connected. A failed write ends the
    /// connection.
    pub async fn send(&self, bytes: &[u8]) -> CoreResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(CoreError::NotConnected);
        }
        let shared = self
            .live
            .lock()
            .as_ref()
            .map(|live| live.shared.clone())
            .ok_or(CoreError::NotConnected)?;

        let mut writer = shared.writer.lock().await;
        if shared.reported.load(Ordering::SeqCst) {
            writer.take();
            return Err(CoreError::NotConnected);
        }
        let Some(stream) = writer.as_mut() else {
            return Err(CoreError::NotConnected);
        };
        if let Err(e) = stream.write_all(bytes).await {
            drop(writer);
            shared.report_disconnect(DisconnectReason::Transport(e.to_string()));
            return Err(CoreError::Io(e));
        }
        Ok(())
    }

    /// Close the connection. No-op when already disconnected.
    pub async fn close(&self) {
        let Some(live) = self.live.lock().take() else {
            return;
        };

        if !live.shared.reported.load(Ordering::SeqCst) {
            self.state.send_replace(ConnectionState::Closing);
        }
        if let Some(mut writer) = live.shared.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(link = self.label, error = %e, "Write shutdown failed");
            }
        }
        live.read_task.abort();
        let _ = live.read_task.await;

        live.shared.report_disconnect(DisconnectReason::LocalClose);
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(live) = self.live.get_mut().take() {
            live.read_task.abort();
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<LiveShared>) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    let reason = loop {
        let read = tokio::select! {
            result = reader.read(&mut chunk) => result,
            _ = shared.stop.notified() => return,
        };

        match read {
            Ok(0) => break DisconnectReason::RemoteClosed,
            Ok(n) => {
                frames.push(&chunk[..n]);
                while let Some(decoded) = frames.next_message() {
                    match decoded {
                        Ok(message) => shared.handler.on_message(message),
                        Err(e) => warn!(link = shared.label, error = %e, "Skipping undecodable line"),
                    }
                }
            }
            Err(e) => break DisconnectReason::Transport(e.to_string()),
        }
    };

    shared.report_disconnect(reason);
}
