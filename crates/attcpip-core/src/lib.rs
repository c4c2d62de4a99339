//! Control core for the AT TCP/IP link.
//!
//! Connects a supervisory process to a remote hardware controller that
//! speaks newline-delimited JSON over TCP.
//!
//! # Guarantees
//!
//! 1. **One terminal reply**: every issued command ends exactly once, with
//!    COMPLETE, FAILED, timeout, cancellation or disconnect
//! 2. **Correlation, not order**: replies are matched by correlation id
//! 3. **Non-blocking delivery**: events and telemetry keep flowing while
//!    commands are in flight
//! 4. **Deterministic faults**: connection loss and unexpected remote
//!    states move the session to FAULT with a recorded cause
//!
//! # Architecture
//!
//! ```text
//! Session --admit--> SummaryStateMachine
//!    |                     ^
//!    | issue               | transitions
//!    v                     |
//! CommandTracker <--- Dispatcher ---> EventBus / TelemetrySink
//!    |                     ^
//!    | encode              | decode
//!    v                     |
//! ConnectionManager --TCP--> remote controller
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frame_buffer;
pub mod session;
pub mod state;
pub mod subscribers;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use attcpip_protocol as protocol;
pub use config::LinkConfig;
pub use connection::{
    ConnectOptions, ConnectionManager, ConnectionState, DisconnectReason, InboundHandler,
};
pub use dispatcher::Dispatcher;
pub use error::{CommandError, CoreError, CoreResult};
pub use frame_buffer::FrameBuffer;
pub use session::Session;
pub use state::{StateGuard, SummaryStateMachine, Transition};
pub use subscribers::{
    EventBus, EventNotice, EventSubscription, TelemetryNotice, TelemetrySink,
    TelemetrySubscription,
};
pub use tracker::{CommandTracker, PendingCommandHandle, Resolution};
