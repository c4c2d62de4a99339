//! Scriptable stand-in for an AT TCP/IP hardware controller.
//!
//! Speaks the same line protocol as the real controller: it replies to
//! commands with ACK then COMPLETE, tracks a summary state, emits
//! `summaryState` events and can publish telemetry on a separate port.
//! Tests script misbehavior (NOACK, FAILED, silence, dropped connections,
//! out-of-order completion) through [`CommandResponse`].
//!
//! ```text
//! Session --cmd--> AtSimulator
//!    ^                  |
//!    |__ ack/complete __|
//!    |__ evt / tel _____|
//! ```

pub mod error;
pub mod script;
pub mod server;

pub use error::{SimulatorError, SimulatorResult};
pub use script::{CommandResponse, CommandSchema};
pub use server::{AtSimulator, SimulatorOptions};
