//! Wire protocol for the AT TCP/IP control link.
//!
//! Every message is a single JSON object terminated by `\r\n`. The
//! `category` field tells the receiver what kind of record it is:
//!
//! ```text
//! cmd        -> command sent to the remote controller
//! ack/noack  -> intermediate acknowledgement of a command
//! complete   -> command finished successfully
//! failed     -> command finished with an error
//! error_code -> command rejected with a numeric error code
//! evt        -> discrete event
//! tel        -> telemetry sample
//! ```
//!
//! This crate has no I/O and keeps no state between calls; buffering of
//! partial reads belongs to the connection layer.

mod codec;
mod commands;
mod error;
mod message;

pub use codec::{decode, encode, Decoded, MAX_LINE_LENGTH, TERMINATOR};
pub use commands::{StateCommand, ERROR_CODE_EVENT, STATUS_COMMAND, SUMMARY_STATE_EVENT};
pub use error::{DecodeError, DecodeErrorKind};
pub use message::{
    Category, Command, CommandOutcome, CommandStatus, CorrelationId, Event, Message, Parameters,
    Reply, ReplyKind, SummaryState, TelemetryFrame,
};
