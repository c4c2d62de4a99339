//! Integration tests for the control core, run against the in-process
//! simulator over loopback TCP.
//!
//! - `harness.rs`           - Session plus simulator wiring and wait helpers
//! - `lifecycle.rs`         - Summary-state transitions, gating, FAILED outcomes
//! - `ordering.rs`          - Concurrent commands, out-of-order replies, wire order
//! - `timeout.rs`           - Timeouts, late replies, NOACK
//! - `transport_failure.rs` - Connection loss, local close, reconnect
//! - `reassembly.rs`        - Split and malformed input, telemetry, error codes

pub(crate) mod harness;
mod lifecycle;
