//! Decode error types.

use std::fmt;
use thiserror::Error;

/// Why a buffer could not be decoded into a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    /// The line is not a JSON object or lacks required fields.
    Malformed,
    /// No line terminator yet; buffer more bytes and retry.
    Incomplete,
    /// The `category` field is absent or not one we know.
    UnknownCategory,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodeErrorKind::Malformed => "malformed message",
            DecodeErrorKind::Incomplete => "incomplete message",
            DecodeErrorKind::UnknownCategory => "unknown category",
        };
        f.write_str(name)
    }
}

/// Decode failure.
///
/// `consumed` is the number of bytes the caller should discard before the
/// next attempt. For `Malformed` and `UnknownCategory` it covers the
/// offending line; for `Incomplete` it only covers leading blank lines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub consumed: usize,
    pub detail: String,
}

impl DecodeError {
    pub(crate) fn incomplete(consumed: usize) -> Self {
        Self {
            kind: DecodeErrorKind::Incomplete,
            consumed,
            detail: "waiting for line terminator".to_string(),
        }
    }

    pub(crate) fn malformed(consumed: usize, detail: impl Into<String>) -> Self {
        Self {
            kind: DecodeErrorKind::Malformed,
            consumed,
            detail: detail.into(),
        }
    }

    pub(crate) fn unknown_category(consumed: usize, detail: impl Into<String>) -> Self {
        Self {
            kind: DecodeErrorKind::UnknownCategory,
            consumed,
            detail: detail.into(),
        }
    }

    /// True when the caller should wait for more bytes.
    pub fn is_incomplete(&self) -> bool {
        self.kind == DecodeErrorKind::Incomplete
    }
}
