//! Line codec: one JSON object per `\r\n`-terminated line.

use crate::error::DecodeError;
use crate::message::{
    Category, Command, Event, Message, Reply, ReplyKind, TelemetryFrame,
};
use serde::Serialize;
use serde_json::Value;

/// Line terminator appended to every encoded message.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Longest line accepted without a terminator before the buffer is
/// treated as garbage.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// A message decoded from the front of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: Message,
    /// Bytes to drop from the front of the buffer, terminator included.
    pub consumed: usize,
}

#[derive(Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
enum Outbound<'a> {
    Cmd(&'a Command),
    Ack(&'a Reply),
    Noack(&'a Reply),
    Complete(&'a Reply),
    Failed(&'a Reply),
    ErrorCode(&'a Reply),
    Evt(&'a Event),
    Tel(&'a TelemetryFrame),
}

impl<'a> From<&'a Message> for Outbound<'a> {
    fn from(message: &'a Message) -> Self {
        match message {
            Message::Command(command) => Outbound::Cmd(command),
            Message::Reply(reply) => match reply.kind {
                ReplyKind::Ack => Outbound::Ack(reply),
                ReplyKind::Noack => Outbound::Noack(reply),
                ReplyKind::Complete => Outbound::Complete(reply),
                ReplyKind::Failed => Outbound::Failed(reply),
                ReplyKind::ErrorCode => Outbound::ErrorCode(reply),
            },
            Message::Event(event) => Outbound::Evt(event),
            Message::Telemetry(frame) => Outbound::Tel(frame),
        }
    }
}

/// Encode a message as a single terminated line.
pub fn encode(message: &Message) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(&Outbound::from(message))?;
    bytes.extend_from_slice(TERMINATOR);
    Ok(bytes)
}

/// Decode the first complete message at the front of `buf`.
///
/// Blank lines are skipped. A trailing `\r` before the `\n` is optional.
/// On error, `consumed` tells the caller how far to advance.
pub fn decode(buf: &[u8]) -> Result<Decoded, DecodeError> {
    let mut start = 0;
    loop {
        let rest = &buf[start..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            if rest.len() > MAX_LINE_LENGTH {
                return Err(DecodeError::malformed(
                    buf.len(),
                    format!("no line terminator within {MAX_LINE_LENGTH} bytes"),
                ));
            }
            return Err(DecodeError::incomplete(start));
        };

        let consumed = start + newline + 1;
        let line = rest[..newline].trim_ascii();
        if line.is_empty() {
            start = consumed;
            continue;
        }

        let message = parse_line(line, consumed)?;
        return Ok(Decoded { message, consumed });
    }
}

fn parse_line(line: &[u8], consumed: usize) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(line)
        .map_err(|e| DecodeError::malformed(consumed, format!("invalid JSON: {e}")))?;
    let Value::Object(mut fields) = value else {
        return Err(DecodeError::malformed(consumed, "expected a JSON object"));
    };

    let category = match fields.remove("category") {
        Some(Value::String(name)) => Category::from_wire(&name).ok_or_else(|| {
            DecodeError::unknown_category(consumed, format!("unrecognised category {name:?}"))
        })?,
        Some(other) => {
            return Err(DecodeError::unknown_category(
                consumed,
                format!("category is not a string: {other}"),
            ))
        }
        None => {
            return Err(DecodeError::unknown_category(
                consumed,
                "missing category field",
            ))
        }
    };

    let body = Value::Object(fields);
    let invalid =
        |e: serde_json::Error| DecodeError::malformed(consumed, format!("{category} message: {e}"));

    let message = match category {
        Category::Cmd => Message::Command(serde_json::from_value(body).map_err(invalid)?),
        Category::Ack => Message::Reply(reply(body, ReplyKind::Ack).map_err(invalid)?),
        Category::Noack => Message::Reply(reply(body, ReplyKind::Noack).map_err(invalid)?),
        Category::Complete => Message::Reply(reply(body, ReplyKind::Complete).map_err(invalid)?),
        Category::Failed => Message::Reply(reply(body, ReplyKind::Failed).map_err(invalid)?),
        Category::ErrorCode => {
            Message::Reply(reply(body, ReplyKind::ErrorCode).map_err(invalid)?)
        }
        Category::Evt => Message::Event(serde_json::from_value(body).map_err(invalid)?),
        Category::Tel => Message::Telemetry(serde_json::from_value(body).map_err(invalid)?),
    };
    Ok(message)
}

fn reply(body: Value, kind: ReplyKind) -> serde_json::Result<Reply> {
    let mut reply: Reply = serde_json::from_value(body)?;
    reply.kind = kind;
    Ok(reply)
}
