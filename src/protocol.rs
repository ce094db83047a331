//! Relay Protocol
//!
//! Newline-terminated `TYPE|field|field...` lines exchanged between clients
//! and the relay. There is no length prefix, so no field may contain a
//! newline, and only the last field of a frame may contain `|`.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Recipient that addresses every registered peer except the sender
pub const BROADCAST: &str = "*";

/// Protocol-level errors. Inbound lines never produce these; they map to
/// [`Frame::Unrecognized`] instead.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Field {field} contains a forbidden character: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("Invalid nickname {0:?}")]
    InvalidNickname(String),
}

/// One protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `REGISTER|nick|staticPubB64`
    Register { nick: String, public_key: String },
    /// `KEY|from|to|staticPubB64`
    Key {
        from: String,
        to: String,
        public_key: String,
    },
    /// `MSG|from|to|ephPubB64:ivB64:ciphertextB64`
    Msg {
        from: String,
        to: String,
        payload: String,
    },
    /// `PEERS|nick1,nick2,...`
    Peers { nicks: Vec<String> },
    /// Anything that does not parse into one of the shapes above
    Unrecognized(String),
}

impl Frame {
    /// Parse one line (without its newline). Never fails: malformed input
    /// becomes [`Frame::Unrecognized`] carrying the raw line.
    pub fn parse(line: &str) -> Frame {
        let line = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<&str> = line.splitn(4, '|').collect();

        match parts.as_slice() {
            ["REGISTER", nick, public_key, ..] if !nick.is_empty() => Frame::Register {
                nick: nick.to_string(),
                public_key: public_key.to_string(),
            },
            // Routing only needs from/to; a missing last field is carried as empty.
            ["KEY", from, to, rest @ ..] => Frame::Key {
                from: from.to_string(),
                to: to.to_string(),
                public_key: rest.first().copied().unwrap_or_default().to_string(),
            },
            ["MSG", from, to, rest @ ..] => Frame::Msg {
                from: from.to_string(),
                to: to.to_string(),
                payload: rest.first().copied().unwrap_or_default().to_string(),
            },
            ["PEERS", list, ..] => Frame::Peers {
                nicks: list
                    .split(',')
                    .filter(|n| !n.trim().is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            _ => Frame::Unrecognized(line.to_string()),
        }
    }

    /// Render the frame as a line, without the trailing newline
    pub fn to_line(&self) -> String {
        match self {
            Frame::Register { nick, public_key } => format!("REGISTER|{}|{}", nick, public_key),
            Frame::Key {
                from,
                to,
                public_key,
            } => format!("KEY|{}|{}|{}", from, to, public_key),
            Frame::Msg { from, to, payload } => format!("MSG|{}|{}|{}", from, to, payload),
            Frame::Peers { nicks } => format!("PEERS|{}", nicks.join(",")),
            Frame::Unrecognized(raw) => raw.clone(),
        }
    }

    /// Check that [`to_line`](Self::to_line) would produce exactly one
    /// well-formed line.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Frame::Register { nick, public_key } => {
                validate_nickname(nick)?;
                check_field("public_key", public_key, true)
            }
            Frame::Key {
                from,
                to,
                public_key,
            } => {
                check_field("from", from, false)?;
                check_field("to", to, false)?;
                check_field("public_key", public_key, true)
            }
            Frame::Msg { from, to, payload } => {
                check_field("from", from, false)?;
                check_field("to", to, false)?;
                check_field("payload", payload, true)
            }
            Frame::Peers { nicks } => nicks
                .iter()
                .try_for_each(|n| check_field("nick", n, false)),
            Frame::Unrecognized(raw) => check_field("raw", raw, true),
        }
    }

    /// Addressee of a routed frame
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Frame::Key { to, .. } | Frame::Msg { to, .. } => Some(to),
            _ => None,
        }
    }
}

fn check_field(field: &'static str, value: &str, last: bool) -> Result<(), ProtocolError> {
    let forbidden = |c: char| c == '\n' || c == '\r' || (!last && c == '|');
    if value.contains(forbidden) {
        return Err(ProtocolError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// A nickname must survive both the `|` framing and the comma-joined PEERS
/// list, and must not collide with the broadcast address.
pub fn validate_nickname(nick: &str) -> Result<(), ProtocolError> {
    let bad_char = |c: char| matches!(c, '|' | ',' | '\n' | '\r') || c.is_control();
    if nick.trim().is_empty() || nick == BROADCAST || nick.contains(bad_char) {
        return Err(ProtocolError::InvalidNickname(nick.to_string()));
    }
    Ok(())
}

/// Newline-delimited reader that never fails on content. Bytes that are
/// not valid UTF-8 are replaced with U+FFFD, so one bad line reaches the
/// frame parser instead of ending the connection.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, `None` at EOF.
    ///
    /// Cancel safe: a partially read line stays buffered for the next call.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}
