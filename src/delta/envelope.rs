// ABOUTME: Four-byte message envelope tagging bus payloads as delta or file
// ABOUTME: Framing can be switched off for peers that expect bare payloads

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 2] = *b"MR";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Delta,
    File,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        match self {
            MessageKind::Delta => 1,
            MessageKind::File => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageKind::Delta),
            2 => Some(MessageKind::File),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Delta => write!(f, "delta"),
            MessageKind::File => write!(f, "file"),
        }
    }
}

/// How outgoing payloads are written to the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Envelope,
    Raw,
}

impl Framing {
    pub fn wrap(self, kind: MessageKind, body: &[u8]) -> Bytes {
        match self {
            Framing::Envelope => frame(kind, body),
            Framing::Raw => Bytes::copy_from_slice(body),
        }
    }
}

impl std::str::FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "envelope" => Ok(Framing::Envelope),
            "raw" => Ok(Framing::Raw),
            other => Err(format!(
                "unknown framing '{}', expected 'envelope' or 'raw'",
                other
            )),
        }
    }
}

/// Prefix `body` with the envelope header.
pub fn frame(kind: MessageKind, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(kind.tag());
    buf.put_slice(body);
    buf.freeze()
}

/// Split an enveloped payload into its kind and body.
///
/// Returns `None` for anything that is not a version-1 envelope with a known
/// kind; such payloads are treated as unframed.
pub fn unframe(payload: &[u8]) -> Option<(MessageKind, &[u8])> {
    if payload.len() < HEADER_LEN || payload[..2] != MAGIC || payload[2] != VERSION {
        return None;
    }
    let kind = MessageKind::from_tag(payload[3])?;
    Some((kind, &payload[HEADER_LEN..]))
}
