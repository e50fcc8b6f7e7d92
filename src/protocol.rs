//! Ring protocol message definitions and codec.
//!
//! Probes travel as fixed two-byte UDP datagrams: the sequence number byte
//! followed by `R` (request) or `r` (response). Everything else travels as
//! one ASCII payload per TCP connection, a kind prefix followed by
//! comma-separated decimal fields:
//!
//! | Kind | Shape |
//! |---|---|
//! | DepartNotice | `D:<peer>,<succ>[,<succ>]` |
//! | SuccessorRequest | `SR:<peer>` |
//! | SuccessorResponse | `Sr:<peer>,<succ>[,<succ>]` |
//! | FileRequest | `FR:<requester>,<key>` |
//! | FileResponse | `Fr:<responder>,<key>,<0\|1>,<requester>` |
//!
//! Decoding never panics; anything that does not match a shape exactly is
//! reported as a [`DecodeError`] so dispatch can fall back to echoing.

use std::str::FromStr;

use thiserror::Error;

use crate::core::{FileKey, PeerId, SeqNum, MAX_SUCCESSORS};

/// Size of every probe datagram.
pub const PING_SIZE: usize = 2;

const PING_REQUEST_TAG: u8 = b'R';
const PING_RESPONSE_TAG: u8 = b'r';

/// The seven message kinds, listed in stream classification priority after
/// the two datagram kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PingRequest,
    PingResponse,
    DepartNotice,
    SuccessorRequest,
    SuccessorResponse,
    FileRequest,
    FileResponse,
}

impl MessageKind {
    /// Stream kinds in the order they are tried; first match wins.
    pub const STREAM_PRIORITY: [MessageKind; 5] = [
        MessageKind::DepartNotice,
        MessageKind::SuccessorRequest,
        MessageKind::SuccessorResponse,
        MessageKind::FileRequest,
        MessageKind::FileResponse,
    ];

    fn prefix(self) -> Option<&'static str> {
        match self {
            MessageKind::PingRequest | MessageKind::PingResponse => None,
            MessageKind::DepartNotice => Some("D:"),
            MessageKind::SuccessorRequest => Some("SR:"),
            MessageKind::SuccessorResponse => Some("Sr:"),
            MessageKind::FileRequest => Some("FR:"),
            MessageKind::FileResponse => Some("Fr:"),
        }
    }

    /// Classify a datagram by its exact shape.
    pub fn classify_datagram(payload: &[u8]) -> Option<Self> {
        Message::decode_datagram(payload).ok().map(|m| m.kind())
    }

    /// Classify a stream payload by its exact shape.
    pub fn classify_stream(payload: &[u8]) -> Option<Self> {
        Message::decode_stream(payload).ok().map(|m| m.kind())
    }
}

/// Answer to a file lookup, sent straight back to the original requester.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileResponse {
    /// The peer that owns the key.
    pub responder: PeerId,
    /// The raw (unhashed) key that was requested.
    pub key: FileKey,
    pub found: bool,
    /// The peer that started the lookup.
    pub requester: PeerId,
}

/// A decoded ring protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Liveness probe sent to a successor.
    PingRequest { seq: SeqNum },
    /// Echo of a probe's sequence number.
    PingResponse { seq: SeqNum },
    /// `peer` is leaving; `successors` are its one or two successors.
    DepartNotice {
        peer: PeerId,
        successors: Vec<PeerId>,
    },
    /// `peer` asks for the receiver's successor list.
    SuccessorRequest { peer: PeerId },
    /// `peer` reports its one or two successors.
    SuccessorResponse {
        peer: PeerId,
        successors: Vec<PeerId>,
    },
    /// Lookup for a raw key started by `requester`.
    FileRequest { requester: PeerId, key: FileKey },
    FileResponse(FileResponse),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload does not match any known message kind")]
    UnknownKind,
    #[error("malformed {kind:?} message: {reason}")]
    Malformed {
        kind: MessageKind,
        reason: &'static str,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PingRequest { .. } => MessageKind::PingRequest,
            Message::PingResponse { .. } => MessageKind::PingResponse,
            Message::DepartNotice { .. } => MessageKind::DepartNotice,
            Message::SuccessorRequest { .. } => MessageKind::SuccessorRequest,
            Message::SuccessorResponse { .. } => MessageKind::SuccessorResponse,
            Message::FileRequest { .. } => MessageKind::FileRequest,
            Message::FileResponse(_) => MessageKind::FileResponse,
        }
    }

    /// Whether this message travels over UDP.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Message::PingRequest { .. } | Message::PingResponse { .. })
    }

    /// Encode to wire bytes.
    ///
    /// List-carrying messages are expected to hold one or two successors;
    /// anything else will not decode on the receiving side.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::PingRequest { seq } => vec![seq.to_byte(), PING_REQUEST_TAG],
            Message::PingResponse { seq } => vec![seq.to_byte(), PING_RESPONSE_TAG],
            Message::DepartNotice { peer, successors } => {
                format!("D:{peer}{}", join_ids(successors)).into_bytes()
            }
            Message::SuccessorRequest { peer } => format!("SR:{peer}").into_bytes(),
            Message::SuccessorResponse { peer, successors } => {
                format!("Sr:{peer}{}", join_ids(successors)).into_bytes()
            }
            Message::FileRequest { requester, key } => {
                format!("FR:{requester},{key}").into_bytes()
            }
            Message::FileResponse(FileResponse {
                responder,
                key,
                found,
                requester,
            }) => format!("Fr:{responder},{key},{},{requester}", u8::from(*found)).into_bytes(),
        }
    }

    /// Decode a UDP payload. Only probes are valid datagrams.
    pub fn decode_datagram(payload: &[u8]) -> Result<Self, DecodeError> {
        match payload {
            [seq, PING_REQUEST_TAG] => Ok(Message::PingRequest {
                seq: SeqNum::from_byte(*seq),
            }),
            [seq, PING_RESPONSE_TAG] => Ok(Message::PingResponse {
                seq: SeqNum::from_byte(*seq),
            }),
            _ => Err(DecodeError::UnknownKind),
        }
    }

    /// Decode a TCP payload.
    ///
    /// Surrounding ASCII whitespace and NUL padding are ignored. Kinds are
    /// tried in [`MessageKind::STREAM_PRIORITY`] order.
    pub fn decode_stream(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(trim_payload(payload)).map_err(|_| DecodeError::UnknownKind)?;
        for kind in MessageKind::STREAM_PRIORITY {
            let Some(body) = kind.prefix().and_then(|prefix| text.strip_prefix(prefix)) else {
                continue;
            };
            return decode_body(kind, body);
        }
        Err(DecodeError::UnknownKind)
    }
}

fn join_ids(ids: &[PeerId]) -> String {
    ids.iter().map(|id| format!(",{id}")).collect()
}

/// Strip leading and trailing ASCII whitespace and NUL bytes.
pub fn trim_payload(payload: &[u8]) -> &[u8] {
    let is_padding = |b: &u8| b.is_ascii_whitespace() || *b == 0;
    let start = payload.iter().position(|b| !is_padding(b)).unwrap_or(payload.len());
    let end = payload
        .iter()
        .rposition(|b| !is_padding(b))
        .map_or(start, |last| last + 1);
    &payload[start..end]
}

fn decode_body(kind: MessageKind, body: &str) -> Result<Message, DecodeError> {
    let malformed = |reason| DecodeError::Malformed { kind, reason };
    let fields: Vec<&str> = body.split(',').collect();

    match kind {
        MessageKind::DepartNotice | MessageKind::SuccessorResponse => {
            let (first, rest) = fields.split_first().ok_or(malformed("missing peer id"))?;
            let peer = parse_field(first).ok_or(malformed("invalid peer id"))?;
            if rest.is_empty() || rest.len() > MAX_SUCCESSORS {
                return Err(malformed("expected one or two successor ids"));
            }
            let successors = rest
                .iter()
                .map(|field| parse_field(field))
                .collect::<Option<Vec<PeerId>>>()
                .ok_or(malformed("invalid successor id"))?;
            Ok(if kind == MessageKind::DepartNotice {
                Message::DepartNotice { peer, successors }
            } else {
                Message::SuccessorResponse { peer, successors }
            })
        }
        MessageKind::SuccessorRequest => match fields.as_slice() {
            [peer] => Ok(Message::SuccessorRequest {
                peer: parse_field(peer).ok_or(malformed("invalid peer id"))?,
            }),
            _ => Err(malformed("expected exactly one field")),
        },
        MessageKind::FileRequest => match fields.as_slice() {
            [requester, key] => Ok(Message::FileRequest {
                requester: parse_field(requester).ok_or(malformed("invalid requester id"))?,
                key: parse_field(key).ok_or(malformed("invalid file key"))?,
            }),
            _ => Err(malformed("expected two fields")),
        },
        MessageKind::FileResponse => match fields.as_slice() {
            [responder, key, found, requester] => {
                let found = match *found {
                    "0" => false,
                    "1" => true,
                    _ => return Err(malformed("found flag must be 0 or 1")),
                };
                Ok(Message::FileResponse(FileResponse {
                    responder: parse_field(responder).ok_or(malformed("invalid responder id"))?,
                    key: parse_field(key).ok_or(malformed("invalid file key"))?,
                    found,
                    requester: parse_field(requester).ok_or(malformed("invalid requester id"))?,
                }))
            }
            _ => Err(malformed("expected four fields")),
        },
        MessageKind::PingRequest | MessageKind::PingResponse => Err(DecodeError::UnknownKind),
    }
}

/// Parse a field consisting solely of ASCII digits.
fn parse_field<T: FromStr>(field: &str) -> Option<T> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}
