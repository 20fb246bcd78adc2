//! Link protocol messages and their CBOR encoding.

use std::collections::BTreeMap;
use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{
    Command, CommandKind, Limits, NodeAddress, NodeMetadata, QueueItem, QueueStatus,
    SynchronizationRequest, SynchronizationResponse, TransferRequest, TransferResponse,
};

pub const PROTOCOL_VERSION_V1: u32 = 1;

/// First message on every connection, sent by the dialer and echoed by the
/// acceptor with its own metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub magic: u64,
    pub metadata: NodeMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Handshake(Handshake),
    Command(Command),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Handshake,
    Command(CommandKind),
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Handshake => "HANDSHAKE",
            MessageType::Command(kind) => kind.as_str(),
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        if raw == "HANDSHAKE" {
            return Some(MessageType::Handshake);
        }
        CommandKind::parse(raw).map(MessageType::Command)
    }
}

impl WireMessage {
    fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Handshake(_) => MessageType::Handshake,
            WireMessage::Command(command) => MessageType::Command(command.kind()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown message type {0}")]
    UnknownMessageType(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR is not allowed")]
    IndefiniteLength,
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(PROTOCOL_VERSION_V1)?;
    enc.str("type")?;
    enc.str(message.message_type().as_str())?;
    enc.str("body")?;
    match message {
        WireMessage::Handshake(handshake) => encode_handshake(&mut enc, handshake)?,
        WireMessage::Command(command) => encode_command(&mut enc, command)?,
    }
    Ok(buf)
}

pub fn decode_message(bytes: &[u8], limits: &Limits) -> Result<WireMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "v" => version = Some(decode_u32(&mut dec, "v")?),
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                body_span = Some((start, dec.position()));
            }
            _ => skip_value(&mut dec)?,
        }
    }
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version != PROTOCOL_VERSION_V1 {
        return Err(ProtoDecodeError::UnsupportedVersion(version));
    }
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;

    let mut body = Decoder::new(&bytes[start..end]);
    let message = match message_type {
        MessageType::Handshake => WireMessage::Handshake(decode_handshake(&mut body, limits)?),
        MessageType::Command(kind) => {
            WireMessage::Command(decode_command(kind, &mut body, limits)?)
        }
    };
    if body.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(message)
}

fn encode_handshake(enc: &mut Enc<'_>, handshake: &Handshake) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("magic")?;
    enc.u64(handshake.magic)?;
    enc.str("metadata")?;
    encode_metadata(enc, &handshake.metadata)
}

fn decode_handshake(dec: &mut Decoder, limits: &Limits) -> Result<Handshake, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 0)?;
    let mut magic = None;
    let mut metadata = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "magic" => magic = Some(dec.u64()?),
            "metadata" => metadata = Some(decode_metadata(dec, limits, 1)?),
            _ => skip_value(dec)?,
        }
    }
    Ok(Handshake {
        magic: magic.ok_or(ProtoDecodeError::MissingField("magic"))?,
        metadata: metadata.ok_or(ProtoDecodeError::MissingField("metadata"))?,
    })
}

fn encode_command(enc: &mut Enc<'_>, command: &Command) -> Result<(), ProtoEncodeError> {
    match command {
        Command::LinkEstablish { target } => {
            enc.map(1)?;
            encode_target(enc, target)?;
        }
        Command::SyncRequest { target, request } => {
            enc.map(2)?;
            encode_target(enc, target)?;
            enc.str("payload")?;
            enc.bytes(&request.payload)?;
        }
        Command::SyncResponse { target, response } => {
            enc.map(2)?;
            encode_target(enc, target)?;
            enc.str("payload")?;
            enc.bytes(&response.payload)?;
        }
        Command::Status { target, metadata } => {
            enc.map(2)?;
            encode_target(enc, target)?;
            enc.str("metadata")?;
            encode_metadata(enc, metadata)?;
        }
        Command::TransferRequest { target, request } => {
            enc.map(4)?;
            encode_target(enc, target)?;
            enc.str("request_id")?;
            enc.u64(request.request_id)?;
            enc.str("item_id")?;
            enc.str(&request.item.id)?;
            enc.str("payload")?;
            enc.bytes(&request.item.payload)?;
        }
        Command::TransferResponse { target, response } => {
            let len = if response.status.is_some() { 4 } else { 3 };
            enc.map(len)?;
            encode_target(enc, target)?;
            enc.str("request_id")?;
            enc.u64(response.request_id)?;
            enc.str("accepted")?;
            enc.bool(response.accepted)?;
            if let Some(status) = &response.status {
                enc.str("status")?;
                encode_status(enc, status)?;
            }
        }
    }
    Ok(())
}

fn decode_command(
    kind: CommandKind,
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<Command, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 0)?;

    let mut target = None;
    let mut payload = None;
    let mut metadata = None;
    let mut request_id = None;
    let mut item_id = None;
    let mut accepted = None;
    let mut status = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "target" => target = Some(decode_address(dec, limits, "target")?),
            "payload" => {
                let max = match kind {
                    CommandKind::TransferRequest => limits.max_transfer_payload_bytes,
                    _ => limits.max_sync_payload_bytes,
                };
                let bytes = decode_bytes(dec, limits, "payload")?;
                if bytes.len() > max {
                    return Err(ProtoDecodeError::InvalidField {
                        field: "payload",
                        reason: format!("{} bytes exceeds limit {max}", bytes.len()),
                    });
                }
                payload = Some(Bytes::copy_from_slice(bytes));
            }
            "metadata" => metadata = Some(decode_metadata(dec, limits, 1)?),
            "request_id" => request_id = Some(dec.u64()?),
            "item_id" => item_id = Some(decode_text(dec, limits)?.to_string()),
            "accepted" => accepted = Some(dec.bool()?),
            "status" => status = Some(decode_status(dec, limits, 1)?),
            _ => skip_value(dec)?,
        }
    }

    let target = target.ok_or(ProtoDecodeError::MissingField("target"))?;
    let command = match kind {
        CommandKind::LinkEstablish => Command::LinkEstablish { target },
        CommandKind::SyncRequest => Command::SyncRequest {
            target,
            request: SynchronizationRequest {
                payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
            },
        },
        CommandKind::SyncResponse => Command::SyncResponse {
            target,
            response: SynchronizationResponse {
                payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
            },
        },
        CommandKind::Status => Command::Status {
            target,
            metadata: metadata.ok_or(ProtoDecodeError::MissingField("metadata"))?,
        },
        CommandKind::TransferRequest => Command::TransferRequest {
            target,
            request: TransferRequest {
                request_id: request_id.ok_or(ProtoDecodeError::MissingField("request_id"))?,
                item: QueueItem {
                    id: item_id.ok_or(ProtoDecodeError::MissingField("item_id"))?,
                    payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
                },
            },
        },
        CommandKind::TransferResponse => Command::TransferResponse {
            target,
            response: TransferResponse {
                request_id: request_id.ok_or(ProtoDecodeError::MissingField("request_id"))?,
                accepted: accepted.ok_or(ProtoDecodeError::MissingField("accepted"))?,
                status,
            },
        },
    };
    Ok(command)
}

fn encode_target(enc: &mut Enc<'_>, target: &NodeAddress) -> Result<(), ProtoEncodeError> {
    enc.str("target")?;
    enc.str(&target.to_string())?;
    Ok(())
}

fn encode_status(enc: &mut Enc<'_>, status: &QueueStatus) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("queue_length")?;
    enc.u64(status.queue_length)?;
    enc.str("max_queue_length")?;
    enc.u64(status.max_queue_length)?;
    enc.str("blocked")?;
    enc.bool(status.blocked)?;
    Ok(())
}

fn decode_status(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<QueueStatus, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut queue_length = None;
    let mut max_queue_length = None;
    let mut blocked = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "queue_length" => queue_length = Some(dec.u64()?),
            "max_queue_length" => max_queue_length = Some(dec.u64()?),
            "blocked" => blocked = Some(dec.bool()?),
            _ => skip_value(dec)?,
        }
    }
    Ok(QueueStatus {
        queue_length: queue_length.ok_or(ProtoDecodeError::MissingField("queue_length"))?,
        max_queue_length: max_queue_length
            .ok_or(ProtoDecodeError::MissingField("max_queue_length"))?,
        blocked: blocked.ok_or(ProtoDecodeError::MissingField("blocked"))?,
    })
}

fn encode_metadata(enc: &mut Enc<'_>, metadata: &NodeMetadata) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("status")?;
    encode_status(enc, &metadata.status)?;
    enc.str("extra")?;
    enc.map(metadata.extra.len() as u64)?;
    for (key, value) in &metadata.extra {
        enc.str(key)?;
        enc.str(value)?;
    }
    Ok(())
}

fn decode_metadata(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<NodeMetadata, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut status = None;
    let mut extra = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "status" => status = Some(decode_status(dec, limits, depth + 1)?),
            "extra" => {
                let len = decode_map_len(dec, limits, depth + 1)?;
                let mut entries = BTreeMap::new();
                for _ in 0..len {
                    let key = decode_text(dec, limits)?.to_string();
                    let value = decode_text(dec, limits)?.to_string();
                    entries.insert(key, value);
                }
                extra = Some(entries);
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(NodeMetadata {
        status: status.ok_or(ProtoDecodeError::MissingField("status"))?,
        extra: extra.unwrap_or_default(),
    })
}

fn decode_address(
    dec: &mut Decoder,
    limits: &Limits,
    field: &'static str,
) -> Result<NodeAddress, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    NodeAddress::parse(raw).map_err(|err| ProtoDecodeError::InvalidField {
        field,
        reason: err.to_string(),
    })
}

fn decode_map_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, ProtoDecodeError> {
    if depth > limits.max_cbor_depth {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_depth"));
    }
    let Some(len) = dec.map()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_map_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_map_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_cbor_map_entries"))
}

fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> Result<&'a str, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let text = dec.str()?;
    if text.len() > limits.max_cbor_text_string_len {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_text_string_len"));
    }
    Ok(text)
}

fn decode_bytes<'a>(
    dec: &mut Decoder<'a>,
    limits: &Limits,
    field: &'static str,
) -> Result<&'a [u8], ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_cbor_bytes_string_len {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: "bytes length exceeds limit".into(),
        });
    }
    Ok(bytes)
}

fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, ProtoDecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u32"),
    })
}

fn skip_value(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    if matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}
