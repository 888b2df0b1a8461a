//! Binary codec for control-channel frames.
//!
//! Wire format:
//! ```text
//! [channel:1][flags:1][length:2][message_id:2][payload:N]
//! ```
//! `length` counts the message id plus the payload (`2 + N`).  All multi-byte
//! integers are big-endian.  The codec operates on the *decrypted* stream;
//! encryption belongs to the secure transport.

use crate::protocol::messages::{
    AudioFocusRequest, AudioFocusResponse, AudioFocusState, AudioFocusType, ChannelDescriptor,
    ChannelId, ControlMessage, MessageId, NavigationFocusRequest, NavigationFocusResponse,
    NavigationFocusType, PingMessage, ServiceDiscoveryRequest, ServiceDiscoveryResponse,
    ShutdownReason, ShutdownRequest,
};
use thiserror::Error;
use tracing::trace;

/// Size of the fixed frame header preceding the message id.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Size of the message id that starts every frame body.
pub const MESSAGE_ID_SIZE: usize = 2;

/// First and last fragment bits; control messages are never fragmented.
pub const FLAG_BULK: u8 = 0x03;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The frame was addressed to a channel other than control.
    #[error("unexpected channel {0} on control stream")]
    UnexpectedChannel(u8),

    /// Fragmented frames are not used on the control channel.
    #[error("unsupported frame flags: 0x{0:02X}")]
    UnsupportedFlags(u8),

    /// The message id is not one of the control exchanges.
    #[error("unknown message id: 0x{0:04X}")]
    UnknownMessageId(u16),

    /// The payload could not be parsed (value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The encoded payload does not fit the 16-bit length field.
    #[error("payload of {0} bytes exceeds frame capacity")]
    PayloadTooLarge(usize),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`ControlMessage`] into one control-channel frame.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload does not fit in
/// a single frame.
///
/// # Examples
///
/// ```rust
/// use headunit_core::protocol::{decode_frame, encode_frame, ControlMessage, PingMessage};
///
/// let msg = ControlMessage::PingRequest(PingMessage { timestamp: 42 });
/// let bytes = encode_frame(&msg).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg);
    let body_len = MESSAGE_ID_SIZE + payload.len();
    let length = u16::try_from(body_len).map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + body_len);
    buf.push(ChannelId::Control as u8);
    buf.push(FLAG_BULK);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&(msg.message_id() as u16).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Returns the body length declared by a frame header.
///
/// Stream readers use this to learn how many bytes follow the header.
pub fn declared_body_len(header: &[u8; FRAME_HEADER_SIZE]) -> usize {
    u16::from_be_bytes([header[2], header[3]]) as usize
}

/// Decodes one [`ControlMessage`] from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed (header + body).
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are truncated or malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<(ControlMessage, usize), ProtocolError> {
    if bytes.len() < FRAME_HEADER_SIZE + MESSAGE_ID_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_HEADER_SIZE + MESSAGE_ID_SIZE,
            available: bytes.len(),
        });
    }

    let channel = bytes[0];
    if channel != ChannelId::Control as u8 {
        return Err(ProtocolError::UnexpectedChannel(channel));
    }

    let flags = bytes[1];
    if flags & FLAG_BULK != FLAG_BULK {
        return Err(ProtocolError::UnsupportedFlags(flags));
    }

    let body_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if body_len < MESSAGE_ID_SIZE {
        return Err(ProtocolError::MalformedPayload(format!(
            "frame body of {body_len} bytes cannot hold a message id"
        )));
    }

    let total = FRAME_HEADER_SIZE + body_len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let raw_id = u16::from_be_bytes([bytes[4], bytes[5]]);
    let id = MessageId::try_from(raw_id).map_err(|_| ProtocolError::UnknownMessageId(raw_id))?;
    let payload = &bytes[FRAME_HEADER_SIZE + MESSAGE_ID_SIZE..total];
    trace!(?id, payload_len = payload.len(), "decoding control frame");

    let msg = decode_payload(id, payload)?;
    Ok((msg, total))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &ControlMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg {
        ControlMessage::ServiceDiscoveryRequest(m) => {
            write_length_prefixed_string(&mut buf, &m.device_name);
            write_length_prefixed_string(&mut buf, &m.device_brand);
        }
        ControlMessage::ServiceDiscoveryResponse(m) => {
            let count = m.channels.len().min(u8::MAX as usize);
            buf.push(count as u8);
            for descriptor in &m.channels[..count] {
                buf.push(descriptor.channel_id as u8);
            }
        }
        ControlMessage::AudioFocusRequest(m) => buf.push(m.focus_type as u8),
        ControlMessage::AudioFocusResponse(m) => buf.push(m.state as u8),
        ControlMessage::NavigationFocusRequest(m) => buf.push(m.focus_type as u8),
        ControlMessage::NavigationFocusResponse(m) => buf.push(m.focus_type as u8),
        ControlMessage::PingRequest(m) | ControlMessage::PingResponse(m) => {
            buf.extend_from_slice(&m.timestamp.to_be_bytes());
        }
        ControlMessage::ShutdownRequest(m) => buf.push(m.reason as u8),
        ControlMessage::ShutdownResponse => {} // empty payload
    }
    buf
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(id: MessageId, p: &[u8]) -> Result<ControlMessage, ProtocolError> {
    let (msg, consumed) = match id {
        MessageId::ServiceDiscoveryRequest => {
            let (device_name, offset) = read_length_prefixed_string(p, 0)?;
            let (device_brand, offset) = read_length_prefixed_string(p, offset)?;
            (
                ControlMessage::ServiceDiscoveryRequest(ServiceDiscoveryRequest {
                    device_name,
                    device_brand,
                }),
                offset,
            )
        }
        MessageId::ServiceDiscoveryResponse => {
            require_len(p, 1, "ServiceDiscoveryResponse")?;
            let count = p[0] as usize;
            require_len(p, 1 + count, "ServiceDiscoveryResponse channels")?;
            let channels = p[1..1 + count]
                .iter()
                .map(|&raw| {
                    ChannelId::try_from(raw)
                        .map(|channel_id| ChannelDescriptor { channel_id })
                        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown channel id: {raw}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            (
                ControlMessage::ServiceDiscoveryResponse(ServiceDiscoveryResponse { channels }),
                1 + count,
            )
        }
        MessageId::AudioFocusRequest => {
            let focus_type = read_enum(p, AudioFocusType::try_from, "audio focus type")?;
            (ControlMessage::AudioFocusRequest(AudioFocusRequest { focus_type }), 1)
        }
        MessageId::AudioFocusResponse => {
            let state = read_enum(p, AudioFocusState::try_from, "audio focus state")?;
            (ControlMessage::AudioFocusResponse(AudioFocusResponse { state }), 1)
        }
        MessageId::NavigationFocusRequest => {
            let focus_type = read_enum(p, NavigationFocusType::try_from, "navigation focus type")?;
            (
                ControlMessage::NavigationFocusRequest(NavigationFocusRequest { focus_type }),
                1,
            )
        }
        MessageId::NavigationFocusResponse => {
            let focus_type = read_enum(p, NavigationFocusType::try_from, "navigation focus type")?;
            (
                ControlMessage::NavigationFocusResponse(NavigationFocusResponse { focus_type }),
                1,
            )
        }
        MessageId::PingRequest => {
            let timestamp = read_i64(p, 0)?;
            (ControlMessage::PingRequest(PingMessage { timestamp }), 8)
        }
        MessageId::PingResponse => {
            let timestamp = read_i64(p, 0)?;
            (ControlMessage::PingResponse(PingMessage { timestamp }), 8)
        }
        MessageId::ShutdownRequest => {
            let reason = read_enum(p, ShutdownReason::try_from, "shutdown reason")?;
            (ControlMessage::ShutdownRequest(ShutdownRequest { reason }), 1)
        }
        MessageId::ShutdownResponse => (ControlMessage::ShutdownResponse, 0),
    };

    if consumed != p.len() {
        return Err(ProtocolError::MalformedPayload(format!(
            "{id:?}: {} trailing byte(s)",
            p.len() - consumed
        )));
    }
    Ok(msg)
}

// ── Primitive helpers ─────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_enum<T>(
    buf: &[u8],
    convert: impl Fn(u8) -> Result<T, ()>,
    context: &str,
) -> Result<T, ProtocolError> {
    require_len(buf, 1, context)?;
    convert(buf[0]).map_err(|_| ProtocolError::MalformedPayload(format!("unknown {context}: {}", buf[0])))
}

fn read_i64(buf: &[u8], offset: usize) -> Result<i64, ProtocolError> {
    let end = offset + 8;
    let bytes: [u8; 8] = buf
        .get(offset..end)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::InsufficientData {
            needed: end,
            available: buf.len(),
        })?;
    Ok(i64::from_be_bytes(bytes))
}

/// Strings longer than `u16::MAX` bytes cannot fit in a frame; the oversized
/// body makes [`encode_frame`] return [`ProtocolError::PayloadTooLarge`].
fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let len = u16::try_from(s.len()).unwrap_or(u16::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_length_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
