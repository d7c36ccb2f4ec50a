//! Pure MQTT 3.1.1 packet construction and parsing
//!
//! Builders take an options struct and return wire bytes; the parser consumes
//! an accumulation buffer and yields decoded packets. Neither side performs
//! I/O or touches shared state, which keeps the whole wire format testable
//! byte-for-byte without a broker.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// MQTT control packet type codes (fixed header, high nibble).
pub mod packet_type {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const UNSUBSCRIBE: u8 = 10;
    pub const UNSUBACK: u8 = 11;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

/// Largest value representable by the 4-byte remaining-length encoding.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Quality of Service levels. Only 0 and 1 are exercised by the distributor;
/// 2 exists so inbound packets advertising it still parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, PacketError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(PacketError::InvalidQoS(other)),
        }
    }
}

/// Wire-format errors produced by the builder or parser.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("remaining length {0} exceeds MQTT maximum of {MAX_REMAINING_LENGTH}")]
    RemainingLengthTooLarge(usize),
    #[error("malformed remaining length (continuation past 4 bytes)")]
    MalformedRemainingLength,
    #[error("string field of {0} bytes exceeds u16 length prefix")]
    StringTooLong(usize),
    #[error("invalid QoS value {0}")]
    InvalidQoS(u8),
    #[error("unexpected packet type {0}")]
    UnexpectedType(u8),
    #[error("malformed {0} packet")]
    Malformed(&'static str),
}

/// Encode a remaining-length value as the MQTT variable-length integer
/// (1-4 bytes, continuation bit 0x80 on every byte except the last).
pub fn encode_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<(), PacketError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(PacketError::RemainingLengthTooLarge(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Decode a remaining-length value from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer ends mid-varint (more bytes needed),
/// `Ok(Some((value, consumed)))` on success. Does not advance the buffer.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, PacketError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(PacketError::MalformedRemainingLength);
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        return Err(PacketError::MalformedRemainingLength);
    }
    Ok(None)
}

/// Number of bytes the remaining-length encoding of `len` occupies.
fn remaining_length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), PacketError> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(PacketError::StringTooLong(bytes.len()));
    }
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

fn string_field_len(s: &str) -> usize {
    2 + s.len()
}

/// Options for building a CONNECT packet.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
}

/// Options for building a PUBLISH packet.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Required when `qos > 0`; ignored for QoS 0.
    pub packet_id: u16,
}

/// Build a CONNECT packet per MQTT 3.1.1 section 3.1.
pub fn build_connect(opts: &ConnectOptions) -> Result<Bytes, PacketError> {
    let mut remaining = string_field_len("MQTT") + 1 + 1 + 2 + string_field_len(&opts.client_id);
    if let Some(ref u) = opts.username {
        remaining += string_field_len(u);
    }
    if let Some(ref p) = opts.password {
        remaining += string_field_len(p);
    }

    let mut buf = BytesMut::with_capacity(1 + remaining_length_size(remaining) + remaining);
    buf.put_u8((packet_type::CONNECT) << 4);
    encode_remaining_length(&mut buf, remaining)?;

    // Variable header: protocol name, level, connect flags, keep-alive
    buf.put_u16(PROTOCOL_NAME.len() as u16);
    buf.put_slice(PROTOCOL_NAME);
    buf.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if opts.clean_session {
        flags |= 0x02;
    }
    if opts.username.is_some() {
        flags |= 0x80;
    }
    if opts.password.is_some() {
        flags |= 0x40;
    }
    buf.put_u8(flags);
    buf.put_u16(opts.keep_alive_secs);

    // Payload: client id, then credentials iff flagged
    put_string(&mut buf, &opts.client_id)?;
    if let Some(ref u) = opts.username {
        put_string(&mut buf, u)?;
    }
    if let Some(ref p) = opts.password {
        put_string(&mut buf, p)?;
    }

    Ok(buf.freeze())
}

/// Build a PUBLISH packet per MQTT 3.1.1 section 3.3.
///
/// The packet identifier field is present iff `qos > 0`.
pub fn build_publish(opts: &PublishOptions) -> Result<Bytes, PacketError> {
    let id_len = if opts.qos == QoS::AtMostOnce { 0 } else { 2 };
    let remaining = string_field_len(&opts.topic) + id_len + opts.payload.len();

    let mut buf = BytesMut::with_capacity(1 + remaining_length_size(remaining) + remaining);
    let mut first = (packet_type::PUBLISH << 4) | ((opts.qos as u8) << 1);
    if opts.retain {
        first |= 0x01;
    }
    buf.put_u8(first);
    encode_remaining_length(&mut buf, remaining)?;

    put_string(&mut buf, &opts.topic)?;
    if opts.qos != QoS::AtMostOnce {
        buf.put_u16(opts.packet_id);
    }
    buf.put_slice(&opts.payload);

    Ok(buf.freeze())
}

/// Build a PUBACK packet: fixed header + packet identifier.
pub fn build_puback(packet_id: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(packet_type::PUBACK << 4);
    buf.put_u8(2);
    buf.put_u16(packet_id);
    buf.freeze()
}

/// Build a SUBSCRIBE packet. Fixed-header flags are mandated 0x02.
pub fn build_subscribe(packet_id: u16, topics: &[(String, QoS)]) -> Result<Bytes, PacketError> {
    let remaining = 2 + topics
        .iter()
        .map(|(t, _)| string_field_len(t) + 1)
        .sum::<usize>();

    let mut buf = BytesMut::with_capacity(1 + remaining_length_size(remaining) + remaining);
    buf.put_u8((packet_type::SUBSCRIBE << 4) | 0x02);
    encode_remaining_length(&mut buf, remaining)?;
    buf.put_u16(packet_id);
    for (topic, qos) in topics {
        put_string(&mut buf, topic)?;
        buf.put_u8(*qos as u8);
    }
    Ok(buf.freeze())
}

/// Build an UNSUBSCRIBE packet. Fixed-header flags are mandated 0x02.
pub fn build_unsubscribe(packet_id: u16, topics: &[String]) -> Result<Bytes, PacketError> {
    let remaining = 2 + topics.iter().map(|t| string_field_len(t)).sum::<usize>();

    let mut buf = BytesMut::with_capacity(1 + remaining_length_size(remaining) + remaining);
    buf.put_u8((packet_type::UNSUBSCRIBE << 4) | 0x02);
    encode_remaining_length(&mut buf, remaining)?;
    buf.put_u16(packet_id);
    for topic in topics {
        put_string(&mut buf, topic)?;
    }
    Ok(buf.freeze())
}

/// Build a PINGREQ packet (0xC0 0x00).
pub fn build_pingreq() -> Bytes {
    Bytes::from_static(&[packet_type::PINGREQ << 4, 0])
}

/// Build a DISCONNECT packet (0xE0 0x00).
pub fn build_disconnect() -> Bytes {
    Bytes::from_static(&[packet_type::DISCONNECT << 4, 0])
}

/// Decoded inbound packet, covering everything a client-side read loop sees.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingPacket {
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        packet_id: Option<u16>,
    },
    PubAck {
        packet_id: u16,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingResp,
}

/// Try to decode one packet from the front of `buf`.
///
/// On success the consumed bytes are drained from `buf`. `Ok(None)` means
/// more bytes are needed; callers keep the buffer and read again.
pub fn parse_packet(buf: &mut BytesMut) -> Result<Option<IncomingPacket>, PacketError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[0];
    let (remaining, header_len) = match decode_remaining_length(&buf[1..])? {
        Some(v) => v,
        None => return Ok(None),
    };
    let total = 1 + header_len + remaining;
    if buf.len() < total {
        return Ok(None);
    }

    let mut packet = buf.split_to(total);
    packet.advance(1 + header_len);
    debug_assert_eq!(packet.len(), remaining);

    let ptype = first >> 4;
    match ptype {
        packet_type::CONNACK => {
            if packet.len() != 2 {
                return Err(PacketError::Malformed("CONNACK"));
            }
            Ok(Some(IncomingPacket::ConnAck {
                session_present: packet[0] & 0x01 != 0,
                return_code: packet[1],
            }))
        }
        packet_type::PUBLISH => {
            let qos = QoS::from_u8((first >> 1) & 0x03)?;
            let retain = first & 0x01 != 0;
            if packet.len() < 2 {
                return Err(PacketError::Malformed("PUBLISH"));
            }
            let topic_len = packet.get_u16() as usize;
            if packet.len() < topic_len {
                return Err(PacketError::Malformed("PUBLISH"));
            }
            let topic_bytes = packet.split_to(topic_len);
            let topic = String::from_utf8(topic_bytes.to_vec())
                .map_err(|_| PacketError::Malformed("PUBLISH"))?;
            let packet_id = if qos != QoS::AtMostOnce {
                if packet.len() < 2 {
                    return Err(PacketError::Malformed("PUBLISH"));
                }
                Some(packet.get_u16())
            } else {
                None
            };
            Ok(Some(IncomingPacket::Publish {
                topic,
                payload: packet.freeze(),
                qos,
                retain,
                packet_id,
            }))
        }
        packet_type::PUBACK => {
            if packet.len() != 2 {
                return Err(PacketError::Malformed("PUBACK"));
            }
            Ok(Some(IncomingPacket::PubAck {
                packet_id: packet.get_u16(),
            }))
        }
        packet_type::SUBACK => {
            if packet.len() < 3 {
                return Err(PacketError::Malformed("SUBACK"));
            }
            let packet_id = packet.get_u16();
            Ok(Some(IncomingPacket::SubAck {
                packet_id,
                return_codes: packet.to_vec(),
            }))
        }
        packet_type::UNSUBACK => {
            if packet.len() != 2 {
                return Err(PacketError::Malformed("UNSUBACK"));
            }
            Ok(Some(IncomingPacket::UnsubAck {
                packet_id: packet.get_u16(),
            }))
        }
        packet_type::PINGRESP => Ok(Some(IncomingPacket::PingResp)),
        other => Err(PacketError::UnexpectedType(other)),
    }
}
