//! MQTT Packet Decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe, Will,
    PROTOCOL_LEVEL_V31, PROTOCOL_LEVEL_V311,
};

/// MQTT v3.1.1 Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a complete packet is buffered, otherwise
    /// the packet and the number of bytes it occupied.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => decode_connect(flags, body)?,
            2 => decode_connack(flags, body)?,
            3 => decode_publish(flags, body)?,
            4 => Packet::PubAck(PubAck {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            5 => Packet::PubRec(PubRec {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            6 => Packet::PubRel(PubRel {
                packet_id: decode_ack(flags, 0x02, body)?,
            }),
            7 => Packet::PubComp(PubComp {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            8 => decode_subscribe(flags, body)?,
            9 => decode_suback(flags, body)?,
            10 => decode_unsubscribe(flags, body)?,
            11 => Packet::UnsubAck(UnsubAck {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            12 => {
                expect_empty(flags, body)?;
                Packet::PingReq
            }
            13 => {
                expect_empty(flags, body)?;
                Packet::PingResp
            }
            14 => {
                expect_empty(flags, body)?;
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_empty(flags: u8, body: &[u8]) -> Result<(), DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !body.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected payload"));
    }
    Ok(())
}

/// PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK share one layout
fn decode_ack(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("acknowledgment must be 2 bytes"));
    }
    read_u16(body)
}

fn non_zero_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    let id = read_u16(body)?;
    if id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    Ok(id)
}

fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let mut pos = 0;

    let (protocol_name, len) = read_string(body)?;
    pos += len;

    let protocol_level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
    pos += 1;

    match (protocol_name, protocol_level) {
        ("MQTT", PROTOCOL_LEVEL_V311) | ("MQIsdp", PROTOCOL_LEVEL_V31) => {}
        ("MQTT", other) | ("MQIsdp", other) => {
            return Err(DecodeError::InvalidProtocolVersion(other))
        }
        _ => return Err(DecodeError::InvalidProtocolName),
    }

    let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
    pos += 1;

    // [MQTT-3.1.2-3] reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // [MQTT-3.1.2-22]
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = read_u16(&body[pos..])?;
    pos += 2;

    let (client_id, len) = read_string(&body[pos..])?;
    pos += len;

    let will = if will_flag {
        let (topic, len) = read_string(&body[pos..])?;
        pos += len;
        let (payload, len) = read_binary(&body[pos..])?;
        pos += len;
        Some(Will {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&body[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, len) = read_binary(&body[pos..])?;
        pos += len;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    if pos != body.len() {
        return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
    }

    Ok(Packet::Connect(Box::new(Connect {
        protocol_level,
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
    }
    if (body[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code =
        ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (body[0] & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    // [MQTT-3.3.1-2]
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let (topic, mut pos) = read_string(body)?;

    if topic.is_empty() {
        return Err(DecodeError::MalformedPacket("topic name cannot be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = non_zero_packet_id(&body[pos..])?;
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
    }))
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // [MQTT-3.8.1-1]
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = non_zero_packet_id(body)?;
    let mut pos = 2;

    let mut topics = Vec::new();
    while pos < body.len() {
        let (topic, len) = read_string(&body[pos..])?;
        pos += len;

        if topic.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }

        let options = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // [MQTT-3-8.3-4] upper six bits are reserved
        if (options & 0xFC) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;

        topics.push((topic.to_string(), qos));
    }

    // [MQTT-3.8.3-3]
    if topics.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() < 3 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = read_u16(body)?;
    let return_codes = body[2..]
        .iter()
        .map(|&code| SubAckReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // [MQTT-3.10.1-1]
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = non_zero_packet_id(body)?;
    let mut pos = 2;

    let mut topics = Vec::new();
    while pos < body.len() {
        let (topic, len) = read_string(&body[pos..])?;
        pos += len;

        if topic.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }

        topics.push(topic.to_string());
    }

    // [MQTT-3.10.3-2]
    if topics.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}
