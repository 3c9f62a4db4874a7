//! MQTT Packet Decoder
//!
//! Incremental v3.1.1 decoder: `decode` returns `Ok(None)` while the
//! buffer holds only a partial frame, so a connection can accumulate
//! bytes across any number of reads and resume at the exact offset it
//! left off. The declared Remaining Length is checked against the
//! configured maximum before the body is awaited, so an oversized
//! request fails with zero body bytes consumed.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription, UnsubAck,
    Unsubscribe, Will,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum accepted remaining length
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

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), or None if the frame is incomplete
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Fixed header: 4-bit type plus per-type flag bits
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        // Remaining length
        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Size limit is enforced before waiting for the body
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body_start = 1 + len_bytes;
        let body = &buf[body_start..total_len];

        // Unknown type nibbles are a hard error; everything else goes
        // through an exhaustive dispatch over the packet kind
        let kind = PacketType::from_u8(packet_type)
            .ok_or(DecodeError::InvalidPacketType(packet_type))?;

        let packet = match kind {
            PacketType::Connect => decode_connect(body)?,
            PacketType::ConnAck => decode_connack(flags, body)?,
            PacketType::Publish => decode_publish(flags, body)?,
            PacketType::PubAck => Packet::PubAck(PubAck::new(decode_ack(flags, 0, body)?)),
            PacketType::PubRec => Packet::PubRec(PubRec::new(decode_ack(flags, 0, body)?)),
            PacketType::PubRel => Packet::PubRel(PubRel::new(decode_ack(flags, 0x02, body)?)),
            PacketType::PubComp => Packet::PubComp(PubComp::new(decode_ack(flags, 0, body)?)),
            PacketType::Subscribe => decode_subscribe(flags, body)?,
            PacketType::SubAck => decode_suback(flags, body)?,
            PacketType::Unsubscribe => decode_unsubscribe(flags, body)?,
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::new(decode_ack(flags, 0, body)?)),
            PacketType::PingReq => decode_empty(flags, body, Packet::PingReq)?,
            PacketType::PingResp => decode_empty(flags, body, Packet::PingResp)?,
            PacketType::Disconnect => decode_empty(flags, body, Packet::Disconnect)?,
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_connect(body: &[u8]) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    // Protocol name
    let (protocol_name, len) = read_string(&body[pos..])?;
    pos += len;

    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(DecodeError::InvalidProtocolName);
    }

    // Protocol level (validated by the connection handler so it can
    // answer with CONNACK 0x01 instead of dropping silently)
    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let protocol_level = body[pos];
    pos += 1;

    // Connect flags
    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = body[pos];
    pos += 1;

    // Per MQTT-3.1.2-3: reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // Per MQTT-3.1.2-22: if username flag is 0, password flag must be 0
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    if will_qos > 2 {
        return Err(DecodeError::InvalidQoS(will_qos));
    }

    // If will flag is 0, will QoS and will retain must be 0
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    // Keep alive
    let keep_alive = read_u16(&body[pos..])?;
    pos += 2;

    // Client ID
    let (client_id, len) = read_string(&body[pos..])?;
    pos += len;

    // Will topic and will message
    let will = if will_flag {
        let (will_topic, len) = read_string(&body[pos..])?;
        pos += len;

        let (will_payload, len) = read_binary(&body[pos..])?;
        pos += len;

        Some(Will {
            topic: will_topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            qos: QoS::from_u8(will_qos).unwrap(),
            retain: will_retain,
        })
    } else {
        None
    };

    // Username
    let username = if username_flag {
        let (s, len) = read_string(&body[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    // Password
    let password = if password_flag {
        let (data, _len) = read_binary(&body[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

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

    if body.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let acknowledge_flags = body[0];
    // Only bit 0 (session present) is valid, the rest must be 0
    if (acknowledge_flags & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code =
        ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (acknowledge_flags & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    // Per MQTT-3.3.1-2: DUP must be 0 for QoS 0
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;

    // Topic name
    let (topic, len) = read_string(&body[pos..])?;
    pos += len;

    // Per MQTT-3.3.2-2: no wildcards in a topic name
    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    // Packet ID, present only for QoS > 0
    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    // Payload is whatever remains of the declared length; may be empty
    // and may contain embedded NUL bytes
    let payload = Bytes::copy_from_slice(&body[pos..]);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload,
    }))
}

/// Shared decoder for the four acknowledgement kinds: flag check plus a
/// 2-byte packet identifier
fn decode_ack(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }
    read_u16(body)
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // Per MQTT-3.8.1-1: SUBSCRIBE must have flags 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;

    // Tuples repeat until the declared length is exhausted
    let mut subscriptions = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;

        // Per MQTT-4.7.3-1: topic filter cannot be empty
        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }

        if pos >= body.len() {
            return Err(DecodeError::InsufficientData);
        }

        let qos_byte = body[pos];
        pos += 1;

        // Per MQTT-3-8.3-4: upper six bits of the requested QoS byte are
        // reserved and must be 0
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;

        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    // Per MQTT-3.8.3-3: at least one tuple is required
    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    if body.len() < 3 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = read_u16(body)?;

    let mut return_codes = Vec::with_capacity(body.len() - 2);
    for &code in &body[2..] {
        return_codes
            .push(SubscribeReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?);
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // Per MQTT-3.10.1-1: UNSUBSCRIBE must have flags 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;

    let mut filters = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;

        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }

        filters.push(filter.to_string());
    }

    // Per MQTT-3.10.3-2: at least one filter is required
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

/// PINGREQ, PINGRESP and DISCONNECT carry no body in v3.1.1
fn decode_empty(flags: u8, body: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !body.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected payload"));
    }
    Ok(packet)
}
