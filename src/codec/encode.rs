//! MQTT v5.0 packet encoder

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{
    Auth, ConnAck, Connect, Disconnect, EncodeError, Packet, Properties, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe, PROTOCOL_LEVEL,
};

/// MQTT v5.0 packet encoder
#[derive(Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => encode_ack(0x40, p.packet_id, p.reason_code, &p.properties, buf),
            Packet::PubRec(p) => encode_ack(0x50, p.packet_id, p.reason_code, &p.properties, buf),
            Packet::PubRel(p) => encode_ack(0x62, p.packet_id, p.reason_code, &p.properties, buf),
            Packet::PubComp(p) => encode_ack(0x70, p.packet_id, p.reason_code, &p.properties, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_unsuback(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect(p) => encode_disconnect(p, buf),
            Packet::Auth(p) => encode_auth(p, buf),
        }
    }
}

fn props_block_len(props: &Properties) -> usize {
    let len = props.encoded_size();
    variable_int_len(len as u32) + len
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // protocol name + level + connect flags + keep alive
    let mut remaining = 6 + 1 + 1 + 2;
    remaining += props_block_len(&packet.properties);
    remaining += 2 + packet.client_id.len();

    if let Some(ref will) = packet.will {
        remaining += props_block_len(&will.properties);
        remaining += 2 + will.topic.len();
        remaining += 2 + will.payload.len();
    }
    if let Some(ref username) = packet.username {
        remaining += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining += 2 + password.len();
    }

    buf.put_u8(0x10);
    write_variable_int(buf, remaining as u32)?;

    write_string(buf, "MQTT")?;
    buf.put_u8(PROTOCOL_LEVEL);

    let mut connect_flags: u8 = 0;
    if packet.clean_start {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);
    packet.properties.encode(buf)?;
    write_string(buf, &packet.client_id)?;

    if let Some(ref will) = packet.will {
        will.properties.encode(buf)?;
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining = 2 + props_block_len(&packet.properties);

    buf.put_u8(0x20);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
    buf.put_u8(packet.reason_code as u8);
    packet.properties.encode(buf)?;

    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2 + packet.topic.len();
    if packet.qos != QoS::AtMostOnce {
        remaining += 2;
    }
    remaining += props_block_len(&packet.properties);
    remaining += packet.payload.len();

    let mut first_byte: u8 = 0x30;
    if packet.dup {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }
    buf.put_u8(first_byte);
    write_variable_int(buf, remaining as u32)?;

    write_string(buf, &packet.topic)?;
    if let Some(packet_id) = packet.packet_id {
        buf.put_u16(packet_id);
    }
    packet.properties.encode(buf)?;
    buf.put_slice(&packet.payload);

    Ok(())
}

/// Shared layout of PUBACK / PUBREC / PUBREL / PUBCOMP. The reason code and
/// properties are omitted entirely (two-byte short form) when the reason is
/// Success and no properties are present.
fn encode_ack(
    first_byte: u8,
    packet_id: u16,
    reason_code: ReasonCode,
    properties: &Properties,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if reason_code == ReasonCode::Success && properties.is_empty() {
        buf.put_u8(first_byte);
        buf.put_u8(0x02);
        buf.put_u16(packet_id);
        return Ok(());
    }

    let props_len = properties.encoded_size();
    let remaining = if props_len > 0 {
        2 + 1 + variable_int_len(props_len as u32) + props_len
    } else {
        2 + 1
    };

    buf.put_u8(first_byte);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u16(packet_id);
    buf.put_u8(reason_code as u8);
    if props_len > 0 {
        properties.encode(buf)?;
    }

    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2 + props_block_len(&packet.properties);
    for sub in &packet.subscriptions {
        remaining += 2 + sub.filter.len() + 1;
    }

    buf.put_u8(0x82); // SUBSCRIBE with fixed flags 0010
    write_variable_int(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);
    packet.properties.encode(buf)?;

    for sub in &packet.subscriptions {
        write_string(buf, &sub.filter)?;
        buf.put_u8(sub.options.to_byte());
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining = 2 + props_block_len(&packet.properties) + packet.reason_codes.len();

    buf.put_u8(0x90);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);
    packet.properties.encode(buf)?;
    for code in &packet.reason_codes {
        buf.put_u8(*code as u8);
    }

    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2 + props_block_len(&packet.properties);
    for filter in &packet.filters {
        remaining += 2 + filter.len();
    }

    buf.put_u8(0xA2); // UNSUBSCRIBE with fixed flags 0010
    write_variable_int(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);
    packet.properties.encode(buf)?;
    for filter in &packet.filters {
        write_string(buf, filter)?;
    }

    Ok(())
}

fn encode_unsuback(packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining = 2 + props_block_len(&packet.properties) + packet.reason_codes.len();

    buf.put_u8(0xB0);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);
    packet.properties.encode(buf)?;
    for code in &packet.reason_codes {
        buf.put_u8(*code as u8);
    }

    Ok(())
}

fn encode_disconnect(packet: &Disconnect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    if packet.reason_code == ReasonCode::Success && packet.properties.is_empty() {
        buf.put_u8(0xE0);
        buf.put_u8(0x00);
        return Ok(());
    }

    let props_len = packet.properties.encoded_size();
    let remaining = if props_len > 0 {
        1 + variable_int_len(props_len as u32) + props_len
    } else {
        1
    };

    buf.put_u8(0xE0);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u8(packet.reason_code as u8);
    if props_len > 0 {
        packet.properties.encode(buf)?;
    }

    Ok(())
}

fn encode_auth(packet: &Auth, buf: &mut BytesMut) -> Result<(), EncodeError> {
    if packet.reason_code == ReasonCode::Success && packet.properties.is_empty() {
        buf.put_u8(0xF0);
        buf.put_u8(0x00);
        return Ok(());
    }

    let props_len = packet.properties.encoded_size();
    let remaining = if props_len > 0 {
        1 + variable_int_len(props_len as u32) + props_len
    } else {
        1
    };

    buf.put_u8(0xF0);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u8(packet.reason_code as u8);
    if props_len > 0 {
        packet.properties.encode(buf)?;
    }

    Ok(())
}
