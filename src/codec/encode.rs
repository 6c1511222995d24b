//! MQTT Packet Encoder
//!
//! Encodes MQTT v3.1.1 packets. The broker encodes every outbound packet
//! through this type, and cluster links use it to speak to peers as a client.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => encode_packet_id(buf, 0x40, p.packet_id),
            Packet::PubRec(p) => encode_packet_id(buf, 0x50, p.packet_id),
            Packet::PubRel(p) => encode_packet_id(buf, 0x62, p.packet_id),
            Packet::PubComp(p) => encode_packet_id(buf, 0x70, p.packet_id),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_packet_id(buf, 0xB0, p.packet_id),
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
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let protocol_name = if packet.protocol_level == crate::protocol::PROTOCOL_LEVEL_V31 {
            "MQIsdp"
        } else {
            "MQTT"
        };

        // name + level + flags + keep alive
        let mut remaining_length = 2 + protocol_name.len() + 1 + 1 + 2;
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref will) = packet.will {
            remaining_length += 2 + will.topic.len();
            remaining_length += 2 + will.payload.len();
        }
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, protocol_name)?;
        buf.put_u8(packet.protocol_level);

        let mut connect_flags: u8 = 0;
        if packet.clean_session {
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

        write_string(buf, &packet.client_id)?;
        if let Some(ref will) = packet.will {
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

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20);
        buf.put_u8(0x02);
        buf.put_u8(packet.session_present as u8);
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len() + packet.payload.len();
        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }

        let mut first_byte = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup {
            first_byte |= 0x08;
        }
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.reserve(1 + 4 + remaining_length);
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, &packet.topic)?;

        if packet.qos != QoS::AtMostOnce {
            let packet_id = packet.packet_id.ok_or(EncodeError::MissingPacketId)?;
            buf.put_u16(packet_id);
        }

        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet
            .filters
            .iter()
            .map(|f| 2 + f.filter.len() + 1)
            .sum::<usize>();

        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for f in &packet.filters {
            write_string(buf, &f.filter)?;
            buf.put_u8(f.qos as u8);
        }
        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x90);
        write_variable_int(buf, (2 + packet.return_codes.len()) as u32)?;
        buf.put_u16(packet.packet_id);
        for code in &packet.return_codes {
            buf.put_u8(*code as u8);
        }
        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.filters.iter().map(|f| 2 + f.len()).sum::<usize>();

        buf.put_u8(0xA2);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }
        Ok(())
    }
}

fn encode_packet_id(buf: &mut BytesMut, first_byte: u8, packet_id: u16) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}
