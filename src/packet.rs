//! # MQTT Packet Structures and Serialization
//!
//! This module defines the MQTT 3.1.1 control packets and the traits for
//! encoding and decoding them to and from a byte buffer. It is the wire-level
//! layer underneath the client; everything above it works with decoded packets.

use crate::client::LastWill;
use crate::error::{MqttError, ProtocolError};
use crate::transport;
use crate::util::{self, read_utf8_string, write_binary, write_utf8_string};
use heapless::Vec;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// A trait for packets that can be encoded into a byte buffer.
pub trait EncodePacket {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<transport::ErrorPlaceHolder>>;
}

/// A trait for packets that can be decoded from a byte buffer.
pub trait DecodePacket<'a>: Sized {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<transport::ErrorPlaceHolder>>;
}

/// An enumeration of the control packets a broker can send to the client.
#[derive(Debug)]
pub enum MqttPacket<'a> {
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    SubAck(SubAck),
    UnsubAck(UnsubAck),
    PingResp,
}

/// Decodes a raw byte buffer holding one complete packet into an [`MqttPacket`].
pub fn decode<'a, T>(buf: &'a [u8]) -> Result<Option<MqttPacket<'a>>, MqttError<T>>
where
    T: transport::TransportError,
{
    if buf.is_empty() {
        return Ok(None);
    }

    let packet_type = buf[0] >> 4;
    let packet = match packet_type {
        2 => MqttPacket::ConnAck(ConnAck::decode(buf).map_err(MqttError::cast_transport_error)?),
        3 => MqttPacket::Publish(Publish::decode(buf).map_err(MqttError::cast_transport_error)?),
        4 => MqttPacket::PubAck(PubAck::decode(buf).map_err(MqttError::cast_transport_error)?),
        5 => MqttPacket::PubRec(PubRec::decode(buf).map_err(MqttError::cast_transport_error)?),
        6 => MqttPacket::PubRel(PubRel::decode(buf).map_err(MqttError::cast_transport_error)?),
        7 => MqttPacket::PubComp(PubComp::decode(buf).map_err(MqttError::cast_transport_error)?),
        9 => MqttPacket::SubAck(SubAck::decode(buf).map_err(MqttError::cast_transport_error)?),
        11 => {
            MqttPacket::UnsubAck(UnsubAck::decode(buf).map_err(MqttError::cast_transport_error)?)
        }
        13 => MqttPacket::PingResp,
        _ => {
            return Err(MqttError::Protocol(ProtocolError::InvalidPacketType(
                packet_type,
            )));
        }
    };

    Ok(Some(packet))
}

// --- CONNECT Packet ---

/// The CONNECT packet, carrying the cached connect info including the last will.
#[derive(Debug)]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub last_will: Option<LastWill<'a>>,
}

impl<'a> EncodePacket for Connect<'a> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
        if buf.len() < 16 {
            return Err(MqttError::BufferTooSmall);
        }
        let mut cursor = 0;
        buf[cursor] = 0x10;
        cursor += 1;
        let remaining_len_pos = cursor;
        cursor += 4;
        let content_start = cursor;

        cursor += write_utf8_string(&mut buf[cursor..], "MQTT")?;
        // Protocol level 4 = MQTT 3.1.1
        buf[cursor] = 4;
        cursor += 1;

        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.last_will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        buf[cursor] = flags;
        cursor += 1;

        buf[cursor..cursor + 2].copy_from_slice(&self.keep_alive.to_be_bytes());
        cursor += 2;

        cursor += write_utf8_string(&mut buf[cursor..], self.client_id)?;
        if let Some(will) = &self.last_will {
            cursor += write_utf8_string(&mut buf[cursor..], will.topic)?;
            cursor += write_binary(&mut buf[cursor..], will.message)?;
        }
        if let Some(username) = self.username {
            cursor += write_utf8_string(&mut buf[cursor..], username)?;
        }
        if let Some(password) = self.password {
            cursor += write_binary(&mut buf[cursor..], password.as_bytes())?;
        }

        let remaining_len = cursor - content_start;
        let len_bytes =
            util::write_variable_byte_integer_len(&mut buf[remaining_len_pos..], remaining_len)?;
        let header_len = 1 + len_bytes;
        buf.copy_within(content_start..cursor, header_len);
        Ok(header_len + remaining_len)
    }
}

// --- CONNACK Packet ---
#[derive(Debug)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: u8,
}

impl<'a> DecodePacket<'a> for ConnAck {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<transport::ErrorPlaceHolder>> {
        if buf.len() < 4 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        Ok(Self {
            session_present: (buf[2] & 0x01) != 0,
            reason_code: buf[3],
        })
    }
}

// --- PUBLISH Packet ---

#[derive(Debug)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub payload: &'a [u8],
    pub packet_id: Option<u16>,
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<transport::ErrorPlaceHolder>> {
        let flags = buf[0] & 0x0F;
        let qos = match (flags >> 1) & 0x03 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
        };
        let retain = (flags & 0x01) != 0;

        let mut cursor = 1;
        let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
        let packet_end = cursor + remaining_len;
        if packet_end > buf.len() {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }

        let topic = read_utf8_string(&mut cursor, buf)?;

        let packet_id = if qos != QoS::AtMostOnce {
            if cursor + 2 > packet_end {
                return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
            }
            let id = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]);
            cursor += 2;
            Some(id)
        } else {
            None
        };

        Ok(Publish {
            topic,
            qos,
            retain,
            payload: &buf[cursor..packet_end],
            packet_id,
        })
    }
}

impl<'a> EncodePacket for Publish<'a> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
        if buf.len() < 8 {
            return Err(MqttError::BufferTooSmall);
        }
        let mut cursor = 0;

        // Fixed header: PUBLISH packet type (3) with QoS and retain flags
        let mut flags = (self.qos as u8) << 1;
        if self.retain {
            flags |= 0x01;
        }
        buf[cursor] = 0x30 | flags;
        cursor += 1;

        // Reserve space for remaining length (max 4 bytes)
        let remaining_len_pos = cursor;
        cursor += 4;
        let content_start = cursor;

        // Topic name
        cursor += write_utf8_string(&mut buf[cursor..], self.topic)?;

        // Packet ID (only for QoS > 0)
        if self.qos != QoS::AtMostOnce
            && let Some(id) = self.packet_id
        {
            if cursor + 2 > buf.len() {
                return Err(MqttError::BufferTooSmall);
            }
            buf[cursor..cursor + 2].copy_from_slice(&id.to_be_bytes());
            cursor += 2;
        }

        // Payload
        if cursor + self.payload.len() > buf.len() {
            return Err(MqttError::BufferTooSmall);
        }
        buf[cursor..cursor + self.payload.len()].copy_from_slice(self.payload);
        cursor += self.payload.len();

        // Write remaining length and compact
        let remaining_len = cursor - content_start;
        let len_bytes =
            util::write_variable_byte_integer_len(&mut buf[remaining_len_pos..], remaining_len)?;
        let header_len = 1 + len_bytes;
        buf.copy_within(content_start..cursor, header_len);

        Ok(header_len + remaining_len)
    }
}

// --- Acknowledgement family (PUBACK / PUBREC / PUBREL / PUBCOMP / UNSUBACK) ---
//
// These all share the same two-byte-body shape: a packet id after the fixed
// header.

fn encode_ack(
    first_byte: u8,
    packet_id: u16,
    buf: &mut [u8],
) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
    if buf.len() < 4 {
        return Err(MqttError::BufferTooSmall);
    }
    buf[0] = first_byte;
    buf[1] = 0x02;
    buf[2..4].copy_from_slice(&packet_id.to_be_bytes());
    Ok(4)
}

fn decode_ack_packet_id(buf: &[u8]) -> Result<u16, MqttError<transport::ErrorPlaceHolder>> {
    let mut cursor = 1;
    let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
    if remaining_len < 2 || cursor + 2 > buf.len() {
        return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
    }
    Ok(u16::from_be_bytes([buf[cursor], buf[cursor + 1]]))
}

macro_rules! ack_packet {
    ($name:ident, $first_byte:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        pub struct $name {
            pub packet_id: u16,
        }

        impl EncodePacket for $name {
            fn encode(
                &self,
                buf: &mut [u8],
            ) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
                encode_ack($first_byte, self.packet_id, buf)
            }
        }

        impl<'a> DecodePacket<'a> for $name {
            fn decode(buf: &'a [u8]) -> Result<Self, MqttError<transport::ErrorPlaceHolder>> {
                Ok(Self {
                    packet_id: decode_ack_packet_id(buf)?,
                })
            }
        }
    };
}

ack_packet!(PubAck, 0x40);
ack_packet!(PubRec, 0x50);
// PUBREL carries the reserved flag bits 0b0010.
ack_packet!(PubRel, 0x62);
ack_packet!(PubComp, 0x70);
ack_packet!(UnsubAck, 0xB0);

// --- SUBSCRIBE Packet ---
#[derive(Debug)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub topics: Vec<(&'a str, QoS), 8>,
}

impl<'a> Subscribe<'a> {
    /// Creates a new Subscribe packet with a single topic filter.
    pub fn new(packet_id: u16, filter: &'a str, qos: QoS) -> Self {
        let mut topics = Vec::new();
        let _ = topics.push((filter, qos));
        Self { packet_id, topics }
    }
}

impl<'a> EncodePacket for Subscribe<'a> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
        if buf.len() < 8 {
            return Err(MqttError::BufferTooSmall);
        }
        let mut cursor = 0;

        // Fixed header: SUBSCRIBE packet type (8) with reserved bits (0x02)
        buf[cursor] = 0x82;
        cursor += 1;

        let remaining_len_pos = cursor;
        cursor += 4;
        let content_start = cursor;

        buf[cursor..cursor + 2].copy_from_slice(&self.packet_id.to_be_bytes());
        cursor += 2;

        // Topic filters with requested QoS
        for (filter, qos) in &self.topics {
            cursor += write_utf8_string(&mut buf[cursor..], filter)?;
            if cursor >= buf.len() {
                return Err(MqttError::BufferTooSmall);
            }
            buf[cursor] = *qos as u8;
            cursor += 1;
        }

        let remaining_len = cursor - content_start;
        let len_bytes =
            util::write_variable_byte_integer_len(&mut buf[remaining_len_pos..], remaining_len)?;
        let header_len = 1 + len_bytes;
        buf.copy_within(content_start..cursor, header_len);

        Ok(header_len + remaining_len)
    }
}

// --- SUBACK Packet ---
#[derive(Debug)]
pub struct SubAck {
    pub packet_id: u16,
    pub reason_codes: Vec<u8, 8>,
}

impl SubAck {
    /// Reason code the broker uses to reject a single filter.
    pub const FAILURE: u8 = 0x80;
}

impl<'a> DecodePacket<'a> for SubAck {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<transport::ErrorPlaceHolder>> {
        let mut cursor = 1;
        let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
        let packet_end = cursor + remaining_len;
        if remaining_len < 2 || packet_end > buf.len() {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }

        let packet_id = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]);
        cursor += 2;

        let mut reason_codes = Vec::new();
        while cursor < packet_end {
            let _ = reason_codes.push(buf[cursor]);
            cursor += 1;
        }

        Ok(SubAck {
            packet_id,
            reason_codes,
        })
    }
}

// --- UNSUBSCRIBE Packet ---
#[derive(Debug)]
pub struct Unsubscribe<'a> {
    pub packet_id: u16,
    pub topics: Vec<&'a str, 8>,
}

impl<'a> Unsubscribe<'a> {
    /// Creates a new Unsubscribe packet with a single topic filter.
    pub fn new(packet_id: u16, filter: &'a str) -> Self {
        let mut topics = Vec::new();
        let _ = topics.push(filter);
        Self { packet_id, topics }
    }
}

impl<'a> EncodePacket for Unsubscribe<'a> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
        if buf.len() < 8 {
            return Err(MqttError::BufferTooSmall);
        }
        let mut cursor = 0;

        // Fixed header: UNSUBSCRIBE packet type (10) with reserved bits (0x02)
        buf[cursor] = 0xA2;
        cursor += 1;

        let remaining_len_pos = cursor;
        cursor += 4;
        let content_start = cursor;

        buf[cursor..cursor + 2].copy_from_slice(&self.packet_id.to_be_bytes());
        cursor += 2;

        for filter in &self.topics {
            cursor += write_utf8_string(&mut buf[cursor..], filter)?;
        }

        let remaining_len = cursor - content_start;
        let len_bytes =
            util::write_variable_byte_integer_len(&mut buf[remaining_len_pos..], remaining_len)?;
        let header_len = 1 + len_bytes;
        buf.copy_within(content_start..cursor, header_len);

        Ok(header_len + remaining_len)
    }
}

// --- PINGREQ Packet ---
#[derive(Debug)]
pub struct PingReq;

impl EncodePacket for PingReq {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
        if buf.len() < 2 {
            return Err(MqttError::BufferTooSmall);
        }
        buf[0] = 0xC0;
        buf[1] = 0x00;
        Ok(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_encodes_credentials_and_will() {
        let connect = Connect {
            clean_session: true,
            keep_alive: 60,
            client_id: "bridge-1",
            username: Some("user"),
            password: Some("secret"),
            last_will: Some(LastWill {
                topic: "bridge/status",
                message: b"offline",
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        };
        let mut buf = [0u8; 128];
        let len = connect.encode(&mut buf).unwrap();

        assert_eq!(buf[0], 0x10);
        // Variable header starts after a single-byte remaining length here.
        let body = &buf[2..len];
        assert_eq!(&body[0..6], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(body[6], 4);
        // clean | will | will-qos1 | will-retain | password | username
        assert_eq!(body[7], 0x02 | 0x04 | 0x08 | 0x20 | 0x40 | 0x80);
        assert_eq!(u16::from_be_bytes([body[8], body[9]]), 60);
        // Payload field order: client id, will topic, will message, user, pass.
        assert_eq!(&body[10..12], &[0x00, 0x08]);
        assert_eq!(&body[12..20], b"bridge-1");
        assert_eq!(&body[22..35], b"bridge/status");
    }

    #[test]
    fn connect_without_will_sets_no_will_flags() {
        let connect = Connect {
            clean_session: false,
            keep_alive: 30,
            client_id: "c",
            username: None,
            password: None,
            last_will: None,
        };
        let mut buf = [0u8; 64];
        let len = connect.encode(&mut buf).unwrap();
        assert_eq!(buf[2 + 7], 0x00);
        assert_eq!(len, 2 + 10 + 3);
    }

    #[test]
    fn publish_round_trip_qos1() {
        let publish = Publish {
            topic: "home/door",
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: b"open",
            packet_id: Some(7),
        };
        let mut buf = [0u8; 64];
        let len = publish.encode(&mut buf).unwrap();

        let decoded = Publish::decode(&buf[..len]).unwrap();
        assert_eq!(decoded.topic, "home/door");
        assert_eq!(decoded.qos, QoS::AtLeastOnce);
        assert!(decoded.retain);
        assert_eq!(decoded.payload, b"open");
        assert_eq!(decoded.packet_id, Some(7));
    }

    #[test]
    fn publish_qos0_has_no_packet_id() {
        let publish = Publish {
            topic: "a/b",
            qos: QoS::AtMostOnce,
            retain: false,
            payload: b"x",
            packet_id: None,
        };
        let mut buf = [0u8; 32];
        let len = publish.encode(&mut buf).unwrap();
        let decoded = Publish::decode(&buf[..len]).unwrap();
        assert_eq!(decoded.packet_id, None);
        assert_eq!(decoded.payload, b"x");
    }

    #[test]
    fn subscribe_encodes_filter_and_qos() {
        let subscribe = Subscribe::new(3, "home/+/state", QoS::AtLeastOnce);
        let mut buf = [0u8; 64];
        let len = subscribe.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x82);
        let body = &buf[2..len];
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), 3);
        assert_eq!(&body[4..16], b"home/+/state");
        assert_eq!(body[16], QoS::AtLeastOnce as u8);
    }

    #[test]
    fn unsubscribe_encodes_filter() {
        let unsubscribe = Unsubscribe::new(4, "home/+/state");
        let mut buf = [0u8; 64];
        let len = unsubscribe.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0xA2);
        let body = &buf[2..len];
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), 4);
        assert_eq!(&body[4..16], b"home/+/state");
    }

    #[test]
    fn ack_family_round_trips() {
        let mut buf = [0u8; 8];
        let len = PubAck { packet_id: 99 }.encode(&mut buf).unwrap();
        assert_eq!(len, 4);
        assert_eq!(PubAck::decode(&buf[..len]).unwrap().packet_id, 99);

        let len = PubRel { packet_id: 100 }.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x62);
        assert_eq!(PubRel::decode(&buf[..len]).unwrap().packet_id, 100);
    }

    #[test]
    fn suback_decodes_reason_codes() {
        let raw = [0x90, 0x03, 0x00, 0x07, 0x01];
        let suback = SubAck::decode(&raw).unwrap();
        assert_eq!(suback.packet_id, 7);
        assert_eq!(&suback.reason_codes[..], &[0x01]);

        let rejected = [0x90, 0x03, 0x00, 0x08, SubAck::FAILURE];
        let suback = SubAck::decode(&rejected).unwrap();
        assert_eq!(&suback.reason_codes[..], &[SubAck::FAILURE]);
    }

    #[test]
    fn decode_dispatches_connack() {
        let raw = [0x20, 0x02, 0x00, 0x00];
        match decode::<transport::ErrorPlaceHolder>(&raw).unwrap() {
            Some(MqttPacket::ConnAck(ack)) => {
                assert_eq!(ack.reason_code, 0);
                assert!(!ack.session_present);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_unknown_packet_type() {
        let raw = [0xF0, 0x00];
        assert!(matches!(
            decode::<transport::ErrorPlaceHolder>(&raw),
            Err(MqttError::Protocol(ProtocolError::InvalidPacketType(15)))
        ));
    }
}
