//! Control packets and their encoders and decoders.
//!
//! Every encoder computes the remaining length first, allocates a buffer of
//! exactly the packet size and writes the fields in wire order. Decoders read
//! the same fields back in the same order.

use bytes::Bytes;

use super::codec::{
    MAX_VARIABLE_INT, binary_len, read_binary, read_bytes, read_fixed_header, read_string, read_u8, read_u16,
    string_len, variable_int_len, write_binary, write_fixed_header, write_string, write_u8,
    write_u16,
};
use super::{
    ConnectReturnCode, FixedHeader, PROTOCOL_LEVEL, PROTOCOL_NAME, PacketType, SubscribeReturnCode,
};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::types::{LastWill, QoS};

const CONNECT_USERNAME: u8 = 0x80;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_WILL_RETAIN: u8 = 0x20;
const CONNECT_WILL: u8 = 0x04;
const CONNECT_CLEAN_SESSION: u8 = 0x02;

const PUBLISH_RETAIN: u8 = 0x01;
const PUBLISH_DUP: u8 = 0x08;

/// A control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<LastWill>,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present on the wire only when `qos` is not `AtMostOnce`.
    pub pkid: u16,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            pkid: 0,
        }
    }
}

/// SUBSCRIBE packet for a single topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub topic: String,
    pub qos: QoS,
}

/// SUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub code: SubscribeReturnCode,
}

/// UNSUBSCRIBE packet for a single topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topic: String,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier, or 0 for types that carry none.
    pub fn packet_id(&self) -> u16 {
        match self {
            Packet::Publish(p) => p.pkid,
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => *id,
            Packet::Subscribe(s) => s.pkid,
            Packet::SubAck(s) => s.pkid,
            Packet::Unsubscribe(u) => u.pkid,
            Packet::Connect(_)
            | Packet::ConnAck(_)
            | Packet::PingReq
            | Packet::PingResp
            | Packet::Disconnect => 0,
        }
    }

    /// Encodes the packet into a freshly allocated buffer.
    ///
    /// Invalid field combinations fail before anything is written.
    pub fn encode(&self) -> Result<Buffer> {
        self.validate()?;
        let remaining = self.remaining_length();
        let remaining_field = u32::try_from(remaining)
            .ok()
            .filter(|&len| len <= MAX_VARIABLE_INT)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "remaining length {} exceeds {}",
                    remaining, MAX_VARIABLE_INT
                ))
            })?;
        let mut buf = Buffer::allocate(1 + variable_int_len(remaining_field) + remaining)?;
        write_fixed_header(&mut buf, self.packet_type(), self.header_flags(), remaining)?;

        match self {
            Packet::Connect(c) => c.write(&mut buf)?,
            Packet::ConnAck(c) => {
                write_u8(&mut buf, c.session_present as u8)?;
                write_u8(&mut buf, c.code as u8)?;
            }
            Packet::Publish(p) => {
                write_string(&mut buf, Some(&p.topic))?;
                if p.qos != QoS::AtMostOnce {
                    write_u16(&mut buf, p.pkid)?;
                }
                if buf.append(&p.payload) != p.payload.len() {
                    return Err(Error::OutOfMemory);
                }
            }
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => write_u16(&mut buf, *id)?,
            Packet::Subscribe(s) => {
                write_u16(&mut buf, s.pkid)?;
                write_string(&mut buf, Some(&s.topic))?;
                write_u8(&mut buf, s.qos as u8)?;
            }
            Packet::SubAck(s) => {
                write_u16(&mut buf, s.pkid)?;
                write_u8(&mut buf, s.code.to_u8())?;
            }
            Packet::Unsubscribe(u) => {
                write_u16(&mut buf, u.pkid)?;
                write_string(&mut buf, Some(&u.topic))?;
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }
        Ok(buf)
    }

    /// Decodes one packet at the cursor.
    ///
    /// Returns [`Error::Incomplete`] with the cursor untouched when the
    /// buffer does not yet hold the whole packet, and
    /// [`Error::BufferOverflow`] when the packet is larger than `max_size`.
    pub fn decode(buf: &mut Buffer, max_size: usize) -> Result<Packet> {
        let start = buf.position();
        let header = read_fixed_header(buf)?;
        if header.remaining_length > max_size {
            buf.set_position(start);
            return Err(Error::BufferOverflow {
                size: header.remaining_length,
                limit: max_size,
            });
        }
        if buf.free_space() < header.remaining_length {
            let needed = header.remaining_length - buf.free_space();
            buf.set_position(start);
            return Err(Error::Incomplete { needed });
        }

        let mut body = Buffer::from_slice(&buf.remaining()[..header.remaining_length]);
        buf.advance(header.remaining_length);

        match Self::decode_body(header, &mut body) {
            Ok(_) if !body.is_eof() => Err(Error::MalformedPacket(format!(
                "{} has {} trailing bytes",
                header.packet_type,
                body.free_space()
            ))),
            Ok(packet) => Ok(packet),
            Err(e) if e.is_incomplete() => Err(Error::MalformedPacket(format!(
                "{} shorter than its fields",
                header.packet_type
            ))),
            Err(e) => Err(e),
        }
    }

    fn decode_body(header: FixedHeader, body: &mut Buffer) -> Result<Packet> {
        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(body)?),
            PacketType::ConnAck => {
                let flags = read_u8(body)?;
                let code = read_u8(body)?;
                let code = ConnectReturnCode::from_u8(code).ok_or_else(|| {
                    Error::MalformedPacket(format!("unknown CONNACK return code {}", code))
                })?;
                Packet::ConnAck(ConnAck {
                    session_present: flags & 0x01 != 0,
                    code,
                })
            }
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, body)?),
            PacketType::PubAck => Packet::PubAck(read_u16(body)?),
            PacketType::PubRec => Packet::PubRec(read_u16(body)?),
            PacketType::PubRel => Packet::PubRel(read_u16(body)?),
            PacketType::PubComp => Packet::PubComp(read_u16(body)?),
            PacketType::Subscribe => {
                let pkid = read_u16(body)?;
                let topic = read_string(body)?;
                let qos = read_u8(body)?;
                let qos = QoS::from_u8(qos & 0x03).ok_or_else(|| {
                    Error::MalformedPacket(format!("invalid requested QoS {}", qos))
                })?;
                Packet::Subscribe(Subscribe { pkid, topic, qos })
            }
            PacketType::SubAck => {
                let pkid = read_u16(body)?;
                let code = read_u8(body)?;
                let code = SubscribeReturnCode::from_u8(code).ok_or_else(|| {
                    Error::MalformedPacket(format!("invalid SUBACK status {:#04x}", code))
                })?;
                Packet::SubAck(SubAck { pkid, code })
            }
            PacketType::Unsubscribe => {
                let pkid = read_u16(body)?;
                let topic = read_string(body)?;
                Packet::Unsubscribe(Unsubscribe { pkid, topic })
            }
            PacketType::UnsubAck => Packet::UnsubAck(read_u16(body)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };
        Ok(packet)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Packet::Publish(p) => {
                if p.dup && p.qos == QoS::AtMostOnce {
                    return Err(Error::InvalidParameter(
                        "DUP flag set on a QoS 0 PUBLISH".into(),
                    ));
                }
                if p.qos != QoS::AtMostOnce && p.pkid == 0 {
                    return Err(Error::InvalidParameter(
                        "QoS > 0 PUBLISH needs a packet id".into(),
                    ));
                }
                if p.topic.is_empty() {
                    return Err(Error::InvalidParameter("empty topic".into()));
                }
            }
            Packet::Subscribe(Subscribe { topic, .. })
            | Packet::Unsubscribe(Unsubscribe { topic, .. }) => {
                if topic.is_empty() {
                    return Err(Error::InvalidParameter("empty topic filter".into()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn header_flags(&self) -> u8 {
        match self {
            Packet::Publish(p) => {
                let mut flags = (p.qos as u8) << 1;
                if p.retain {
                    flags |= PUBLISH_RETAIN;
                }
                if p.dup {
                    flags |= PUBLISH_DUP;
                }
                flags
            }
            other => other.packet_type().header_flags(),
        }
    }

    fn remaining_length(&self) -> usize {
        match self {
            Packet::Connect(c) => c.remaining_length(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => {
                let pkid_len = if p.qos == QoS::AtMostOnce { 0 } else { 2 };
                string_len(Some(&p.topic)) + pkid_len + p.payload.len()
            }
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(s) => 2 + string_len(Some(&s.topic)) + 1,
            Packet::SubAck(_) => 3,
            Packet::Unsubscribe(u) => 2 + string_len(Some(&u.topic)),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        }
    }
}

impl Connect {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_session {
            flags |= CONNECT_CLEAN_SESSION;
        }
        if let Some(will) = &self.will {
            flags |= CONNECT_WILL | ((will.qos as u8) << 3);
            if will.retain {
                flags |= CONNECT_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= CONNECT_USERNAME;
        }
        if self.password.is_some() {
            flags |= CONNECT_PASSWORD;
        }
        flags
    }

    fn remaining_length(&self) -> usize {
        // protocol name, level, flags, keep alive
        let mut len = string_len(Some(PROTOCOL_NAME)) + 1 + 1 + 2;
        len += string_len(Some(&self.client_id));
        if let Some(will) = &self.will {
            len += string_len(Some(&will.topic)) + binary_len(&will.message);
        }
        if let Some(username) = &self.username {
            len += string_len(Some(username));
        }
        if let Some(password) = &self.password {
            len += binary_len(password);
        }
        len
    }

    fn write(&self, buf: &mut Buffer) -> Result<()> {
        write_string(buf, Some(PROTOCOL_NAME))?;
        write_u8(buf, PROTOCOL_LEVEL)?;
        write_u8(buf, self.flags())?;
        write_u16(buf, self.keep_alive)?;
        write_string(buf, Some(&self.client_id))?;
        if let Some(will) = &self.will {
            write_string(buf, Some(&will.topic))?;
            write_binary(buf, &will.message)?;
        }
        if let Some(username) = &self.username {
            write_string(buf, Some(username))?;
        }
        if let Some(password) = &self.password {
            write_binary(buf, password)?;
        }
        Ok(())
    }

    fn read(body: &mut Buffer) -> Result<Self> {
        let name = read_string(body)?;
        if name != PROTOCOL_NAME {
            return Err(Error::MalformedPacket(format!(
                "unknown protocol name {:?}",
                name
            )));
        }
        let level = read_u8(body)?;
        if level != PROTOCOL_LEVEL {
            return Err(Error::MalformedPacket(format!(
                "unsupported protocol level {}",
                level
            )));
        }
        let flags = read_u8(body)?;
        let keep_alive = read_u16(body)?;
        let client_id = read_string(body)?;

        let will = if flags & CONNECT_WILL != 0 {
            let topic = read_string(body)?;
            let message = read_binary(body)?;
            let qos = QoS::from_u8((flags >> 3) & 0x03)
                .ok_or_else(|| Error::MalformedPacket("invalid will QoS".into()))?;
            Some(LastWill {
                topic,
                message,
                qos,
                retain: flags & CONNECT_WILL_RETAIN != 0,
            })
        } else {
            None
        };
        let username = if flags & CONNECT_USERNAME != 0 {
            Some(read_string(body)?)
        } else {
            None
        };
        let password = if flags & CONNECT_PASSWORD != 0 {
            Some(read_binary(body)?)
        } else {
            None
        };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session: flags & CONNECT_CLEAN_SESSION != 0,
            username,
            password,
            will,
        })
    }
}

impl Publish {
    fn read(flags: u8, body: &mut Buffer) -> Result<Self> {
        let qos = QoS::from_u8((flags >> 1) & 0x03)
            .ok_or_else(|| Error::MalformedPacket("PUBLISH with QoS 3".into()))?;
        let topic = read_string(body)?;
        let pkid = if qos == QoS::AtMostOnce {
            0
        } else {
            read_u16(body)?
        };
        let payload = read_bytes(body, body.free_space())?;
        Ok(Publish {
            topic,
            payload,
            qos,
            retain: flags & PUBLISH_RETAIN != 0,
            dup: flags & PUBLISH_DUP != 0,
            pkid,
        })
    }
}
