//! DHT datagram codec
//!
//! Every packet: 4-byte magic `ANOD`, 1-byte type, 4-byte transaction id,
//! 20-byte sender node id, then a type-specific payload. All integers are
//! big-endian. Packets over 1400 bytes are never built and never accepted.

use anonet_core::types::MAX_PACKET_SIZE;

use crate::contact::CONTACT_WIRE_LEN;
use crate::node_id::NODE_ID_LEN;
use crate::{Contact, DhtError, NodeId};

pub const MAGIC: u32 = 0x414E_4F44; // "ANOD"
pub const HEADER_LEN: usize = 4 + 1 + 4 + NODE_ID_LEN;

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0x01,
    Pong = 0x02,
    FindNode = 0x03,
    Nodes = 0x04,
    FindValue = 0x05,
    Value = 0x06,
    Store = 0x07,
    Stored = 0x08,
    Announce = 0x09,
    Announced = 0x0A,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MessageType::Ping),
            0x02 => Some(MessageType::Pong),
            0x03 => Some(MessageType::FindNode),
            0x04 => Some(MessageType::Nodes),
            0x05 => Some(MessageType::FindValue),
            0x06 => Some(MessageType::Value),
            0x07 => Some(MessageType::Store),
            0x08 => Some(MessageType::Stored),
            0x09 => Some(MessageType::Announce),
            0x0A => Some(MessageType::Announced),
            _ => None,
        }
    }
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping,
    Pong,
    FindNode { target: NodeId },
    Nodes { contacts: Vec<Contact> },
    FindValue { key: NodeId },
    Value { value: Vec<u8> },
    Store { key: NodeId, value: Vec<u8> },
    Stored { ok: bool },
    Announce { value: Vec<u8> },
    Announced { ok: bool },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
            Message::FindNode { .. } => MessageType::FindNode,
            Message::Nodes { .. } => MessageType::Nodes,
            Message::FindValue { .. } => MessageType::FindValue,
            Message::Value { .. } => MessageType::Value,
            Message::Store { .. } => MessageType::Store,
            Message::Stored { .. } => MessageType::Stored,
            Message::Announce { .. } => MessageType::Announce,
            Message::Announced { .. } => MessageType::Announced,
        }
    }
}

/// A full datagram: header fields plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub tx_id: u32,
    pub sender: NodeId,
    pub message: Message,
}

impl Packet {
    pub fn new(tx_id: u32, sender: NodeId, message: Message) -> Self {
        Self {
            tx_id,
            sender,
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.push(self.message.message_type() as u8);
        buf.extend_from_slice(&self.tx_id.to_be_bytes());
        buf.extend_from_slice(self.sender.as_bytes());

        match &self.message {
            Message::Ping | Message::Pong => {}
            Message::FindNode { target } => buf.extend_from_slice(target.as_bytes()),
            Message::FindValue { key } => buf.extend_from_slice(key.as_bytes()),
            Message::Nodes { contacts } => {
                for contact in contacts {
                    contact.encode(&mut buf);
                }
            }
            Message::Value { value } | Message::Announce { value } => {
                buf.extend_from_slice(value);
            }
            Message::Store { key, value } => {
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(value);
            }
            Message::Stored { ok } | Message::Announced { ok } => buf.push(*ok as u8),
        }

        if buf.len() > MAX_PACKET_SIZE {
            return Err(DhtError::MalformedPacket(format!(
                "packet of {} bytes exceeds {MAX_PACKET_SIZE}",
                buf.len()
            )));
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() < HEADER_LEN {
            return Err(DhtError::MalformedPacket(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(DhtError::MalformedPacket(format!(
                "packet of {} bytes exceeds {MAX_PACKET_SIZE}",
                bytes.len()
            )));
        }

        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MAGIC {
            return Err(DhtError::MalformedPacket(format!("bad magic {magic:#010x}")));
        }

        let msg_type = MessageType::from_u8(bytes[4])
            .ok_or_else(|| DhtError::MalformedPacket(format!("unknown type {:#04x}", bytes[4])))?;
        let tx_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let sender = NodeId::new(&bytes[9..HEADER_LEN])?;
        let payload = &bytes[HEADER_LEN..];

        let message = match msg_type {
            MessageType::Ping => expect_empty(payload, Message::Ping)?,
            MessageType::Pong => expect_empty(payload, Message::Pong)?,
            MessageType::FindNode => Message::FindNode {
                target: read_node_id(payload)?,
            },
            MessageType::FindValue => Message::FindValue {
                key: read_node_id(payload)?,
            },
            MessageType::Nodes => {
                if payload.len() % CONTACT_WIRE_LEN != 0 {
                    return Err(DhtError::MalformedPacket(
                        "NODES payload not a multiple of contact size".into(),
                    ));
                }
                let contacts = payload
                    .chunks(CONTACT_WIRE_LEN)
                    .map(Contact::decode)
                    .collect::<Result<Vec<_>, _>>()?;
                Message::Nodes { contacts }
            }
            MessageType::Value => Message::Value {
                value: payload.to_vec(),
            },
            MessageType::Announce => Message::Announce {
                value: payload.to_vec(),
            },
            MessageType::Store => {
                if payload.len() < NODE_ID_LEN {
                    return Err(DhtError::MalformedPacket("STORE payload too short".into()));
                }
                Message::Store {
                    key: NodeId::new(&payload[..NODE_ID_LEN])?,
                    value: payload[NODE_ID_LEN..].to_vec(),
                }
            }
            MessageType::Stored => Message::Stored {
                ok: read_flag(payload)?,
            },
            MessageType::Announced => Message::Announced {
                ok: read_flag(payload)?,
            },
        };

        Ok(Self {
            tx_id,
            sender,
            message,
        })
    }
}

fn expect_empty(payload: &[u8], message: Message) -> Result<Message, DhtError> {
    if payload.is_empty() {
        Ok(message)
    } else {
        Err(DhtError::MalformedPacket("unexpected payload".into()))
    }
}

fn read_node_id(payload: &[u8]) -> Result<NodeId, DhtError> {
    if payload.len() != NODE_ID_LEN {
        return Err(DhtError::MalformedPacket(format!(
            "expected {NODE_ID_LEN}-byte id, got {}",
            payload.len()
        )));
    }
    NodeId::new(payload)
}

fn read_flag(payload: &[u8]) -> Result<bool, DhtError> {
    if payload.len() != 1 {
        return Err(DhtError::MalformedPacket("expected 1-byte flag".into()));
    }
    Ok(payload[0] != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn roundtrip(message: Message) -> Packet {
        let packet = Packet::new(42, NodeId::from_name("sender"), message);
        let bytes = packet.encode().unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        decoded
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        roundtrip(Message::Ping);
        roundtrip(Message::Pong);
    }

    #[test]
    fn test_find_node_roundtrip() {
        roundtrip(Message::FindNode {
            target: NodeId::from_name("target"),
        });
    }

    #[test]
    fn test_nodes_roundtrip() {
        let contacts = (1..=3u8)
            .map(|i| {
                Contact::new(
                    NodeId::from_name(&format!("n{i}")),
                    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 51820 + i as u16),
                )
            })
            .collect();
        roundtrip(Message::Nodes { contacts });
    }

    #[test]
    fn test_store_and_value_roundtrip() {
        roundtrip(Message::Store {
            key: NodeId::from_name("key"),
            value: vec![1, 2, 3, 4],
        });
        roundtrip(Message::Value {
            value: vec![5, 6, 7],
        });
        roundtrip(Message::Announce { value: vec![9] });
    }

    #[test]
    fn test_flag_messages_roundtrip() {
        roundtrip(Message::Stored { ok: true });
        roundtrip(Message::Stored { ok: false });
        roundtrip(Message::Announced { ok: true });
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(
            0x01020304,
            NodeId::from_name("sender"),
            Message::Ping,
        );
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..4], &[0x41, 0x4E, 0x4F, 0x44]); // "ANOD"
        assert_eq!(bytes[4], 0x01);
        assert_eq!(&bytes[5..9], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[9..29], NodeId::from_name("sender").as_bytes());
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = Packet::new(1, NodeId::random(), Message::Ping)
            .encode()
            .unwrap();
        bytes[0] = 0x00;
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = Packet::new(1, NodeId::random(), Message::Ping)
            .encode()
            .unwrap();
        bytes[4] = 0x7F;
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_short_header() {
        assert!(Packet::decode(&[0x41, 0x4E, 0x4F]).is_err());
    }

    #[test]
    fn test_decode_rejects_oversize_packet() {
        let bytes = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn test_encode_rejects_oversize_value() {
        let packet = Packet::new(
            1,
            NodeId::random(),
            Message::Value {
                value: vec![0u8; MAX_PACKET_SIZE],
            },
        );
        assert!(packet.encode().is_err());
    }

    #[test]
    fn test_decode_rejects_ragged_nodes_payload() {
        let mut bytes = Packet::new(1, NodeId::random(), Message::Nodes { contacts: vec![] })
            .encode()
            .unwrap();
        bytes.extend_from_slice(&[0u8; 13]);
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_payload_on_ping() {
        let mut bytes = Packet::new(1, NodeId::random(), Message::Ping)
            .encode()
            .unwrap();
        bytes.push(0);
        assert!(Packet::decode(&bytes).is_err());
    }
}
