//! Wire framing inside the secure channel:
//! `port:u16_le | length:u16_le | bytes[length]`. Port 0 carries a
//! self-delimiting, RLP-encoded control packet; any other port carries raw
//! `DataStream` bytes.
//!
//! Control packet bodies are RLP lists: a leading discriminant byte,
//! then a per-type field list.

use crate::error::{ErrorKind, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use mesh_types::{Endpoint, MessageType, UserId};
use rlp::{DecoderError, Rlp, RlpStream};
use std::io::{Read, Write};

/// Port used for control traffic; every other port is a `DataStream`.
pub const CONTROL_PORT: u16 = 0;

/// One entry in a `PeerExchange` packet's advertised peer list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerExchangeEntry {
    pub user_id: UserId,
    pub endpoints: Vec<Endpoint>,
}

/// Control packets exchanged on port 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    PingRequest,
    PingResponse,
    PeerExchange {
        peers: Vec<PeerExchangeEntry>,
    },
    LocalNetworkOnly {
        enabled: bool,
        modified_at: u64,
    },
    Profile {
        display_name: String,
        status: String,
        status_message: String,
        modified_at: u64,
    },
    ProfileDisplayImage {
        image: Vec<u8>,
        modified_at: u64,
    },
    GroupDisplayImage {
        image: Vec<u8>,
        modified_at: u64,
    },
    GroupLockNetwork {
        locked: bool,
        modified_at: u64,
    },
    MessageTypingNotification {
        is_typing: bool,
    },
    Message {
        message_number: u64,
        sender: UserId,
        message_type: MessageType,
        payload: Vec<u8>,
        thumbnail: Option<Vec<u8>>,
        filename: Option<String>,
        file_size: Option<u64>,
    },
    MessageDeliveryNotification {
        message_number: u64,
    },
    FileRequest {
        message_number: u64,
        file_offset: u64,
        data_port: u16,
    },
}

fn append_option<T: rlp::Encodable>(s: &mut RlpStream, value: &Option<T>) {
    match value {
        Some(v) => {
            s.begin_list(1);
            s.append(v);
        }
        None => {
            s.begin_list(0);
        }
    }
}

fn decode_option<T: rlp::Decodable>(rlp: &Rlp) -> std::result::Result<Option<T>, DecoderError> {
    if rlp.item_count()? == 0 {
        Ok(None)
    } else {
        Ok(Some(rlp.val_at(0)?))
    }
}

impl ControlPacket {
    fn discriminant(&self) -> u8 {
        match self {
            ControlPacket::PingRequest => 0,
            ControlPacket::PingResponse => 1,
            ControlPacket::PeerExchange { .. } => 2,
            ControlPacket::LocalNetworkOnly { .. } => 3,
            ControlPacket::Profile { .. } => 4,
            ControlPacket::ProfileDisplayImage { .. } => 5,
            ControlPacket::GroupDisplayImage { .. } => 6,
            ControlPacket::GroupLockNetwork { .. } => 7,
            ControlPacket::MessageTypingNotification { .. } => 8,
            ControlPacket::Message { .. } => 9,
            ControlPacket::MessageDeliveryNotification { .. } => 10,
            ControlPacket::FileRequest { .. } => 11,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = RlpStream::new();
        s.begin_list(2);
        s.append(&self.discriminant());
        match self {
            ControlPacket::PingRequest | ControlPacket::PingResponse => {
                s.begin_list(0);
            }
            ControlPacket::PeerExchange { peers } => {
                s.begin_list(1);
                s.begin_list(peers.len());
                for entry in peers {
                    s.begin_list(2);
                    s.append(&entry.user_id);
                    s.append_list(&entry.endpoints);
                }
            }
            ControlPacket::LocalNetworkOnly { enabled, modified_at } => {
                s.begin_list(2);
                s.append(enabled);
                s.append(modified_at);
            }
            ControlPacket::Profile {
                display_name,
                status,
                status_message,
                modified_at,
            } => {
                s.begin_list(4);
                s.append(display_name);
                s.append(status);
                s.append(status_message);
                s.append(modified_at);
            }
            ControlPacket::ProfileDisplayImage { image, modified_at }
            | ControlPacket::GroupDisplayImage { image, modified_at } => {
                s.begin_list(2);
                s.append(image);
                s.append(modified_at);
            }
            ControlPacket::GroupLockNetwork { locked, modified_at } => {
                s.begin_list(2);
                s.append(locked);
                s.append(modified_at);
            }
            ControlPacket::MessageTypingNotification { is_typing } => {
                s.begin_list(1);
                s.append(is_typing);
            }
            ControlPacket::Message {
                message_number,
                sender,
                message_type,
                payload,
                thumbnail,
                filename,
                file_size,
            } => {
                s.begin_list(7);
                s.append(message_number);
                s.append(sender);
                s.append(message_type);
                s.append(payload);
                append_option(s, thumbnail);
                append_option(s, filename);
                append_option(s, file_size);
            }
            ControlPacket::MessageDeliveryNotification { message_number } => {
                s.begin_list(1);
                s.append(message_number);
            }
            ControlPacket::FileRequest {
                message_number,
                file_offset,
                data_port,
            } => {
                s.begin_list(3);
                s.append(message_number);
                s.append(file_offset);
                s.append(data_port);
            }
        }
        s.out().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<ControlPacket> {
        let rlp = Rlp::new(bytes);
        let discriminant: u8 = rlp.val_at(0)?;
        let body = rlp.at(1)?;
        let packet = match discriminant {
            0 => ControlPacket::PingRequest,
            1 => ControlPacket::PingResponse,
            2 => {
                let mut peers = Vec::new();
                for item in body.at(0)?.iter() {
                    peers.push(PeerExchangeEntry {
                        user_id: item.val_at(0)?,
                        endpoints: item.list_at(1)?,
                    });
                }
                ControlPacket::PeerExchange { peers }
            }
            3 => ControlPacket::LocalNetworkOnly {
                enabled: body.val_at(0)?,
                modified_at: body.val_at(1)?,
            },
            4 => ControlPacket::Profile {
                display_name: body.val_at(0)?,
                status: body.val_at(1)?,
                status_message: body.val_at(2)?,
                modified_at: body.val_at(3)?,
            },
            5 => ControlPacket::ProfileDisplayImage {
                image: body.val_at(0)?,
                modified_at: body.val_at(1)?,
            },
            6 => ControlPacket::GroupDisplayImage {
                image: body.val_at(0)?,
                modified_at: body.val_at(1)?,
            },
            7 => ControlPacket::GroupLockNetwork {
                locked: body.val_at(0)?,
                modified_at: body.val_at(1)?,
            },
            8 => ControlPacket::MessageTypingNotification {
                is_typing: body.val_at(0)?,
            },
            9 => ControlPacket::Message {
                message_number: body.val_at(0)?,
                sender: body.val_at(1)?,
                message_type: body.val_at(2)?,
                payload: body.val_at(3)?,
                thumbnail: decode_option(&body.at(4)?)?,
                filename: decode_option(&body.at(5)?)?,
                file_size: decode_option(&body.at(6)?)?,
            },
            10 => ControlPacket::MessageDeliveryNotification {
                message_number: body.val_at(0)?,
            },
            11 => ControlPacket::FileRequest {
                message_number: body.val_at(0)?,
                file_offset: body.val_at(1)?,
                data_port: body.val_at(2)?,
            },
            _ => return Err(DecoderError::Custom("unknown control packet discriminant").into()),
        };
        Ok(packet)
    }
}

/// Writes one outer frame: `port | length | bytes`.
pub fn write_frame<W: Write>(w: &mut W, port: u16, payload: &[u8]) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(ErrorKind::PolicyReject("frame payload exceeds u16::MAX".into()).into());
    }
    w.write_u16::<LittleEndian>(port)?;
    w.write_u16::<LittleEndian>(payload.len() as u16)?;
    w.write_all(payload)?;
    Ok(())
}

/// Reads one outer frame, returning its port and payload bytes.
pub fn read_frame<R: Read>(r: &mut R) -> Result<(u16, Vec<u8>)> {
    let port = r.read_u16::<LittleEndian>()?;
    let length = r.read_u16::<LittleEndian>()?;
    let mut payload = vec![0u8; length as usize];
    r.read_exact(&mut payload)?;
    Ok((port, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 7, b"hello").unwrap();
        let mut cursor = Cursor::new(buf);
        let (port, payload) = read_frame(&mut cursor).unwrap();
        assert_eq!(port, 7);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn ping_round_trips() {
        let encoded = ControlPacket::PingRequest.encode();
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), ControlPacket::PingRequest);
    }

    #[test]
    fn peer_exchange_round_trips() {
        let packet = ControlPacket::PeerExchange {
            peers: vec![PeerExchangeEntry {
                user_id: UserId::from_low_u64_be(9),
                endpoints: vec![Endpoint::new("127.0.0.1:9001".parse().unwrap())],
            }],
        };
        let encoded = packet.encode();
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn text_message_round_trips_without_file_fields() {
        let packet = ControlPacket::Message {
            message_number: 3,
            sender: UserId::from_low_u64_be(1),
            message_type: mesh_types::MessageType::TextMessage,
            payload: b"hi".to_vec(),
            thumbnail: None,
            filename: None,
            file_size: None,
        };
        let encoded = packet.encode();
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn file_attachment_message_round_trips_with_file_fields() {
        let packet = ControlPacket::Message {
            message_number: 4,
            sender: UserId::from_low_u64_be(1),
            message_type: mesh_types::MessageType::FileAttachment,
            payload: Vec::new(),
            thumbnail: None,
            filename: Some("photo.jpg".into()),
            file_size: Some(10 * 1024 * 1024),
        };
        let encoded = packet.encode();
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn inline_image_message_round_trips_with_thumbnail() {
        let packet = ControlPacket::Message {
            message_number: 5,
            sender: UserId::from_low_u64_be(1),
            message_type: mesh_types::MessageType::InlineImage,
            payload: vec![0xff, 0xd8, 0xff],
            thumbnail: Some(vec![1, 2, 3, 4]),
            filename: None,
            file_size: None,
        };
        let encoded = packet.encode();
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn file_request_round_trips() {
        let packet = ControlPacket::FileRequest {
            message_number: 4,
            file_offset: 4 * 1024 * 1024,
            data_port: 3,
        };
        let encoded = packet.encode();
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), packet);
    }
}
