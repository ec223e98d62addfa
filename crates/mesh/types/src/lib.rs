//! Shared identity, endpoint, and wire-adjacent types for the mesh network
//! session fabric. No behaviour lives here, only the vocabulary the other
//! crates agree on.

use fixed_hash::construct_fixed_hash;
use rlp::{DecoderError, Rlp, RlpStream};
use std::net::SocketAddr;
use std::str::FromStr;

construct_fixed_hash! {
    /// 256-bit identity of a human user, bound to a long-lived keypair.
    pub struct UserId(32);
}

construct_fixed_hash! {
    /// Public, disclosable stand-in for a `UserId` (`HMAC-SHA256(salt, key=UserId)`).
    pub struct MaskedUserId(32);
}

construct_fixed_hash! {
    /// 256-bit identifier of a network, derived from name/ids and shared secret.
    pub struct NetworkId(32);
}

construct_fixed_hash! {
    /// 256-bit PSK used by the secure channel once a network is no longer pending invitation.
    pub struct NetworkSecret(32);
}

impl rlp::Encodable for UserId {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(self.as_bytes());
    }
}

impl rlp::Decodable for UserId {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder()
            .decode_value(|bytes| {
                if bytes.len() != 32 {
                    return Err(DecoderError::RlpInvalidLength);
                }
                Ok(UserId::from_slice(bytes))
            })
    }
}

impl rlp::Encodable for NetworkId {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(self.as_bytes());
    }
}

impl rlp::Decodable for NetworkId {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            if bytes.len() != 32 {
                return Err(DecoderError::RlpInvalidLength);
            }
            Ok(NetworkId::from_slice(bytes))
        })
    }
}

impl rlp::Encodable for NetworkSecret {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(self.as_bytes());
    }
}

impl rlp::Decodable for NetworkSecret {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            if bytes.len() != 32 {
                return Err(DecoderError::RlpInvalidLength);
            }
            Ok(NetworkSecret::from_slice(bytes))
        })
    }
}

/// Either a private two-party chat, or a named multi-party group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkKind {
    /// Symmetric two-party chat between the local user and `other_user_id`.
    Private { other_user_id: UserId },
    /// Named multi-party chat with a dynamic peer set.
    Group { name: String },
}

/// Online/offline status of a `Network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Offline,
    Online,
}

/// Derived connectivity state of a peer, computed from the mesh's view of
/// who everyone else is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    NoNetwork,
    PartialMeshNetwork,
    FullMeshNetwork,
}

/// A reachable transport endpoint, optionally introduced via a third party
/// (the `via` endpoint used to open a virtual/relayed connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: SocketAddr,
}

impl Endpoint {
    pub fn new(address: SocketAddr) -> Self {
        Endpoint { address }
    }
}

/// Delivery state of a single recipient's copy of a message-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
}

impl rlp::Encodable for DeliveryStatus {
    fn rlp_append(&self, s: &mut RlpStream) {
        let byte: u8 = match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Delivered => 1,
        };
        s.encoder().encode_value(&[byte]);
    }
}

impl rlp::Decodable for DeliveryStatus {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        match rlp.as_val::<u8>()? {
            0 => Ok(DeliveryStatus::Pending),
            1 => Ok(DeliveryStatus::Delivered),
            _ => Err(DecoderError::Custom("invalid DeliveryStatus byte")),
        }
    }
}

/// Discriminant of a message-log entry's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    TextMessage,
    InlineImage,
    FileAttachment,
    Info,
}

impl rlp::Encodable for MessageType {
    fn rlp_append(&self, s: &mut RlpStream) {
        let byte: u8 = match self {
            MessageType::TextMessage => 0,
            MessageType::InlineImage => 1,
            MessageType::FileAttachment => 2,
            MessageType::Info => 3,
        };
        s.encoder().encode_value(&[byte]);
    }
}

impl rlp::Decodable for MessageType {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        match rlp.as_val::<u8>()? {
            0 => Ok(MessageType::TextMessage),
            1 => Ok(MessageType::InlineImage),
            2 => Ok(MessageType::FileAttachment),
            3 => Ok(MessageType::Info),
            _ => Err(DecoderError::Custom("invalid MessageType byte")),
        }
    }
}

impl rlp::Encodable for Endpoint {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(self.address.to_string().as_bytes());
    }
}

impl rlp::Decodable for Endpoint {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| DecoderError::Custom("endpoint is not valid utf8"))?;
            let address = SocketAddr::from_str(text)
                .map_err(|_| DecoderError::Custom("endpoint is not a valid socket address"))?;
            Ok(Endpoint { address })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_xor_is_commutative() {
        let a = UserId::from_low_u64_be(1);
        let b = UserId::from_low_u64_be(2);
        assert_eq!(a ^ b, b ^ a);
    }

    #[test]
    fn user_id_rlp_round_trips() {
        let id = UserId::from_low_u64_be(0xdead_beef);
        let encoded = rlp::encode(&id);
        let decoded: UserId = rlp::decode(&encoded).unwrap();
        assert_eq!(id, decoded);
    }
}
