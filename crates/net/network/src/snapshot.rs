//! Versioned binary snapshot of a network's persisted state. Peer records
//! use the same discriminant-then-field-list RLP encoding as the rest of
//! this crate's wire types.

use crate::error::{ErrorKind, Result};
use mesh_types::{Endpoint, NetworkId, NetworkKind, NetworkSecret, NetworkStatus, UserId};
use rlp::{Rlp, RlpStream};

/// Only version this crate knows how to read or write.
pub const SNAPSHOT_VERSION: u8 = 1;

/// One known peer's persisted identity and last-seen endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub display_name: String,
    pub endpoints: Vec<Endpoint>,
}

impl rlp::Encodable for PeerInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.user_id);
        s.append(&self.display_name);
        s.append_list(&self.endpoints);
    }
}

impl rlp::Decodable for PeerInfo {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, rlp::DecoderError> {
        Ok(PeerInfo {
            user_id: rlp.val_at(0)?,
            display_name: rlp.val_at(1)?,
            endpoints: rlp.list_at(2)?,
        })
    }
}

/// The full persisted state of one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub kind: NetworkKind,
    pub local_user_id: UserId,
    pub shared_secret: String,
    pub status: NetworkStatus,
    pub network_id: NetworkId,
    pub network_secret: NetworkSecret,
    pub message_store_id: String,
    pub message_store_key: Vec<u8>,
    pub local_network_only_modified_at: u64,
    pub local_network_only: bool,
    pub group_image_modified_at: u64,
    pub group_image: Vec<u8>,
    pub group_locked_at: u64,
    pub group_locked: bool,
    pub mute: bool,
    /// For Private, exactly one record; for Group, every known peer
    /// except self.
    pub peers: Vec<PeerInfo>,
}

fn status_byte(status: NetworkStatus) -> u8 {
    match status {
        NetworkStatus::Offline => 0,
        NetworkStatus::Online => 1,
    }
}

fn status_from_byte(byte: u8) -> std::result::Result<NetworkStatus, rlp::DecoderError> {
    match byte {
        0 => Ok(NetworkStatus::Offline),
        1 => Ok(NetworkStatus::Online),
        _ => Err(rlp::DecoderError::Custom("invalid network status byte")),
    }
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

fn decode_option<T: rlp::Decodable>(rlp: &Rlp) -> std::result::Result<Option<T>, rlp::DecoderError> {
    if rlp.item_count()? == 0 {
        Ok(None)
    } else {
        Ok(Some(rlp.val_at(0)?))
    }
}

impl NetworkSnapshot {
    /// Writes the version byte followed by the RLP-encoded field list, in
    /// the order type, localUserId, (groupName?), sharedSecret, status,
    /// networkId, networkSecret, messageStoreId, messageStoreKey, the
    /// option pairs, mute, then known peers.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![SNAPSHOT_VERSION];
        let mut s = RlpStream::new();
        let is_group = matches!(self.kind, NetworkKind::Group { .. });
        let group_name = match &self.kind {
            NetworkKind::Group { name } => Some(name.clone()),
            NetworkKind::Private { .. } => None,
        };
        // 0:type 1:localUserId 2:groupName? 3:sharedSecret 4:status
        // 5:networkId 6:networkSecret 7:messageStoreId 8:messageStoreKey
        // 9:localNetworkOnlyModifiedAt 10:localNetworkOnly
        // 11:groupImageModifiedAt 12:groupImage 13:groupLockedAt
        // 14:groupLocked 15:mute 16:peers
        s.begin_list(17);
        s.append(&is_group);
        s.append(&self.local_user_id);
        append_option(&mut s, &group_name);
        s.append(&self.shared_secret);
        s.append(&status_byte(self.status));
        s.append(&self.network_id);
        s.append(&self.network_secret);
        s.append(&self.message_store_id);
        s.append(&self.message_store_key);
        s.append(&self.local_network_only_modified_at);
        s.append(&self.local_network_only);
        s.append(&self.group_image_modified_at);
        s.append(&self.group_image);
        s.append(&self.group_locked_at);
        s.append(&self.group_locked);
        s.append(&self.mute);
        s.append_list(&self.peers);
        out.extend_from_slice(&s.out());
        out
    }

    /// Reads a snapshot, rejecting any version byte other than
    /// `SNAPSHOT_VERSION` with a clean parse error. A Private network's
    /// `otherUserId` is never stored as its own field; it's recovered from
    /// the single known-peer record the format already carries.
    pub fn decode(bytes: &[u8]) -> Result<NetworkSnapshot> {
        let (version, body) = bytes
            .split_first()
            .ok_or_else(|| ErrorKind::ParseError("empty snapshot".into()))?;
        if *version != SNAPSHOT_VERSION {
            return Err(ErrorKind::ParseError(format!("unrecognised snapshot version {version}")).into());
        }
        let rlp = Rlp::new(body);
        let is_group: bool = rlp.val_at(0)?;
        let local_user_id = rlp.val_at(1)?;
        let group_name: Option<String> = decode_option(&rlp.at(2)?)?;
        let peers: Vec<PeerInfo> = rlp.list_at(16)?;
        let kind = if is_group {
            NetworkKind::Group {
                name: group_name.ok_or_else(|| ErrorKind::ParseError("group snapshot missing name".into()))?,
            }
        } else {
            NetworkKind::Private {
                other_user_id: peers
                    .first()
                    .map(|p| p.user_id)
                    .ok_or_else(|| ErrorKind::ParseError("private snapshot missing peer record".into()))?,
            }
        };
        Ok(NetworkSnapshot {
            kind,
            local_user_id,
            shared_secret: rlp.val_at(3)?,
            status: status_from_byte(rlp.val_at(4)?)?,
            network_id: rlp.val_at(5)?,
            network_secret: rlp.val_at(6)?,
            message_store_id: rlp.val_at(7)?,
            message_store_key: rlp.val_at(8)?,
            local_network_only_modified_at: rlp.val_at(9)?,
            local_network_only: rlp.val_at(10)?,
            group_image_modified_at: rlp.val_at(11)?,
            group_image: rlp.val_at(12)?,
            group_locked_at: rlp.val_at(13)?,
            group_locked: rlp.val_at(14)?,
            mute: rlp.val_at(15)?,
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: NetworkKind) -> NetworkSnapshot {
        NetworkSnapshot {
            kind,
            local_user_id: UserId::from_low_u64_be(1),
            shared_secret: "hunter2".into(),
            status: NetworkStatus::Online,
            network_id: NetworkId::from_low_u64_be(2),
            network_secret: NetworkSecret::from_low_u64_be(3),
            message_store_id: "store-1".into(),
            message_store_key: vec![9; 32],
            local_network_only_modified_at: 10,
            local_network_only: true,
            group_image_modified_at: 0,
            group_image: Vec::new(),
            group_locked_at: 0,
            group_locked: false,
            mute: false,
            peers: vec![PeerInfo {
                user_id: UserId::from_low_u64_be(2),
                display_name: "Bob".into(),
                endpoints: vec![Endpoint::new("127.0.0.1:9000".parse().unwrap())],
            }],
        }
    }

    #[test]
    fn private_network_round_trips() {
        let snapshot = sample(NetworkKind::Private {
            other_user_id: UserId::from_low_u64_be(2),
        });
        let encoded = snapshot.encode();
        assert_eq!(encoded[0], SNAPSHOT_VERSION);
        let decoded = NetworkSnapshot::decode(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn group_network_round_trips() {
        let snapshot = sample(NetworkKind::Group {
            name: "friends".into(),
        });
        let encoded = snapshot.encode();
        let decoded = NetworkSnapshot::decode(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut encoded = sample(NetworkKind::Group { name: "x".into() }).encode();
        encoded[0] = 9;
        let err = NetworkSnapshot::decode(&encoded).unwrap_err();
        assert_matches::assert_matches!(err.0, ErrorKind::ParseError(_));
    }
}
