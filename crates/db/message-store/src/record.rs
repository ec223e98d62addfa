//! The message-log entry surface: monotonically
//! numbered, typed, with a per-recipient delivery status row.

use mesh_types::{DeliveryStatus, MessageType, UserId};
use rlp::{DecoderError, Encodable, Rlp, RlpStream};

/// One recipient's copy of a message and whether it has been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: UserId,
    pub status: DeliveryStatus,
}

impl Encodable for Recipient {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.user_id);
        s.append(&self.status);
    }
}

impl rlp::Decodable for Recipient {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Recipient {
            user_id: rlp.val_at(0)?,
            status: rlp.val_at(1)?,
        })
    }
}

/// A single entry in a network's message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_number: u64,
    pub message_type: MessageType,
    pub sender: UserId,
    pub recipients: Vec<Recipient>,
    pub payload: Vec<u8>,
    pub thumbnail: Option<Vec<u8>>,
    pub filename: Option<String>,
    pub file_size: Option<u64>,
    pub local_file_path: Option<String>,
    pub timestamp_millis: u64,
}

fn append_option<T: Encodable>(s: &mut RlpStream, value: &Option<T>) {
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

fn decode_option<T: rlp::Decodable>(rlp: &Rlp) -> Result<Option<T>, DecoderError> {
    if rlp.item_count()? == 0 {
        Ok(None)
    } else {
        Ok(Some(rlp.val_at(0)?))
    }
}

impl Encodable for MessageRecord {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(10);
        s.append(&self.message_number);
        s.append(&self.message_type);
        s.append(&self.sender);
        s.append_list(&self.recipients);
        s.append(&self.payload);
        append_option(s, &self.thumbnail);
        append_option(s, &self.filename);
        append_option(s, &self.file_size);
        append_option(s, &self.local_file_path);
        s.append(&self.timestamp_millis);
    }
}

impl rlp::Decodable for MessageRecord {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(MessageRecord {
            message_number: rlp.val_at(0)?,
            message_type: rlp.val_at(1)?,
            sender: rlp.val_at(2)?,
            recipients: rlp.list_at(3)?,
            payload: rlp.val_at(4)?,
            thumbnail: decode_option(&rlp.at(5)?)?,
            filename: decode_option(&rlp.at(6)?)?,
            file_size: decode_option(&rlp.at(7)?)?,
            local_file_path: decode_option(&rlp.at(8)?)?,
            timestamp_millis: rlp.val_at(9)?,
        })
    }
}

impl MessageRecord {
    /// True for the first-message detection rule: a lone, self-authored,
    /// undelivered `TextMessage`.
    pub fn is_pending_invitation(&self, local_user_id: UserId) -> bool {
        self.message_type == MessageType::TextMessage
            && self.sender == local_user_id
            && self
                .recipients
                .iter()
                .all(|r| r.status != DeliveryStatus::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u64) -> UserId {
        UserId::from_low_u64_be(n)
    }

    #[test]
    fn round_trips_with_all_optionals_present() {
        let record = MessageRecord {
            message_number: 7,
            message_type: MessageType::FileAttachment,
            sender: uid(1),
            recipients: vec![Recipient {
                user_id: uid(2),
                status: DeliveryStatus::Pending,
            }],
            payload: vec![1, 2, 3],
            thumbnail: Some(vec![9, 9]),
            filename: Some("photo.jpg".into()),
            file_size: Some(1024),
            local_file_path: Some("/tmp/photo.jpg".into()),
            timestamp_millis: 1_700_000_000_000,
        };
        let encoded = rlp::encode(&record);
        let decoded: MessageRecord = rlp::decode(&encoded).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn round_trips_with_all_optionals_absent() {
        let record = MessageRecord {
            message_number: 0,
            message_type: MessageType::TextMessage,
            sender: uid(1),
            recipients: vec![],
            payload: b"hi".to_vec(),
            thumbnail: None,
            filename: None,
            file_size: None,
            local_file_path: None,
            timestamp_millis: 0,
        };
        let encoded = rlp::encode(&record);
        let decoded: MessageRecord = rlp::decode(&encoded).unwrap();
        assert_eq!(record, decoded);
    }
}
