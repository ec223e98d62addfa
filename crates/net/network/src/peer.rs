//! Identity bucket owning zero or more `Session`s. Holds a
//! weak reference up to the owning `Network` so the `Network ⇄ Peer ⇄
//! Session` cycle tears down top-down instead of leaking.

use crate::error::{ErrorKind, Result};
use crate::network::Network;
use crate::packet::ControlPacket;
use crate::session::Session;
use mesh_io::EventSender;
use mesh_types::{ConnectivityStatus, UserId};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

/// Secure channel's maximum packet size is out of scope here; this is a
/// conservative margin reserved for framing overhead.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 - 32;

#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub display_name: String,
    pub status: String,
    pub status_message: String,
    pub modified_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileImage {
    pub bytes: Vec<u8>,
    pub modified_at: u64,
}

/// Events a `Peer` emits.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged { user_id: UserId, is_online: bool },
    ConnectivityChanged { user_id: UserId, status: ConnectivityStatus },
    PeerAdded { user_id: UserId },
}

pub struct Peer {
    pub user_id: UserId,
    pub is_self_peer: bool,
    /// Settable after construction: `self_peer` is built before the owning
    /// `Network`'s `Arc` exists, so its weak ref starts dangling and is
    /// patched in once `Network::new` has something to downgrade.
    network: RwLock<Weak<Network>>,
    profile: RwLock<Profile>,
    profile_image: RwLock<ProfileImage>,
    /// Reader-writer lock: session lookups happen far more often than a
    /// session is added or removed.
    sessions: RwLock<Vec<Arc<Session>>>,
    connectivity: RwLock<ConnectivityStatus>,
    events: EventSender<PeerEvent>,
}

impl Peer {
    pub fn new(
        user_id: UserId,
        is_self_peer: bool,
        network: Weak<Network>,
        events: EventSender<PeerEvent>,
    ) -> Arc<Peer> {
        Arc::new(Peer {
            user_id,
            is_self_peer,
            network: RwLock::new(network),
            profile: RwLock::new(Profile::default()),
            profile_image: RwLock::new(ProfileImage::default()),
            sessions: RwLock::new(Vec::new()),
            connectivity: RwLock::new(ConnectivityStatus::NoNetwork),
            events,
        })
    }

    /// Patches in the owning network's weak ref once it exists. Only
    /// `Network::new` calls this, for `self_peer`.
    pub fn set_network(&self, network: Weak<Network>) {
        *self.network.write() = network;
    }

    pub fn is_online(&self) -> bool {
        !self.sessions.read().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().clone()
    }

    pub fn connectivity_status(&self) -> ConnectivityStatus {
        *self.connectivity.read()
    }

    pub fn set_connectivity_status(&self, status: ConnectivityStatus) {
        *self.connectivity.write() = status;
        self.events.emit(PeerEvent::ConnectivityChanged {
            user_id: self.user_id,
            status,
        });
    }

    pub fn profile(&self) -> Profile {
        self.profile.read().clone()
    }

    pub fn set_profile(&self, profile: Profile) {
        *self.profile.write() = profile;
    }

    pub fn profile_image(&self) -> ProfileImage {
        self.profile_image.read().clone()
    }

    pub fn set_profile_image(&self, image: ProfileImage) {
        *self.profile_image.write() = image;
    }

    /// The set of remote user ids this peer's sessions most recently
    /// reported as their own connected-peer set (feeds `Network`'s
    /// connectivity computation).
    pub fn connected_with(&self) -> HashSet<UserId> {
        let mut set = HashSet::new();
        for session in self.sessions.read().iter() {
            for entry in session.last_peer_exchange() {
                set.insert(entry.user_id);
            }
        }
        set
    }

    /// Adds a freshly joined session. On the first session, flips online
    /// and emits `StateChanged`; always pushes profile/image, triggers
    /// connectivity recomputation and a peer-exchange broadcast, and (for
    /// Private networks) re-sends undelivered messages on it.
    pub fn add_session(self: &Arc<Self>, session: Arc<Session>) -> Result<()> {
        let was_online = self.is_online();
        self.sessions.write().push(session.clone());
        if !was_online {
            self.events.emit(PeerEvent::StateChanged {
                user_id: self.user_id,
                is_online: true,
            });
        }

        let network = self.network.read().upgrade();

        // Announce *our own* identity to the newly joined session, not
        // whatever this peer last told us about itself.
        let profile = match &network {
            Some(network) => network.local_profile(),
            None => self.profile.read().clone(),
        };
        session.send_control(&ControlPacket::Profile {
            display_name: profile.display_name,
            status: profile.status,
            status_message: profile.status_message,
            modified_at: profile.modified_at,
        })?;
        let image = self.profile_image.read().clone();
        if !image.bytes.is_empty() {
            session.send_control(&ControlPacket::ProfileDisplayImage {
                image: image.bytes,
                modified_at: image.modified_at,
            })?;
        }

        if let Some(network) = network {
            network.recompute_connectivity();
            network.broadcast_peer_exchange();
            if network.is_private() {
                network.resend_undelivered_messages(&session, self.user_id)?;
            } else {
                network.push_group_image(&session)?;
            }
        }
        Ok(())
    }

    /// Removes a session. On the last one, flips offline and resets
    /// connectivity to `NoNetwork`, then triggers recomputation.
    pub fn remove_session(self: &Arc<Self>, session: &Arc<Session>) {
        self.sessions.write().retain(|s| !Arc::ptr_eq(s, session));
        session.disconnect();
        if !self.is_online() {
            *self.connectivity.write() = ConnectivityStatus::NoNetwork;
            self.events.emit(PeerEvent::StateChanged {
                user_id: self.user_id,
                is_online: false,
            });
            self.events.emit(PeerEvent::ConnectivityChanged {
                user_id: self.user_id,
                status: ConnectivityStatus::NoNetwork,
            });
        }
        if let Some(network) = self.network.read().upgrade() {
            network.recompute_connectivity();
        }
    }

    /// Fans a message out to every session in the list. `filename`/
    /// `file_size` carry a `FileAttachment`'s metadata only, `thumbnail` an
    /// `InlineImage`'s preview -- never the sender's local file path, which
    /// stays private to its own message store entry.
    #[allow(clippy::too_many_arguments)]
    pub fn send_message(
        &self,
        message_number: u64,
        sender: UserId,
        message_type: mesh_types::MessageType,
        payload: Vec<u8>,
        thumbnail: Option<Vec<u8>>,
        filename: Option<String>,
        file_size: Option<u64>,
    ) -> Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ErrorKind::PolicyReject(format!(
                "message of {} bytes exceeds MAX_MESSAGE_SIZE of {}",
                payload.len(),
                MAX_MESSAGE_SIZE
            ))
            .into());
        }
        let packet = ControlPacket::Message {
            message_number,
            sender,
            message_type,
            payload,
            thumbnail,
            filename,
            file_size,
        };
        for session in self.sessions.read().iter() {
            session.send_control(&packet)?;
        }
        Ok(())
    }

    pub fn disconnect(self: &Arc<Self>) {
        for session in self.sessions.write().drain(..) {
            session.disconnect();
        }
        *self.connectivity.write() = ConnectivityStatus::NoNetwork;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_size_leaves_room_for_framing() {
        assert!(MAX_MESSAGE_SIZE < u16::MAX as usize);
    }
}
