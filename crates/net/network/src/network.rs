//! Per-network orchestration: status machine, discovery
//! timers, dialer, join, peer exchange, connectivity computation, and the
//! message pipeline and file transfer glue that ride on
//! top of it. One struct holding both the mutable runtime state and the
//! options it was constructed with.

use crate::collaborators::{Connection, ConnectionManager, HandshakeOptions, Node, SecureChannel};
use crate::discovery::is_rfc1918_or_link_local;
use crate::error::{Error, ErrorKind, Result};
use crate::packet::{ControlPacket, PeerExchangeEntry};
use crate::peer::{Peer, PeerEvent};
use crate::session::{Session, SessionEvent};
use mesh_io::{EventBus, EventSender, Timer, WorkerPool};
use mesh_message_store::MessageStore;
use mesh_types::{ConnectivityStatus, Endpoint, MaskedUserId, NetworkId, NetworkKind, NetworkSecret, NetworkStatus, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Construction-time options, with `Default` matching the
/// timer constants new networks are expected to use.
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    pub local_network_only: bool,
    pub local_network_only_modified_at: u64,
    pub mute: bool,
    pub group_locked: bool,
    pub group_locked_at: u64,
    pub group_image: Vec<u8>,
    pub group_image_modified_at: u64,
    pub peer_search_first_delay: Duration,
    pub peer_search_period: Duration,
    pub ping_period: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions {
            local_network_only: false,
            local_network_only_modified_at: 0,
            mute: false,
            group_locked: false,
            group_locked_at: 0,
            group_image: Vec::new(),
            group_image_modified_at: 0,
            peer_search_first_delay: Duration::from_secs(1),
            peer_search_period: Duration::from_secs(60),
            ping_period: Duration::from_secs(15),
        }
    }
}

/// Milliseconds since the Unix epoch, used to stamp the `*_modified_at`
/// fields that ride alongside `LocalNetworkOnly`/`GroupLockNetwork`/
/// `GroupDisplayImage` so a snapshot reload can tell which side's change is
/// newer.
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Events the network layer surfaces to the UI dispatcher, beyond the
/// per-peer `PeerEvent`s.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    MessageReceived {
        sender: UserId,
        message_number: u64,
        payload: Vec<u8>,
    },
    MessageDelivered {
        message_number: u64,
        recipient: UserId,
    },
    PeerAdded {
        user_id: UserId,
    },
    StatusChanged {
        status: NetworkStatus,
    },
}

pub struct Network {
    /// Mutable so `change_shared_secret` can re-derive both in place once
    /// the node-level registry has cleared the new id for collisions
    ///.
    network_id: RwLock<NetworkId>,
    network_secret: RwLock<NetworkSecret>,
    pub kind: NetworkKind,
    pub local_user_id: UserId,
    shared_secret: RwLock<String>,
    status: RwLock<NetworkStatus>,
    options: RwLock<NetworkOptions>,
    /// "Group peer table: reader-writer lock; reads dominate".
    peers: RwLock<HashMap<UserId, Arc<Peer>>>,
    self_peer: Arc<Peer>,
    message_store: Arc<MessageStore>,
    connection_manager: Arc<dyn ConnectionManager>,
    node: Arc<dyn Node>,
    events: EventSender<NetworkEvent>,
    peer_events: EventSender<PeerEvent>,
    session_events: EventSender<SessionEvent>,
    peer_search_timer: Mutex<Option<Timer>>,
    ping_timer: Mutex<Option<Timer>>,
    workers: Arc<WorkerPool>,
    /// Guards `GoOnline`/`GoOffline`/`Dispose`/`UpdateConnectivityStatus`
    /// from overlapping with each other.
    lifecycle_lock: Mutex<()>,
    disposed: AtomicBool,
}

impl Network {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network_id: NetworkId,
        network_secret: NetworkSecret,
        kind: NetworkKind,
        local_user_id: UserId,
        shared_secret: String,
        options: NetworkOptions,
        message_store: Arc<MessageStore>,
        connection_manager: Arc<dyn ConnectionManager>,
        node: Arc<dyn Node>,
        workers: Arc<WorkerPool>,
        events: EventSender<NetworkEvent>,
        peer_events: EventSender<PeerEvent>,
    ) -> Arc<Network> {
        let session_event_bus = EventBus::new();
        let session_events = session_event_bus.sender();

        let network = Arc::new(Network {
            network_id: RwLock::new(network_id),
            network_secret: RwLock::new(network_secret),
            kind: kind.clone(),
            local_user_id,
            shared_secret: RwLock::new(shared_secret),
            status: RwLock::new(NetworkStatus::Offline),
            options: RwLock::new(options),
            peers: RwLock::new(HashMap::new()),
            self_peer: Peer::new(local_user_id, true, Weak::new(), peer_events.clone()),
            message_store,
            connection_manager,
            node,
            events,
            peer_events,
            session_events,
            peer_search_timer: Mutex::new(None),
            ping_timer: Mutex::new(None),
            workers,
            lifecycle_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
        });

        network.self_peer.set_network(Arc::downgrade(&network));

        if let NetworkKind::Private { other_user_id } = kind {
            network.get_or_create_peer(other_user_id);
        }

        let weak = Arc::downgrade(&network);
        std::thread::spawn(move || {
            while let Some(event) = session_event_bus.recv() {
                match weak.upgrade() {
                    Some(network) => network.handle_session_event(event),
                    None => return,
                }
            }
        });

        network
    }

    pub fn is_private(&self) -> bool {
        matches!(self.kind, NetworkKind::Private { .. })
    }

    pub fn network_id(&self) -> NetworkId {
        *self.network_id.read()
    }

    pub fn network_secret(&self) -> NetworkSecret {
        *self.network_secret.read()
    }

    pub fn shared_secret(&self) -> String {
        self.shared_secret.read().clone()
    }

    /// Recomputes `networkId`/`networkSecret` from `new_shared_secret` and
    /// swaps them in, provided the node-level registry accepts the new id
    ///.
    pub fn change_shared_secret(&self, new_shared_secret: String) -> Result<()> {
        let identity = mesh_crypto::NetworkIdentity::derive(&new_shared_secret, &self.kind, self.local_user_id);
        let old_id = self.network_id();
        self.node.mesh_network_changed(Some(old_id), identity.network_id)?;
        *self.network_id.write() = identity.network_id;
        *self.network_secret.write() = identity.network_secret;
        *self.shared_secret.write() = new_shared_secret;
        Ok(())
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.read()
    }

    pub fn options(&self) -> NetworkOptions {
        self.options.read().clone()
    }

    /// This network's message log, for an embedder to read history from
    /// or a test to inspect a stored record's exact delivery state.
    pub fn message_store(&self) -> &Arc<MessageStore> {
        &self.message_store
    }

    /// The local node's own identity, as announced to newly joined
    /// sessions -- never the cached copy of what a remote peer reported.
    pub fn local_profile(&self) -> crate::peer::Profile {
        crate::peer::Profile {
            display_name: self.node.display_name(),
            status: self.node.status(),
            status_message: self.node.status_message(),
            modified_at: self.node.profile_modified_at(),
        }
    }

    /// Flips `localNetworkOnly` locally and, for a Group network, tells
    /// every currently connected peer so their own dialer policy follows
    /// suit within their next timer cycle.
    pub fn set_local_network_only(self: &Arc<Self>, enabled: bool) {
        let modified_at = now_millis();
        {
            let mut options = self.options.write();
            options.local_network_only = enabled;
            options.local_network_only_modified_at = modified_at;
        }
        self.broadcast_control(&ControlPacket::LocalNetworkOnly { enabled, modified_at });
    }

    /// Advisory group-membership filter: "locking" a group only restricts
    /// which identities a future handshake trusts, per spec.md §1's
    /// non-goal of group-membership consensus.
    pub fn set_group_locked(self: &Arc<Self>, locked: bool) {
        let modified_at = now_millis();
        {
            let mut options = self.options.write();
            options.group_locked = locked;
            options.group_locked_at = modified_at;
        }
        self.broadcast_control(&ControlPacket::GroupLockNetwork { locked, modified_at });
    }

    /// Sets this network's group image and pushes it to every currently
    /// connected session; a peer that joins afterwards gets it from
    /// `Peer::add_session`'s call to `push_group_image`.
    pub fn set_group_image(self: &Arc<Self>, image: Vec<u8>) {
        let modified_at = now_millis();
        {
            let mut options = self.options.write();
            options.group_image = image.clone();
            options.group_image_modified_at = modified_at;
        }
        self.broadcast_control(&ControlPacket::GroupDisplayImage { image, modified_at });
    }

    fn broadcast_control(self: &Arc<Self>, packet: &ControlPacket) {
        for peer in self.peers.read().values() {
            for session in peer.sessions() {
                let _ = session.send_control(packet);
            }
        }
    }

    /// Captures this network's full persisted state, in the field order
    /// spec.md §3 names: known-peer list is a single record for Private,
    /// every known peer except self for Group.
    pub fn snapshot(&self) -> crate::snapshot::NetworkSnapshot {
        let options = self.options();
        let peers = match &self.kind {
            NetworkKind::Private { other_user_id } => {
                let peer = self.peer(*other_user_id);
                vec![crate::snapshot::PeerInfo {
                    user_id: *other_user_id,
                    display_name: peer.as_ref().map(|p| p.profile().display_name).unwrap_or_default(),
                    endpoints: peer
                        .map(|p| p.sessions().iter().map(|s| s.connection_info.remote_endpoint.clone()).collect())
                        .unwrap_or_default(),
                }]
            }
            NetworkKind::Group { .. } => self
                .peers
                .read()
                .values()
                .map(|peer| crate::snapshot::PeerInfo {
                    user_id: peer.user_id,
                    display_name: peer.profile().display_name,
                    endpoints: peer.sessions().iter().map(|s| s.connection_info.remote_endpoint.clone()).collect(),
                })
                .collect(),
        };
        crate::snapshot::NetworkSnapshot {
            kind: self.kind.clone(),
            local_user_id: self.local_user_id,
            shared_secret: self.shared_secret(),
            status: self.status(),
            network_id: self.network_id(),
            network_secret: self.network_secret(),
            message_store_id: format!("{:x}", self.network_id()),
            message_store_key: self.network_secret().as_fixed_bytes().to_vec(),
            local_network_only_modified_at: options.local_network_only_modified_at,
            local_network_only: options.local_network_only,
            group_image_modified_at: options.group_image_modified_at,
            group_image: options.group_image,
            group_locked_at: options.group_locked_at,
            group_locked: options.group_locked,
            mute: options.mute,
            peers,
        }
    }

    /// Seeds the known-peer table from a decoded snapshot (restoring a
    /// Group network's roster across a restart without waiting for a fresh
    /// peer-exchange round). Sessions are never part of the snapshot, so
    /// every restored peer starts offline.
    pub fn restore_known_peers(self: &Arc<Self>, peers: &[crate::snapshot::PeerInfo]) {
        for info in peers {
            if info.user_id == self.local_user_id {
                continue;
            }
            let peer = self.get_or_create_peer(info.user_id);
            if !info.display_name.is_empty() {
                peer.set_profile(crate::peer::Profile {
                    display_name: info.display_name.clone(),
                    ..Default::default()
                });
            }
        }
    }

    pub fn self_peer(&self) -> Arc<Peer> {
        self.self_peer.clone()
    }

    pub fn peer(&self, user_id: UserId) -> Option<Arc<Peer>> {
        if user_id == self.local_user_id {
            return Some(self.self_peer.clone());
        }
        self.peers.read().get(&user_id).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    fn get_or_create_peer(self: &Arc<Self>, user_id: UserId) -> Arc<Peer> {
        if user_id == self.local_user_id {
            return self.self_peer.clone();
        }
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get(&user_id) {
            return peer.clone();
        }
        let peer = Peer::new(user_id, false, Arc::downgrade(self), self.peer_events.clone());
        peers.insert(user_id, peer.clone());
        self.peer_events.emit(PeerEvent::PeerAdded { user_id });
        self.events.emit(NetworkEvent::PeerAdded { user_id });
        peer
    }

    /// "Invitation pending": the log has exactly
    /// one entry, a self-authored undelivered `TextMessage`.
    pub fn invitation_pending(&self) -> Result<bool> {
        if self.message_store.len() != 1 {
            return Ok(false);
        }
        let entry = self.message_store.read(0)?;
        Ok(entry.is_pending_invitation(self.local_user_id))
    }

    // ---- Status machine -------------------------------------------------

    pub fn go_online(self: &Arc<Self>) {
        let _guard = self.lifecycle_lock.lock();
        if *self.status.read() == NetworkStatus::Online {
            return;
        }
        *self.status.write() = NetworkStatus::Online;
        self.events.emit(NetworkEvent::StatusChanged {
            status: NetworkStatus::Online,
        });

        let options = self.options();
        let network = self.clone();
        let search_network = network.clone();
        *self.peer_search_timer.lock() = Some(Timer::start(
            Some(options.peer_search_first_delay),
            options.peer_search_period,
            move || search_network.peer_search_tick(),
        ));

        let ping_network = network.clone();
        *self.ping_timer.lock() = Some(Timer::start(None, options.ping_period, move || {
            ping_network.ping_tick()
        }));
    }

    pub fn go_offline(self: &Arc<Self>) {
        let _guard = self.lifecycle_lock.lock();
        if *self.status.read() == NetworkStatus::Offline {
            return;
        }
        *self.status.write() = NetworkStatus::Offline;
        self.peer_search_timer.lock().take();
        self.ping_timer.lock().take();
        self.self_peer.disconnect();
        for peer in self.peers.read().values() {
            peer.disconnect();
        }
        self.events.emit(NetworkEvent::StatusChanged {
            status: NetworkStatus::Offline,
        });
    }

    pub fn dispose(self: &Arc<Self>) {
        let _guard = self.lifecycle_lock.lock();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(_guard);
        self.go_offline();
        self.connection_manager.tcp_relay_unregister_hosted_network(self.network_id());
        self.node.delete_mesh_network(self.network_id());
    }

    fn peer_search_tick(self: &Arc<Self>) -> bool {
        if *self.status.read() != NetworkStatus::Online {
            return false;
        }
        let lan_only = self.options().local_network_only;
        match self.invitation_pending() {
            Ok(true) => {
                if let NetworkKind::Private { other_user_id } = self.kind {
                    let masked = mesh_crypto::masked_user_id(&other_user_id);
                    let network = self.clone();
                    self.connection_manager.begin_find_peers(
                        masked,
                        lan_only,
                        Box::new(move |endpoints| {
                            for ep in endpoints {
                                network.begin_make_connection(ep, None);
                            }
                        }),
                    );
                }
            }
            _ => {
                self.connection_manager
                    .tcp_relay_register_hosted_network(self.network_id());
                let network = self.clone();
                self.connection_manager.begin_announce(
                    self.network_id(),
                    lan_only,
                    Box::new(move |endpoints| {
                        for ep in endpoints {
                            network.begin_make_connection(ep, None);
                        }
                    }),
                );
            }
        }
        true
    }

    fn ping_tick(self: &Arc<Self>) -> bool {
        if *self.status.read() != NetworkStatus::Online {
            return false;
        }
        for peer in self.peers.read().values() {
            for session in peer.sessions() {
                let _ = session.send_control(&ControlPacket::PingRequest);
            }
        }
        true
    }

    // ---- Dialer -----------------------------------------------------------

    /// `BeginMakeConnection`. Runs on a fresh worker.
    pub fn begin_make_connection(self: &Arc<Self>, peer_ep: Endpoint, fallback_via: Option<Endpoint>) {
        if *self.status.read() != NetworkStatus::Online {
            return;
        }
        if self.options().local_network_only && !is_rfc1918_or_link_local(&peer_ep.address) {
            log::debug!(target: "network", "rejecting dial to {:?}: local-network-only policy", peer_ep.address);
            return;
        }
        let network = self.clone();
        self.workers.spawn(Box::new(move || {
            if let Err(e) = network.dial(peer_ep.clone()) {
                log::debug!(target: "network", "direct dial to {:?} failed: {e}", peer_ep.address);
                if let Some(via) = fallback_via {
                    if let Err(e) = network.dial_virtual(via.clone(), peer_ep.clone()) {
                        log::debug!(target: "network", "virtual dial to {:?} via {:?} failed: {e}", peer_ep.address, via.address);
                    }
                }
            }
        }));
    }

    fn dial(self: &Arc<Self>, peer_ep: Endpoint) -> Result<()> {
        let connection = self.connection_manager.make_connection(peer_ep)?;
        self.establish_secure_channel_and_join(connection, true, None)
    }

    /// Retries through a virtual connection tunnelled over an already
    /// established session.
    fn dial_virtual(self: &Arc<Self>, via: Endpoint, peer_ep: Endpoint) -> Result<()> {
        let connection = self.connection_manager.make_virtual_connection(via, peer_ep)?;
        self.establish_secure_channel_and_join(connection, true, None)
    }

    /// Builds the PSK/trusted-identity options for a secure-channel
    /// handshake. Exposed so an
    /// embedder's inbound-connection listener (out of scope here: "the
    /// secure-channel cryptographic handshake itself") can compute the
    /// server-role options for an already-known `networkId` before
    /// performing its own handshake and calling `join`.
    pub fn handshake_options(&self, is_client: bool, target_peer: Option<UserId>) -> Result<HandshakeOptions> {
        let ciphers = self.node.supported_ciphers();
        match &self.kind {
            NetworkKind::Private { other_user_id } => {
                let invitation_pending = self.invitation_pending()?;
                let psk = if is_client && invitation_pending {
                    *other_user_id.as_fixed_bytes()
                } else {
                    *self.network_secret().as_fixed_bytes()
                };
                Ok(HandshakeOptions {
                    psk,
                    trusted_identities: Some(vec![*other_user_id]),
                    cipher_suites: ciphers,
                    renegotiate_after_bytes: crate::session::RENEGOTIATE_AFTER_BYTES,
                    renegotiate_after_secs: crate::session::RENEGOTIATE_AFTER_SECS,
                })
            }
            NetworkKind::Group { .. } => {
                let _ = target_peer;
                let trusted = if self.options().group_locked {
                    Some(self.peers.read().keys().copied().collect())
                } else {
                    None
                };
                Ok(HandshakeOptions {
                    psk: *self.network_secret().as_fixed_bytes(),
                    trusted_identities: trusted,
                    cipher_suites: ciphers,
                    renegotiate_after_bytes: crate::session::RENEGOTIATE_AFTER_BYTES,
                    renegotiate_after_secs: crate::session::RENEGOTIATE_AFTER_SECS,
                })
            }
        }
    }

    fn establish_secure_channel_and_join(
        self: &Arc<Self>,
        connection: Box<dyn Connection>,
        is_client: bool,
        target_peer: Option<UserId>,
    ) -> Result<()> {
        let options = self.handshake_options(is_client, target_peer)?;
        let channel = connection.connect_mesh_network(self.network_id(), &options)?;
        self.join(channel, connection.as_ref())?;
        Ok(())
    }

    /// Classifies the remote identity and adds the session to the right
    /// peer. Returns the new session so an embedder's
    /// inbound-connection listener -- which performs the handshake itself,
    /// since that's out of scope here -- can act on it directly (e.g. the
    /// invitation accept path derives the new Private
    /// network from the handshake alone, then relies on the ordinary
    /// reader thread to dispatch the sender's first `Message`).
    pub fn join(self: &Arc<Self>, channel: Box<dyn SecureChannel>, connection: &dyn Connection) -> Result<Arc<Session>> {
        let remote_user_id = channel.remote_peer_user_id();
        let peer = match &self.kind {
            NetworkKind::Private { other_user_id } => {
                if remote_user_id == *other_user_id {
                    self.get_or_create_peer(remote_user_id)
                } else if remote_user_id == self.local_user_id {
                    self.self_peer.clone()
                } else {
                    return Err(ErrorKind::InvariantViolation(
                        "unexpected remote identity on Private join".into(),
                    )
                    .into());
                }
            }
            NetworkKind::Group { .. } => self.get_or_create_peer(remote_user_id),
        };

        let session = Session::start(channel, connection, self.session_events.clone())?;
        peer.add_session(session.clone())?;
        if self.is_private() {
            self.peer_search_timer.lock().take();
        }
        Ok(session)
    }

    // ---- Peer exchange & connectivity --------------------------------------

    pub fn broadcast_peer_exchange(self: &Arc<Self>) {
        let mut entries = Vec::new();
        for peer in self.peers.read().values() {
            if peer.is_online() {
                entries.push(PeerExchangeEntry {
                    user_id: peer.user_id,
                    endpoints: peer
                        .sessions()
                        .iter()
                        .map(|s| s.connection_info.remote_endpoint.clone())
                        .collect(),
                });
            }
        }
        let packet = ControlPacket::PeerExchange { peers: entries };
        for peer in self.peers.read().values() {
            for session in peer.sessions() {
                let _ = session.send_control(&packet);
            }
        }
    }

    fn handle_peer_exchange(self: &Arc<Self>, session: &Arc<Session>, peers: Vec<PeerExchangeEntry>) {
        session.record_peer_exchange(peers.clone());
        for entry in peers {
            if entry.user_id == self.local_user_id {
                continue;
            }
            for endpoint in entry.endpoints {
                self.begin_make_connection(
                    endpoint,
                    Some(session.connection_info.remote_endpoint.clone()),
                );
            }
        }
        self.recompute_connectivity();
    }

    /// Recomputes every online peer's connectivity status: a
    /// peer is `FullMeshNetwork` once it reports (via peer exchange) being
    /// connected to every other peer this node itself currently has online,
    /// `PartialMeshNetwork` otherwise.
    pub fn recompute_connectivity(self: &Arc<Self>) {
        let _guard = self.lifecycle_lock.lock();
        let peers = self.peers.read();
        let online: std::collections::HashSet<UserId> = peers
            .values()
            .filter(|p| p.is_online())
            .map(|p| p.user_id)
            .collect();
        for peer in peers.values() {
            let status = if !peer.is_online() {
                ConnectivityStatus::NoNetwork
            } else {
                let required_but_missing = online
                    .iter()
                    .any(|id| *id != peer.user_id && *id != self.local_user_id && !peer.connected_with().contains(id));
                if required_but_missing {
                    ConnectivityStatus::PartialMeshNetwork
                } else {
                    ConnectivityStatus::FullMeshNetwork
                }
            };
            peer.set_connectivity_status(status);
        }
    }

    /// Pushes this network's current group image to a freshly joined
    /// session, mirroring the way `Peer::add_session` always pushes the
    /// current profile. A network with no image set yet has nothing to
    /// send.
    pub fn push_group_image(&self, session: &Arc<Session>) -> Result<()> {
        let options = self.options();
        if options.group_image.is_empty() {
            return Ok(());
        }
        session.send_control(&ControlPacket::GroupDisplayImage {
            image: options.group_image,
            modified_at: options.group_image_modified_at,
        })
    }

    // ---- Session event dispatch --------------------------------------------

    fn handle_session_event(self: Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::PacketReceived { session, control } => {
                if let Err(e) = self.dispatch_control_packet(&session, control) {
                    log::warn!(target: "network", "control packet handling failed: {e}");
                }
            }
            SessionEvent::SecureChannelFailed { session, reason } => {
                log::warn!(target: "network", "secure channel failed: {reason}");
                self.detach_session(&session);
            }
            SessionEvent::Closed { session } => {
                self.detach_session(&session);
                self.begin_make_connection(session.connection_info.remote_endpoint.clone(), None);
            }
        }
    }

    fn detach_session(self: &Arc<Self>, session: &Arc<Session>) {
        if let Some(peer) = self.peer(session.remote_user_id) {
            peer.remove_session(session);
        }
    }

    fn dispatch_control_packet(self: &Arc<Self>, session: &Arc<Session>, packet: ControlPacket) -> Result<()> {
        match packet {
            ControlPacket::PingRequest => {
                session.send_control(&ControlPacket::PingResponse)?;
            }
            ControlPacket::PingResponse => {}
            ControlPacket::PeerExchange { peers } => self.handle_peer_exchange(session, peers),
            ControlPacket::LocalNetworkOnly { enabled, modified_at } => {
                let mut options = self.options.write();
                options.local_network_only = enabled;
                options.local_network_only_modified_at = modified_at;
            }
            ControlPacket::GroupLockNetwork { locked, modified_at } => {
                let mut options = self.options.write();
                options.group_locked = locked;
                options.group_locked_at = modified_at;
            }
            ControlPacket::Profile {
                display_name,
                status,
                status_message,
                modified_at,
            } => {
                if let Some(peer) = self.peer(session.remote_user_id) {
                    peer.set_profile(crate::peer::Profile {
                        display_name,
                        status,
                        status_message,
                        modified_at,
                    });
                }
            }
            ControlPacket::ProfileDisplayImage { image, modified_at } => {
                if let Some(peer) = self.peer(session.remote_user_id) {
                    peer.set_profile_image(crate::peer::ProfileImage {
                        bytes: image,
                        modified_at,
                    });
                }
            }
            ControlPacket::GroupDisplayImage { image, modified_at } => {
                let mut options = self.options.write();
                options.group_image = image;
                options.group_image_modified_at = modified_at;
            }
            ControlPacket::MessageTypingNotification { .. } => {}
            ControlPacket::Message {
                message_number,
                sender,
                message_type,
                payload,
                thumbnail,
                filename,
                file_size,
            } => self.handle_inbound_message(
                session,
                message_number,
                sender,
                message_type,
                payload,
                thumbnail,
                filename,
                file_size,
            )?,
            ControlPacket::MessageDeliveryNotification { message_number } => {
                self.handle_delivery_notification(session.remote_user_id, message_number)?;
            }
            ControlPacket::FileRequest {
                message_number,
                file_offset,
                data_port,
            } => self.handle_file_request(session, message_number, file_offset, data_port)?,
        }
        Ok(())
    }

    // ---- Message pipeline -----------------------------------

    /// Outbound: appends to the log, fans out to the recipient set, and
    /// locally delivers as if received from self.
    pub fn send_message(self: &Arc<Self>, message_type: mesh_types::MessageType, payload: Vec<u8>) -> Result<u64> {
        let recipients = match &self.kind {
            NetworkKind::Private { other_user_id } => vec![mesh_message_store::Recipient {
                user_id: *other_user_id,
                status: mesh_types::DeliveryStatus::Pending,
            }],
            NetworkKind::Group { .. } => self
                .peers
                .read()
                .keys()
                .map(|id| mesh_message_store::Recipient {
                    user_id: *id,
                    status: mesh_types::DeliveryStatus::Pending,
                })
                .collect(),
        };
        let record = mesh_message_store::MessageRecord {
            message_number: self.message_store.len(),
            message_type,
            sender: self.local_user_id,
            recipients,
            payload: payload.clone(),
            thumbnail: None,
            filename: None,
            file_size: None,
            local_file_path: None,
            timestamp_millis: 0,
        };
        let message_number = self.message_store.append(&record)?;
        for peer in self.peers.read().values() {
            peer.send_message(message_number, self.local_user_id, message_type, payload.clone(), None, None, None)?;
        }
        self.events.emit(NetworkEvent::MessageReceived {
            sender: self.local_user_id,
            message_number,
            payload,
        });
        Ok(message_number)
    }

    /// Shares a local file as a `FileAttachment` log entry:
    /// the file's size and name are broadcast to every current session so a
    /// recipient knows what to ask for; the local disk path never leaves
    /// this node, since only `handle_file_request` (reached via its own
    /// session) reads it back out of the store.
    pub fn send_file_attachment(self: &Arc<Self>, file_path: &std::path::Path) -> Result<u64> {
        let file_size = std::fs::metadata(file_path)?.len();
        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ErrorKind::PolicyReject("file attachment path has no file name".into()))?;

        let recipients = match &self.kind {
            NetworkKind::Private { other_user_id } => vec![mesh_message_store::Recipient {
                user_id: *other_user_id,
                status: mesh_types::DeliveryStatus::Pending,
            }],
            NetworkKind::Group { .. } => self
                .peers
                .read()
                .keys()
                .map(|id| mesh_message_store::Recipient {
                    user_id: *id,
                    status: mesh_types::DeliveryStatus::Pending,
                })
                .collect(),
        };
        let record = mesh_message_store::MessageRecord {
            message_number: self.message_store.len(),
            message_type: mesh_types::MessageType::FileAttachment,
            sender: self.local_user_id,
            recipients,
            payload: Vec::new(),
            thumbnail: None,
            filename: Some(filename.clone()),
            file_size: Some(file_size),
            local_file_path: Some(file_path.to_string_lossy().into_owned()),
            timestamp_millis: 0,
        };
        let message_number = self.message_store.append(&record)?;
        for peer in self.peers.read().values() {
            peer.send_message(
                message_number,
                self.local_user_id,
                mesh_types::MessageType::FileAttachment,
                Vec::new(),
                None,
                Some(filename.clone()),
                Some(file_size),
            )?;
        }
        Ok(message_number)
    }

    /// Shares an inline image as an `InlineImage` log entry: `image` is the
    /// full-resolution payload, `thumbnail` a smaller preview carried
    /// alongside it so a recipient can render something before the full
    /// image arrives.
    pub fn send_inline_image(self: &Arc<Self>, image: Vec<u8>, thumbnail: Option<Vec<u8>>) -> Result<u64> {
        let recipients = match &self.kind {
            NetworkKind::Private { other_user_id } => vec![mesh_message_store::Recipient {
                user_id: *other_user_id,
                status: mesh_types::DeliveryStatus::Pending,
            }],
            NetworkKind::Group { .. } => self
                .peers
                .read()
                .keys()
                .map(|id| mesh_message_store::Recipient {
                    user_id: *id,
                    status: mesh_types::DeliveryStatus::Pending,
                })
                .collect(),
        };
        let record = mesh_message_store::MessageRecord {
            message_number: self.message_store.len(),
            message_type: mesh_types::MessageType::InlineImage,
            sender: self.local_user_id,
            recipients,
            payload: image.clone(),
            thumbnail: thumbnail.clone(),
            filename: None,
            file_size: None,
            local_file_path: None,
            timestamp_millis: 0,
        };
        let message_number = self.message_store.append(&record)?;
        for peer in self.peers.read().values() {
            peer.send_message(
                message_number,
                self.local_user_id,
                mesh_types::MessageType::InlineImage,
                image.clone(),
                thumbnail.clone(),
                None,
                None,
            )?;
        }
        self.events.emit(NetworkEvent::MessageReceived {
            sender: self.local_user_id,
            message_number,
            payload: image,
        });
        Ok(message_number)
    }

    /// Persists an inbound `Message` control packet and acks it. Reached
    /// the same way for an ordinary reconnect and for an embedder's
    /// invitation-accept path: both
    /// just `join` a freshly handshaken channel and let the reader thread's
    /// normal `dispatch_control_packet` route the sender's first `Message`
    /// here.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_inbound_message(
        self: &Arc<Self>,
        session: &Arc<Session>,
        message_number: u64,
        sender: UserId,
        message_type: mesh_types::MessageType,
        payload: Vec<u8>,
        thumbnail: Option<Vec<u8>>,
        filename: Option<String>,
        file_size: Option<u64>,
    ) -> Result<()> {
        let record = mesh_message_store::MessageRecord {
            message_number: self.message_store.len(),
            message_type,
            sender,
            recipients: vec![mesh_message_store::Recipient {
                user_id: self.local_user_id,
                status: mesh_types::DeliveryStatus::Pending,
            }],
            payload: payload.clone(),
            thumbnail,
            filename,
            file_size,
            local_file_path: None,
            timestamp_millis: 0,
        };
        self.message_store.append(&record)?;
        self.events.emit(NetworkEvent::MessageReceived {
            sender,
            message_number,
            payload,
        });
        session.send_control(&ControlPacket::MessageDeliveryNotification { message_number })?;
        Ok(())
    }

    /// Under the store-wide lock (enforced by `MessageStore` itself),
    /// reload the entry, mark the recipient delivered, rewrite it.
    fn handle_delivery_notification(self: &Arc<Self>, recipient: UserId, message_number: u64) -> Result<()> {
        let mut record = self.message_store.read(message_number)?;
        for r in record.recipients.iter_mut() {
            if r.user_id == recipient {
                r.status = mesh_types::DeliveryStatus::Delivered;
            }
        }
        self.message_store.rewrite(message_number, &record)?;
        self.events.emit(NetworkEvent::MessageDelivered {
            message_number,
            recipient,
        });
        Ok(())
    }

    /// Re-delivery: walk newest-to-oldest, collect
    /// contiguous undelivered self-authored `TextMessage`s, stop at the
    /// first delivered or non-matching entry, and re-send oldest-first on
    /// `session` alone.
    pub fn resend_undelivered_messages(self: &Arc<Self>, session: &Arc<Session>, peer_user_id: UserId) -> Result<()> {
        let total = self.message_store.len();
        let mut undelivered = Vec::new();
        for number in (0..total).rev() {
            let record = self.message_store.read(number)?;
            let matches = record.message_type == mesh_types::MessageType::TextMessage
                && record.sender == self.local_user_id
                && record
                    .recipients
                    .iter()
                    .any(|r| r.user_id == peer_user_id && r.status != mesh_types::DeliveryStatus::Delivered);
            if !matches {
                break;
            }
            undelivered.push((number, record));
        }
        undelivered.reverse();
        for (number, record) in undelivered {
            session.send_control(&ControlPacket::Message {
                message_number: number,
                sender: record.sender,
                message_type: record.message_type,
                payload: record.payload,
                thumbnail: record.thumbnail,
                filename: record.filename,
                file_size: record.file_size,
            })?;
        }
        Ok(())
    }

    // ---- File transfer --------------------------------------

    /// Receiver side: tries each of the peer's sessions in
    /// turn, always asking for the bytes past the destination file's
    /// *current* length. A session that fails mid-transfer leaves whatever
    /// it already wrote on disk, so the next session simply resumes from
    /// the new length rather than restarting the whole file.
    pub fn receive_file_attachment(
        self: &Arc<Self>,
        peer_user_id: UserId,
        message_number: u64,
        file_path: &std::path::Path,
    ) -> Result<u64> {
        let peer = self
            .peer(peer_user_id)
            .ok_or_else(|| ErrorKind::InvariantViolation("unknown peer for file attachment".into()))?;
        let initial_len = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(file_path)?
            .metadata()?
            .len();

        let mut last_error = None;
        for session in peer.sessions() {
            match self.request_file_chunk(&session, message_number, file_path) {
                Ok(()) => {
                    let final_len = std::fs::metadata(file_path)?.len();
                    return Ok(final_len - initial_len);
                }
                Err(e) => {
                    log::debug!(target: "network", "file attachment session failed, falling over to the next session: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ErrorKind::TransportError("no session could serve the file attachment".into()).into()))
    }

    /// Requests and copies one session's worth of the file, starting
    /// wherever `file_path` currently ends. A 1-byte probe read commits to
    /// this session before any byte reaches disk: an empty probe (the
    /// session closed the stream without sending anything) is treated as a
    /// dead session and reported as an error so the caller falls over to
    /// the next one, rather than risking a truncated file from a session
    /// that dies partway through the copy.
    fn request_file_chunk(
        self: &Arc<Self>,
        session: &Arc<Session>,
        message_number: u64,
        file_path: &std::path::Path,
    ) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().create(true).write(true).open(file_path)?;
        let file_offset = file.seek(SeekFrom::End(0))?;

        let stream = session.open_data_stream()?;
        session.send_control(&ControlPacket::FileRequest {
            message_number,
            file_offset,
            data_port: stream.port(),
        })?;

        let probe = stream.read(crate::stream::DEFAULT_READ_TIMEOUT)?;
        if probe.is_empty() {
            return Err(
                ErrorKind::TransportError("session closed the data stream before sending any bytes".into()).into(),
            );
        }
        file.write_all(&probe)?;
        loop {
            let chunk = stream.read(crate::stream::DEFAULT_READ_TIMEOUT)?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk)?;
        }
        Ok(())
    }

    /// Sender side: opens the requested data stream, copies the local
    /// file from `file_offset` to EOF, then closes the stream.
    fn handle_file_request(
        self: &Arc<Self>,
        session: &Arc<Session>,
        message_number: u64,
        file_offset: u64,
        data_port: u16,
    ) -> Result<()> {
        let record = self.message_store.read(message_number)?;
        let path = record
            .local_file_path
            .ok_or_else(|| ErrorKind::InvariantViolation("message has no local file path".into()))?;
        let stream = session.open_data_stream_at(data_port)?;

        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(file_offset))?;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            stream.write(&buf[..n])?;
        }
        stream.close()?;
        Ok(())
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.peer_search_timer.lock().take();
        self.ping_timer.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_spec_constants() {
        let options = NetworkOptions::default();
        assert_eq!(options.peer_search_first_delay, Duration::from_secs(1));
        assert_eq!(options.peer_search_period, Duration::from_secs(60));
        assert_eq!(options.ping_period, Duration::from_secs(15));
    }
}
