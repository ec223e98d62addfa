//! Client & network service creation: the node-level
//! facade that owns the local identity, the connection manager, and the
//! registry of every network currently hosted. Wires a `Node`
//! implementation, a `ConnectionManager`, and a `MessageStore` per network
//! into a running `mesh_network::Network`, the way the teacher's
//! `ethcore-service` wires a `Client` and a sync `ChainNotify` into a
//! running `ClientService`.

pub mod error;
pub mod memory;

use error::{ErrorKind, Result};
use memory::transport::{AcceptedConnection, InMemoryConnectionManager, InMemorySecureChannel};
use memory::Hello;
use mesh_crypto::NetworkIdentity;
use mesh_io::{EventBus, WorkerPool};
use mesh_message_store::MessageStore;
use mesh_network::collaborators::{ConnectionManager, Node, SecureChannel};
use mesh_network::{Network, NetworkEvent, NetworkOptions, PeerEvent};
use mesh_types::{Endpoint, NetworkId, NetworkKind, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// A hosted network plus the two event buses its creator drains.
pub struct NetworkHandle {
    pub network: Arc<Network>,
    pub events: Arc<EventBus<NetworkEvent>>,
    pub peer_events: Arc<EventBus<PeerEvent>>,
}

struct ProfileState {
    display_name: String,
    status: String,
    status_message: String,
    modified_at: u64,
}

/// Milliseconds since the Unix epoch, used to stamp `ProfileState` the way
/// `mesh-network`'s own `*_modified_at` fields are stamped.
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The node-level facade: one per local identity. Owns
/// the registry of hosted `Network`s and implements `Node` so a `Network`
/// can reach back into it for ciphers, profile fields, and networkId
/// collision detection.
pub struct MeshNetworkService {
    local_user_id: UserId,
    ciphers: Vec<String>,
    profile_folder: PathBuf,
    profile: RwLock<ProfileState>,
    networks: Mutex<HashMap<NetworkId, NetworkHandle>>,
    connection_manager: Arc<InMemoryConnectionManager>,
    workers: Arc<WorkerPool>,
    shutting_down: AtomicBool,
}

impl MeshNetworkService {
    pub fn new(
        local_user_id: UserId,
        ciphers: Vec<String>,
        profile_folder: PathBuf,
        connection_manager: Arc<InMemoryConnectionManager>,
    ) -> Arc<MeshNetworkService> {
        Arc::new(MeshNetworkService {
            local_user_id,
            ciphers,
            profile_folder,
            profile: RwLock::new(ProfileState {
                display_name: String::new(),
                status: String::new(),
                status_message: String::new(),
                modified_at: now_millis(),
            }),
            networks: Mutex::new(HashMap::new()),
            connection_manager,
            workers: Arc::new(WorkerPool::new("mesh-dial", 4)),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn local_user_id(&self) -> UserId {
        self.local_user_id
    }

    pub fn connection_manager(&self) -> Arc<InMemoryConnectionManager> {
        self.connection_manager.clone()
    }

    pub fn set_profile(&self, display_name: String, status: String, status_message: String) {
        *self.profile.write() = ProfileState {
            display_name,
            status,
            status_message,
            modified_at: now_millis(),
        };
    }

    pub fn network(&self, network_id: NetworkId) -> Option<Arc<Network>> {
        self.networks.lock().get(&network_id).map(|h| h.network.clone())
    }

    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.networks.lock().values().map(|h| h.network.clone()).collect()
    }

    /// Drains whatever `NetworkEvent`s the network identified by
    /// `network_id` has queued since the last drain.
    pub fn drain_events(&self, network_id: NetworkId) -> Vec<NetworkEvent> {
        self.networks
            .lock()
            .get(&network_id)
            .map(|h| h.events.drain())
            .unwrap_or_default()
    }

    pub fn drain_peer_events(&self, network_id: NetworkId) -> Vec<PeerEvent> {
        self.networks
            .lock()
            .get(&network_id)
            .map(|h| h.peer_events.drain())
            .unwrap_or_default()
    }

    /// Creates (but does not start) a Private network. Fails with `PolicyReject` if the derived id
    /// collides with one already hosted on this node.
    pub fn create_private(self: &Arc<Self>, other_user_id: UserId, shared_secret: &str) -> Result<Arc<Network>> {
        self.create_network(NetworkKind::Private { other_user_id }, shared_secret)
    }

    /// Creates a Group network.
    pub fn create_group(self: &Arc<Self>, name: String, shared_secret: &str) -> Result<Arc<Network>> {
        self.create_network(NetworkKind::Group { name }, shared_secret)
    }

    /// Sends the first message of a brand-new Private invitation: derives the network
    /// with the empty shared secret, appends `text` as the first
    /// `TextMessage` directly to the log (the invariant `invitation_pending`
    /// tests for), and returns the network so the caller can `go_online` it
    /// to start dialling `other_user_id`.
    pub fn invite(self: &Arc<Self>, other_user_id: UserId, text: Vec<u8>) -> Result<Arc<Network>> {
        let network = self.create_private(other_user_id, "")?;
        network.send_message(mesh_types::MessageType::TextMessage, text)?;
        Ok(network)
    }

    fn create_network(self: &Arc<Self>, kind: NetworkKind, shared_secret: &str) -> Result<Arc<Network>> {
        let identity = NetworkIdentity::derive(shared_secret, &kind, self.local_user_id);
        let mut networks = self.networks.lock();
        if networks.contains_key(&identity.network_id) {
            return Err(ErrorKind::PolicyReject("same network id already exists".into()).into());
        }
        let handle = self.build_network(identity, kind, shared_secret.to_string(), NetworkOptions::default())?;
        let network = handle.network.clone();
        networks.insert(identity.network_id, handle);
        Ok(network)
    }

    fn build_network(
        self: &Arc<Self>,
        identity: NetworkIdentity,
        kind: NetworkKind,
        shared_secret: String,
        options: NetworkOptions,
    ) -> Result<NetworkHandle> {
        let store_id = format!("{:x}", identity.network_id);
        let message_store = Arc::new(MessageStore::open(&self.profile_folder, &store_id, identity.network_secret.as_fixed_bytes())?);
        let events: Arc<EventBus<NetworkEvent>> = Arc::new(EventBus::new());
        let peer_events: Arc<EventBus<PeerEvent>> = Arc::new(EventBus::new());
        let node: Arc<dyn Node> = self.clone();
        let network = Network::new(
            identity.network_id,
            identity.network_secret,
            kind,
            self.local_user_id,
            shared_secret,
            options,
            message_store,
            self.connection_manager.clone() as Arc<dyn ConnectionManager>,
            node,
            self.workers.clone(),
            events.sender(),
            peer_events.sender(),
        );
        Ok(NetworkHandle { network, events, peer_events })
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.profile_folder.join("networks")
    }

    /// Writes this network's current persisted state (spec.md §4.7) to
    /// `{profileFolder}/networks/{id}.snapshot`, so `restore_networks` can
    /// reconstruct its options and known-peer roster after a process
    /// restart without waiting on a fresh peer-exchange round.
    pub fn persist_network(&self, network_id: NetworkId) -> Result<()> {
        let network = self
            .networks
            .lock()
            .get(&network_id)
            .map(|h| h.network.clone())
            .ok_or_else(|| ErrorKind::InvariantViolation("no such hosted network".into()))?;
        let dir = self.snapshots_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{:x}.snapshot", network_id));
        std::fs::write(path, network.snapshot().encode())?;
        Ok(())
    }

    /// Reconstructs every network found under `{profileFolder}/networks/`,
    /// restoring its options and known-peer display names from its
    /// snapshot. Restored networks start `Offline`; the caller decides
    /// which to bring online.
    pub fn restore_networks(self: &Arc<Self>) -> Result<Vec<Arc<Network>>> {
        let dir = self.snapshots_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut restored = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("snapshot") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let snapshot = mesh_network::snapshot::NetworkSnapshot::decode(&bytes)?;

            let identity = NetworkIdentity {
                network_id: snapshot.network_id,
                network_secret: snapshot.network_secret,
            };
            let options = NetworkOptions {
                local_network_only: snapshot.local_network_only,
                local_network_only_modified_at: snapshot.local_network_only_modified_at,
                mute: snapshot.mute,
                group_locked: snapshot.group_locked,
                group_locked_at: snapshot.group_locked_at,
                group_image: snapshot.group_image.clone(),
                group_image_modified_at: snapshot.group_image_modified_at,
                ..NetworkOptions::default()
            };

            let mut networks = self.networks.lock();
            if networks.contains_key(&snapshot.network_id) {
                continue;
            }
            let handle = self.build_network(identity, snapshot.kind.clone(), snapshot.shared_secret.clone(), options)?;
            let network = handle.network.clone();
            networks.insert(snapshot.network_id, handle);
            drop(networks);

            network.restore_known_peers(&snapshot.peers);
            restored.push(network);
        }
        Ok(restored)
    }

    /// Spawns the accept loop on the bound listener: every inbound socket
    /// is handed to its own thread so one slow handshake never blocks
    /// another.
    pub fn start_listening(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .connection_manager
            .take_listener()
            .ok_or_else(|| ErrorKind::InvariantViolation("listener already taken".into()))?;
        let service = self.clone();
        thread::Builder::new()
            .name("mesh-service-accept".into())
            .spawn(move || {
                for incoming in listener.incoming() {
                    match incoming {
                        Ok(stream) => {
                            let service = service.clone();
                            thread::spawn(move || {
                                if let Err(e) = service.handle_inbound(stream) {
                                    log::debug!(target: "service", "inbound handshake failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            if service.shutting_down.load(Ordering::Acquire) {
                                return;
                            }
                            log::warn!(target: "service", "accept failed: {e}");
                        }
                    }
                }
            })
            .map_err(|e| ErrorKind::TransportError(e.to_string()))?;
        Ok(())
    }

    /// Explicit `DeleteNetwork`, distinct from an ordinary
    /// `shutdown`: disposes the network -- which unregisters it from the
    /// relay and drops it from the node's registry via `delete_mesh_network`
    /// -- then removes its on-disk message log. An ordinary process restart
    /// must never lose messages, so only this explicit path deletes files.
    pub fn delete_network(&self, network_id: NetworkId) -> Result<()> {
        let network = self
            .networks
            .lock()
            .get(&network_id)
            .map(|h| h.network.clone())
            .ok_or_else(|| ErrorKind::InvariantViolation("no such hosted network".into()))?;
        network.dispose();
        let store_id = format!("{:x}", network_id);
        mesh_message_store::delete(&self.profile_folder, &store_id)?;
        Ok(())
    }

    /// Tears every hosted network offline and disposes it. Unlike `delete_network`, this never touches the
    /// on-disk message logs -- a restart reopens them unchanged.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let networks: Vec<Arc<Network>> = self.networks.lock().values().map(|h| h.network.clone()).collect();
        for network in networks {
            network.dispose();
        }
    }

    fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let client_hello = Hello::read(&mut stream)?;
        let claimed_network_id = client_hello.network_id();
        let remote_endpoint = Endpoint::new(stream.peer_addr().map_err(|e| ErrorKind::TransportError(e.to_string()))?);

        match self.network(claimed_network_id) {
            Some(network) => self.accept_known_network(network, stream, &client_hello, remote_endpoint),
            None => self.accept_invitation(stream, &client_hello, remote_endpoint),
        }
    }

    /// Known-network reconnect path: the inbound socket
    /// already names a `networkId` this node hosts, so the normal
    /// handshake-options / PSK check applies.
    fn accept_known_network(self: &Arc<Self>, network: Arc<Network>, mut stream: TcpStream, client_hello: &Hello, remote_endpoint: Endpoint) -> Result<()> {
        let options = network.handshake_options(false, None)?;
        if client_hello.psk != options.psk {
            return Err(ErrorKind::CryptoFailure("psk mismatch on accept".into()).into());
        }
        let remote_user_id = client_hello.user_id();
        if let Some(trusted) = &options.trusted_identities {
            if !trusted.contains(&remote_user_id) {
                return Err(ErrorKind::CryptoFailure("untrusted identity on accept".into()).into());
            }
        }
        let server_hello = Hello::new(client_hello.network_id(), self.local_user_id, options.psk);
        server_hello.write(&mut stream)?;

        let cipher = options.cipher_suites.first().cloned().unwrap_or_else(|| "mesh-test-cipher".into());
        let channel: Box<dyn SecureChannel> = Box::new(InMemorySecureChannel::new(stream, remote_user_id, false, cipher));
        let connection = AcceptedConnection::new(remote_endpoint, false);
        network.join(channel, &connection)?;
        Ok(())
    }

    /// Invitation accept path: the
    /// claimed `networkId` is unrecognised, so the inbound side must prove
    /// it addressed this specific node by using our own `userId` as the
    /// PSK. That alone is enough to derive the new Offline Private
    /// network's identity (empty shared secret, `kind = Private {
    /// other_user_id: sender }`) from the handshake: once the network
    /// exists and `join` hands its session to the normal reader thread, the
    /// sender's `Profile` and the invitation `TextMessage` itself arrive
    /// and are dispatched exactly like any other inbound control traffic
    /// (`handle_inbound_message` is the same code path a reconnect uses).
    fn accept_invitation(self: &Arc<Self>, mut stream: TcpStream, client_hello: &Hello, remote_endpoint: Endpoint) -> Result<()> {
        if client_hello.psk != *self.local_user_id.as_fixed_bytes() {
            return Err(ErrorKind::CryptoFailure("invitation psk does not prove knowledge of our user id".into()).into());
        }
        let sender = client_hello.user_id();
        let server_hello = Hello::new(client_hello.network_id(), self.local_user_id, client_hello.psk);
        server_hello.write(&mut stream)?;

        let kind = NetworkKind::Private { other_user_id: sender };
        let identity = NetworkIdentity::derive("", &kind, self.local_user_id);
        if identity.network_id != client_hello.network_id() {
            return Err(ErrorKind::InvariantViolation("invitation networkId does not match the empty-secret derivation".into()).into());
        }

        let network = {
            let mut networks = self.networks.lock();
            if let Some(existing) = networks.get(&identity.network_id) {
                existing.network.clone()
            } else {
                let handle = self.build_network(identity, kind, String::new())?;
                let network = handle.network.clone();
                networks.insert(identity.network_id, handle);
                network
            }
        };

        let cipher = self.ciphers.first().cloned().unwrap_or_else(|| "mesh-test-cipher".into());
        let channel: Box<dyn SecureChannel> = Box::new(InMemorySecureChannel::new(stream, sender, false, cipher));
        let connection = AcceptedConnection::new(remote_endpoint, false);
        network.join(channel, &connection)?;
        Ok(())
    }
}

impl Node for MeshNetworkService {
    fn local_user_id(&self) -> UserId {
        self.local_user_id
    }

    fn supported_ciphers(&self) -> Vec<String> {
        self.ciphers.clone()
    }

    fn profile_folder(&self) -> PathBuf {
        self.profile_folder.clone()
    }

    fn display_name(&self) -> String {
        self.profile.read().display_name.clone()
    }

    fn status(&self) -> String {
        self.profile.read().status.clone()
    }

    fn status_message(&self) -> String {
        self.profile.read().status_message.clone()
    }

    fn profile_modified_at(&self) -> u64 {
        self.profile.read().modified_at
    }

    /// Collision detection for `changeSharedSecret`: rejects if `new_id` is already
    /// hosted, otherwise re-keys the registry entry from `old_id`.
    fn mesh_network_changed(&self, old_id: Option<NetworkId>, new_id: NetworkId) -> Result<()> {
        let mut networks = self.networks.lock();
        if networks.contains_key(&new_id) {
            return Err(ErrorKind::PolicyReject("same network id already exists".into()).into());
        }
        if let Some(old_id) = old_id {
            if let Some(handle) = networks.remove(&old_id) {
                networks.insert(new_id, handle);
            }
        }
        Ok(())
    }

    fn delete_mesh_network(&self, network_id: NetworkId) {
        self.networks.lock().remove(&network_id);
    }
}
