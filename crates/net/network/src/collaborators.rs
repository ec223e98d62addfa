//! External collaborator seams, named after the teacher's
//! `NetworkContext` / `NetworkProtocolHandler` split in
//! `crates/net/network/src/lib.rs`: the lower crate defines the trait, a
//! higher layer supplies the implementation. `mesh-service` assembles the
//! concrete/in-memory implementations; `mesh-network` only calls through
//! these traits.

use crate::error::Result;
use mesh_types::{Endpoint, MaskedUserId, NetworkId, UserId};
use std::io::{Read, Write};
use std::path::PathBuf;

/// A mutually authenticated, encrypted byte stream to one remote peer.
/// The handshake itself (PSK exchange, client auth, renegotiation) is out
/// of scope; this crate only needs the post-handshake identity and a
/// duplex byte stream.
pub trait SecureChannel: Read + Write + Send {
    fn remote_peer_user_id(&self) -> UserId;
    fn selected_cipher(&self) -> &str;
    /// True if this side dialled (client), false if it accepted (server).
    fn is_client(&self) -> bool;
    /// An independent handle to the same underlying channel, the way
    /// `std::net::TcpStream::try_clone` lets a reader and a writer share
    /// one socket without contending on a single lock.
    fn try_clone(&self) -> Result<Box<dyn SecureChannel>>;
    /// Forces a renegotiation.
    fn renegotiate(&mut self) -> Result<()>;
}

/// Handshake parameters a `SecureChannel` is established with.
pub struct HandshakeOptions {
    pub psk: [u8; 32],
    pub trusted_identities: Option<Vec<UserId>>,
    pub cipher_suites: Vec<String>,
    pub renegotiate_after_bytes: u64,
    pub renegotiate_after_secs: u64,
}

/// A raw or virtual transport connection, pre-handshake.
pub trait Connection: Send + Sync {
    fn remote_peer_endpoint(&self) -> Endpoint;
    fn via_remote_peer_endpoint(&self) -> Option<Endpoint>;
    fn is_virtual_connection(&self) -> bool;
    fn channel_exists(&self, network_id: NetworkId) -> bool;
    /// Performs the secure-channel handshake as client, dialling out.
    fn connect_mesh_network(
        &self,
        network_id: NetworkId,
        options: &HandshakeOptions,
    ) -> Result<Box<dyn SecureChannel>>;
}

/// Mints connections and bridges to the DHT / TCP-relay service.
pub trait ConnectionManager: Send + Sync {
    fn make_connection(&self, endpoint: Endpoint) -> Result<Box<dyn Connection>>;
    fn make_virtual_connection(&self, via: Endpoint, endpoint: Endpoint) -> Result<Box<dyn Connection>>;
    fn local_port(&self) -> u16;
    fn tcp_relay_register_hosted_network(&self, network_id: NetworkId);
    fn tcp_relay_unregister_hosted_network(&self, network_id: NetworkId);

    fn begin_find_peers(
        &self,
        target: MaskedUserId,
        lan_only: bool,
        callback: Box<dyn FnOnce(Vec<Endpoint>) + Send>,
    );
    fn begin_announce(
        &self,
        network_id: NetworkId,
        lan_only: bool,
        callback: Box<dyn FnOnce(Vec<Endpoint>) + Send>,
    );
}

/// The profile/identity holder: the user's static keypair and display
/// identity, and the node-level network registry.
pub trait Node: Send + Sync {
    fn local_user_id(&self) -> UserId;
    fn supported_ciphers(&self) -> Vec<String>;
    fn profile_folder(&self) -> PathBuf;
    fn display_name(&self) -> String;
    fn status(&self) -> String;
    fn status_message(&self) -> String;
    /// Milliseconds since the epoch at which `display_name`/`status`/
    /// `status_message` last changed, so a `Network` can announce a real
    /// last-modified time instead of stamping the moment it happens to ask.
    fn profile_modified_at(&self) -> u64;

    /// Called once a network has finished constructing so the node's
    /// registry can detect `networkId` collisions.
    fn mesh_network_changed(&self, old_id: Option<NetworkId>, new_id: NetworkId) -> Result<()>;
    fn delete_mesh_network(&self, network_id: NetworkId);
}
