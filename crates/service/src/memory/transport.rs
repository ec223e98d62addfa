//! Loopback-TCP test double for `mesh_network::collaborators`: a real `std::net` socket stands in for the production transport,
//! and `handshake::Hello` stands in for the out-of-scope secure-channel
//! handshake. `InMemoryConnection` is the pre-handshake, client-role half
//! (it still owns the socket and performs `Hello`); `AcceptedConnection` is
//! the post-handshake, server-role half (the socket has already been
//! consumed into a `SecureChannel` by the accept-loop in `lib.rs`).

use crate::memory::directory::Directory;
use crate::memory::handshake::Hello;
use mesh_network::collaborators::{Connection, ConnectionManager, HandshakeOptions, SecureChannel};
use mesh_network::error::{ErrorKind, Result};
use mesh_network::discovery::is_rfc1918_or_link_local;
use mesh_types::{Endpoint, MaskedUserId, NetworkId, UserId};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

pub struct InMemorySecureChannel {
    stream: TcpStream,
    remote_user_id: UserId,
    is_client: bool,
    cipher: String,
}

impl InMemorySecureChannel {
    pub fn new(stream: TcpStream, remote_user_id: UserId, is_client: bool, cipher: String) -> InMemorySecureChannel {
        InMemorySecureChannel {
            stream,
            remote_user_id,
            is_client,
            cipher,
        }
    }
}

impl Read for InMemorySecureChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for InMemorySecureChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl SecureChannel for InMemorySecureChannel {
    fn remote_peer_user_id(&self) -> UserId {
        self.remote_user_id
    }

    fn selected_cipher(&self) -> &str {
        &self.cipher
    }

    fn is_client(&self) -> bool {
        self.is_client
    }

    fn try_clone(&self) -> Result<Box<dyn SecureChannel>> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| ErrorKind::TransportError(e.to_string()))?;
        Ok(Box::new(InMemorySecureChannel {
            stream,
            remote_user_id: self.remote_user_id,
            is_client: self.is_client,
            cipher: self.cipher.clone(),
        }))
    }

    fn renegotiate(&mut self) -> Result<()> {
        // The loopback socket carries every byte inside this one test
        // process already; there is no cryptographic state here to rotate.
        Ok(())
    }
}

/// Pre-handshake client-role connection: dials, performs `Hello`, and
/// consumes itself into a `SecureChannel` on success.
pub struct InMemoryConnection {
    remote_endpoint: Endpoint,
    via_endpoint: Option<Endpoint>,
    local_user_id: UserId,
    stream: Mutex<Option<TcpStream>>,
}

impl InMemoryConnection {
    pub(crate) fn new(remote_endpoint: Endpoint, via_endpoint: Option<Endpoint>, local_user_id: UserId, stream: TcpStream) -> InMemoryConnection {
        InMemoryConnection {
            remote_endpoint,
            via_endpoint,
            local_user_id,
            stream: Mutex::new(Some(stream)),
        }
    }
}

impl Connection for InMemoryConnection {
    fn remote_peer_endpoint(&self) -> Endpoint {
        self.remote_endpoint.clone()
    }

    fn via_remote_peer_endpoint(&self) -> Option<Endpoint> {
        self.via_endpoint.clone()
    }

    fn is_virtual_connection(&self) -> bool {
        self.via_endpoint.is_some()
    }

    fn channel_exists(&self, _network_id: NetworkId) -> bool {
        false
    }

    fn connect_mesh_network(&self, network_id: NetworkId, options: &HandshakeOptions) -> Result<Box<dyn SecureChannel>> {
        let mut stream = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| ErrorKind::TransportError("connection already consumed by a handshake".into()))?;
        let hello = Hello::new(network_id, self.local_user_id, options.psk);
        hello.write(&mut stream)?;
        let reply = Hello::read(&mut stream)?;
        if reply.psk != options.psk {
            return Err(ErrorKind::CryptoFailure("psk mismatch in handshake reply".into()).into());
        }
        let remote_user_id = reply.user_id();
        if let Some(trusted) = &options.trusted_identities {
            if !trusted.contains(&remote_user_id) {
                return Err(ErrorKind::CryptoFailure("untrusted remote identity".into()).into());
            }
        }
        let cipher = options.cipher_suites.first().cloned().unwrap_or_else(|| "mesh-test-cipher".into());
        Ok(Box::new(InMemorySecureChannel::new(stream, remote_user_id, true, cipher)))
    }
}

/// Post-handshake connection metadata (the accept-loop already consumed
/// the socket into a `SecureChannel` before `Network::join` ever sees
/// this); `connect_mesh_network` is unreachable on the server role.
pub struct AcceptedConnection {
    remote_endpoint: Endpoint,
    is_virtual: bool,
}

impl AcceptedConnection {
    pub fn new(remote_endpoint: Endpoint, is_virtual: bool) -> AcceptedConnection {
        AcceptedConnection { remote_endpoint, is_virtual }
    }
}

impl Connection for AcceptedConnection {
    fn remote_peer_endpoint(&self) -> Endpoint {
        self.remote_endpoint.clone()
    }

    fn via_remote_peer_endpoint(&self) -> Option<Endpoint> {
        None
    }

    fn is_virtual_connection(&self) -> bool {
        self.is_virtual
    }

    fn channel_exists(&self, _network_id: NetworkId) -> bool {
        false
    }

    fn connect_mesh_network(&self, _network_id: NetworkId, _options: &HandshakeOptions) -> Result<Box<dyn SecureChannel>> {
        Err(ErrorKind::InvariantViolation("an accepted connection never dials out".into()).into())
    }
}

/// Binds one loopback listener per node and mints `InMemoryConnection`s
/// that dial other nodes sharing the same `Directory`.
pub struct InMemoryConnectionManager {
    local_user_id: UserId,
    local_endpoint: Endpoint,
    listener: Mutex<Option<TcpListener>>,
    directory: Arc<Directory>,
}

impl InMemoryConnectionManager {
    pub fn bind(local_user_id: UserId, directory: Arc<Directory>) -> Result<Arc<InMemoryConnectionManager>> {
        let listener = TcpListener::bind("127.0.0.1:0").map_err(|e| ErrorKind::TransportError(e.to_string()))?;
        let local_endpoint = Endpoint::new(listener.local_addr().map_err(|e| ErrorKind::TransportError(e.to_string()))?);
        Ok(Arc::new(InMemoryConnectionManager {
            local_user_id,
            local_endpoint,
            listener: Mutex::new(Some(listener)),
            directory,
        }))
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local_endpoint.clone()
    }

    /// Hands the bound listener to its one caller
    /// (`MeshNetworkService::start_listening`). Returns `None` if already
    /// taken.
    pub fn take_listener(&self) -> Option<TcpListener> {
        self.listener.lock().take()
    }
}

impl ConnectionManager for InMemoryConnectionManager {
    fn make_connection(&self, endpoint: Endpoint) -> Result<Box<dyn Connection>> {
        let stream = TcpStream::connect(endpoint.address).map_err(|e| ErrorKind::TransportError(e.to_string()))?;
        Ok(Box::new(InMemoryConnection::new(endpoint, None, self.local_user_id, stream)))
    }

    fn make_virtual_connection(&self, via: Endpoint, endpoint: Endpoint) -> Result<Box<dyn Connection>> {
        // A genuine relay hop is out of scope for this fixture: dial the
        // target directly but keep `via` for session metadata, matching the
        // shape of a relayed connection without its transport.
        let stream = TcpStream::connect(endpoint.address).map_err(|e| ErrorKind::TransportError(e.to_string()))?;
        Ok(Box::new(InMemoryConnection::new(endpoint, Some(via), self.local_user_id, stream)))
    }

    fn local_port(&self) -> u16 {
        self.local_endpoint.address.port()
    }

    fn tcp_relay_register_hosted_network(&self, network_id: NetworkId) {
        self.directory.announce_network(network_id, self.local_endpoint.clone());
    }

    fn tcp_relay_unregister_hosted_network(&self, network_id: NetworkId) {
        self.directory.unregister_network(network_id, &self.local_endpoint);
    }

    fn begin_find_peers(&self, target: MaskedUserId, lan_only: bool, callback: Box<dyn FnOnce(Vec<Endpoint>) + Send>) {
        let directory = self.directory.clone();
        std::thread::spawn(move || {
            let mut endpoints = directory.find_by_masked_user(target);
            if lan_only {
                endpoints.retain(|e| is_rfc1918_or_link_local(&e.address));
            }
            callback(endpoints);
        });
    }

    fn begin_announce(&self, network_id: NetworkId, lan_only: bool, callback: Box<dyn FnOnce(Vec<Endpoint>) + Send>) {
        let directory = self.directory.clone();
        let local_endpoint = self.local_endpoint.clone();
        let masked = mesh_crypto::masked_user_id(&self.local_user_id);
        directory.announce_presence(masked, local_endpoint.clone());
        std::thread::spawn(move || {
            let mut endpoints = directory.announce_network(network_id, local_endpoint);
            if lan_only {
                endpoints.retain(|e| is_rfc1918_or_link_local(&e.address));
            }
            callback(endpoints);
        });
    }
}
