//! One authenticated channel: owns a dedicated reader
//! thread, dispatches control frames to a `SessionEvent` bus, and feeds
//! data frames into the per-session `StreamTable`. Grounded in the
//! teacher's `NetworkIoMessage` channel-based handoff from I/O threads to
//! the service layer (`crates/net/network-devp2p/src/io.rs`).

use crate::collaborators::{Connection, SecureChannel};
use crate::error::{Error, ErrorKind, Result};
use crate::packet::{read_frame, write_frame, ControlPacket, CONTROL_PORT};
use crate::stream::{DataStream, PortAllocator, StreamTable, FEED_TIMEOUT};
use mesh_io::EventSender;
use mesh_types::{Endpoint, UserId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Renegotiation thresholds.
pub const RENEGOTIATE_AFTER_BYTES: u64 = 100 * 1024 * 1024;
pub const RENEGOTIATE_AFTER_SECS: u64 = 3600;

/// Events a `Session` emits to its owning `Peer`/`Network`.
pub enum SessionEvent {
    PacketReceived {
        session: Arc<Session>,
        control: ControlPacket,
    },
    SecureChannelFailed {
        session: Arc<Session>,
        reason: String,
    },
    Closed {
        session: Arc<Session>,
    },
}

/// Connection-derived metadata captured once at session creation.
pub struct ConnectionInfo {
    pub remote_endpoint: Endpoint,
    pub via_remote_endpoint: Option<Endpoint>,
    pub is_virtual: bool,
}

impl ConnectionInfo {
    pub fn from_connection(connection: &dyn Connection) -> ConnectionInfo {
        ConnectionInfo {
            remote_endpoint: connection.remote_peer_endpoint(),
            via_remote_endpoint: connection.via_remote_peer_endpoint(),
            is_virtual: connection.is_virtual_connection(),
        }
    }
}

pub struct Session {
    pub remote_user_id: UserId,
    pub connection_info: ConnectionInfo,
    writer: Mutex<Box<dyn SecureChannel>>,
    streams: StreamTable,
    port_allocator: Mutex<PortAllocator>,
    closed: AtomicBool,
    bytes_sent: AtomicU64,
    handshake_started: Mutex<Instant>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// The most recent `PeerExchange` payload this session reported,
    /// used by `Network`'s connectivity-status computation.
    last_peer_exchange: Mutex<Vec<crate::packet::PeerExchangeEntry>>,
}

impl Session {
    /// Spawns the reader thread and returns the session handle. `events`
    /// receives `PacketReceived`/`SecureChannelFailed`/`Closed` for the
    /// lifetime of the session.
    pub fn start(
        channel: Box<dyn SecureChannel>,
        connection: &dyn Connection,
        events: EventSender<SessionEvent>,
    ) -> Result<Arc<Session>> {
        let remote_user_id = channel.remote_peer_user_id();
        let is_client = channel.is_client();
        let reader_channel = channel.try_clone()?;

        let session = Arc::new(Session {
            remote_user_id,
            connection_info: ConnectionInfo::from_connection(connection),
            writer: Mutex::new(channel),
            streams: StreamTable::new(),
            port_allocator: Mutex::new(PortAllocator::new(is_client)),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            handshake_started: Mutex::new(Instant::now()),
            reader: Mutex::new(None),
            last_peer_exchange: Mutex::new(Vec::new()),
        });

        // The reader only ever holds a weak reference: a strong one would
        // keep the session alive for as long as the thread runs, and the
        // thread only stops once the session is torn down.
        let weak_session = Arc::downgrade(&session);
        let handle = std::thread::spawn(move || Session::run_reader(weak_session, reader_channel, events));
        *session.reader.lock() = Some(handle);
        Ok(session)
    }

    fn run_reader(
        weak_session: std::sync::Weak<Session>,
        mut channel: Box<dyn SecureChannel>,
        events: EventSender<SessionEvent>,
    ) {
        loop {
            let frame = read_frame(&mut *channel);
            let session = match weak_session.upgrade() {
                Some(session) => session,
                None => return,
            };
            if session.closed.load(Ordering::Acquire) {
                return;
            }
            match frame {
                Ok((CONTROL_PORT, payload)) => match ControlPacket::decode(&payload) {
                    Ok(control) => {
                        events.emit(SessionEvent::PacketReceived { session, control });
                    }
                    Err(e) => {
                        log::warn!(target: "session", "dropping undecodable control frame: {e}");
                    }
                },
                Ok((port, payload)) => {
                    if let Some(stream) = session.streams.get(port) {
                        if let Err(e) = stream.feed(payload, FEED_TIMEOUT) {
                            log::warn!(target: "session", "feed into port {port} failed: {e}; tearing down session");
                            session.mark_closed();
                            events.emit(SessionEvent::Closed { session });
                            return;
                        }
                    }
                    // No stream registered: bytes are already drained off
                    // the wire by `read_frame`, preserving framing.
                }
                Err(Error(ErrorKind::Io(e), _)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    session.mark_closed();
                    events.emit(SessionEvent::Closed { session });
                    return;
                }
                Err(e) => {
                    session.mark_closed();
                    let reason = e.to_string();
                    events.emit(SessionEvent::SecureChannelFailed { session, reason });
                    return;
                }
            }
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends a control packet, serialised on the per-channel send lock
    ///, applying
    /// renegotiation thresholds afterwards.
    pub fn send_control(&self, packet: &ControlPacket) -> Result<()> {
        let encoded = packet.encode();
        let mut channel = self.writer.lock();
        write_frame(&mut *channel, CONTROL_PORT, &encoded)?;
        self.after_send(&mut channel, encoded.len() as u64)
    }

    fn after_send(&self, channel: &mut Box<dyn SecureChannel>, len: u64) -> Result<()> {
        let total = self.bytes_sent.fetch_add(len, Ordering::Relaxed) + len;
        let elapsed = self.handshake_started.lock().elapsed();
        if total >= RENEGOTIATE_AFTER_BYTES || elapsed >= Duration::from_secs(RENEGOTIATE_AFTER_SECS) {
            channel.renegotiate()?;
            self.bytes_sent.store(0, Ordering::Relaxed);
            *self.handshake_started.lock() = Instant::now();
        }
        Ok(())
    }

    /// Opens a fresh outbound `DataStream`, auto-allocating its port.
    pub fn open_data_stream(self: &Arc<Self>) -> Result<Arc<DataStream>> {
        let port = self.port_allocator.lock().allocate();
        self.open_data_stream_at(port)
    }

    /// Opens a `DataStream` at a caller-chosen port (the responder path).
    pub fn open_data_stream_at(self: &Arc<Self>, port: u16) -> Result<Arc<DataStream>> {
        let session = self.clone();
        self.streams
            .open_at(port, Box::new(move |p, bytes| session.emit_frame(p, bytes)))
    }

    pub fn close_data_stream(&self, port: u16) {
        self.streams.remove(port);
    }

    fn emit_frame(&self, port: u16, bytes: &[u8]) -> Result<()> {
        let mut channel = self.writer.lock();
        write_frame(&mut *channel, port, bytes)?;
        self.after_send(&mut channel, bytes.len() as u64)
    }

    /// Tears the session down. The reader thread holds only a weak
    /// reference to this session, so it notices on its next loop
    /// iteration (after its current blocking read returns or errors) and
    /// exits on its own; we do not join it here, since a read with no
    /// data in flight may block indefinitely and joining would wait on it.
    pub fn disconnect(&self) {
        self.mark_closed();
    }

    pub fn record_peer_exchange(&self, entries: Vec<crate::packet::PeerExchangeEntry>) {
        *self.last_peer_exchange.lock() = entries;
    }

    pub fn last_peer_exchange(&self) -> Vec<crate::packet::PeerExchangeEntry> {
        self.last_peer_exchange.lock().clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.mark_closed();
        self.reader.lock().take();
    }
}
