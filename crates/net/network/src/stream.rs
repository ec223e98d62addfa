//! Data stream multiplexer: numbered logical pipes carried
//! inside a `Session`'s framed byte channel. Grounded in the teacher's
//! condition-variable handoff pattern used for blocking queue consumers
//! (`crates/runtime/io/src/worker.rs`'s `Condvar`-gated job queue),
//! generalised here to a single-slot buffer instead of a queue.

use crate::error::{Error, ErrorKind, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default deadline for `DataStream::read`.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline `Session` applies when feeding bytes into a stream.
pub const FEED_TIMEOUT: Duration = Duration::from_secs(30);

const WRAP_LIMIT: u16 = u16::MAX - 3;

/// Allocates ports for locally-opened streams, preserving client/server
/// parity.
pub struct PortAllocator {
    last_port: u16,
    is_client: bool,
}

impl PortAllocator {
    pub fn new(is_client: bool) -> Self {
        PortAllocator {
            last_port: if is_client { 1 } else { 0 },
            is_client,
        }
    }

    /// Returns the next free port, wrapping at `u16::MAX - 3` back to the
    /// role's parity base.
    pub fn allocate(&mut self) -> u16 {
        self.last_port = if self.last_port >= WRAP_LIMIT {
            if self.is_client {
                1
            } else {
                0
            }
        } else {
            self.last_port + 2
        };
        self.last_port
    }
}

struct Slot {
    buffer: Option<Vec<u8>>,
    /// Peer sent a zero-length frame: no more data will ever arrive.
    remote_closed: bool,
    /// We called `close()`: further `feed` calls are dropped silently.
    local_closed: bool,
}

/// A duplex byte pipe multiplexed on one port inside a `Session`.
///
/// `Write` emits one frame per call via `emit_frame`. `Read` blocks on the
/// single-slot buffer until data arrives, the peer closes, or the read
/// times out. `feed` is how the owning `Session`'s reader thread deposits
/// bytes; it blocks until the previous frame has been drained so no frame
/// is ever overwritten before being read.
pub struct DataStream {
    port: u16,
    slot: Mutex<Slot>,
    cond: Condvar,
    emit_frame: Box<dyn Fn(u16, &[u8]) -> Result<()> + Send + Sync>,
}

impl DataStream {
    pub fn new(port: u16, emit_frame: Box<dyn Fn(u16, &[u8]) -> Result<()> + Send + Sync>) -> Arc<DataStream> {
        Arc::new(DataStream {
            port,
            slot: Mutex::new(Slot {
                buffer: None,
                remote_closed: false,
                local_closed: false,
            }),
            cond: Condvar::new(),
            emit_frame,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Blocks until the buffer has data, the stream is closed, or
    /// `timeout` elapses. An empty result means orderly end-of-stream.
    pub fn read(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut slot = self.slot.lock();
        let deadline = Instant::now() + timeout;
        while slot.buffer.is_none() && !slot.remote_closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::from(ErrorKind::Timeout(format!(
                    "read on port {} timed out",
                    self.port
                ))));
            }
            self.cond.wait_for(&mut slot, remaining);
        }
        if let Some(buf) = slot.buffer.take() {
            self.cond.notify_all();
            Ok(buf)
        } else {
            Ok(Vec::new())
        }
    }

    /// Writes exactly one framed packet.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        (self.emit_frame)(self.port, data)
    }

    /// Sends the zero-length close frame and marks this side closed.
    pub fn close(&self) -> Result<()> {
        (self.emit_frame)(self.port, &[])?;
        self.slot.lock().local_closed = true;
        self.cond.notify_all();
        Ok(())
    }

    /// Deposits bytes read off the wire for this port (called by the
    /// owning `Session`'s reader thread). Blocks until the previous frame
    /// has been drained by the consumer, up to `deadline`. An empty
    /// `data` marks end-of-stream.
    pub fn feed(&self, data: Vec<u8>, deadline: Duration) -> Result<()> {
        let mut slot = self.slot.lock();
        let wait_until = Instant::now() + deadline;
        while slot.buffer.is_some() && !slot.local_closed {
            let remaining = wait_until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::from(ErrorKind::Timeout(format!(
                    "feed into port {} timed out waiting for drain",
                    self.port
                ))));
            }
            self.cond.wait_for(&mut slot, remaining);
        }
        if slot.local_closed {
            // Consumer is gone; bytes were already drained off the wire by
            // the caller (`read_frame` always reads the full payload).
            return Ok(());
        }
        if data.is_empty() {
            slot.remote_closed = true;
        } else {
            slot.buffer = Some(data);
        }
        self.cond.notify_all();
        Ok(())
    }
}

/// Per-session port → `DataStream` table, guarded by an ordinary mutex
///.
#[derive(Default)]
pub struct StreamTable {
    streams: Mutex<std::collections::HashMap<u16, Arc<DataStream>>>,
}

impl StreamTable {
    pub fn new() -> Self {
        StreamTable::default()
    }

    pub fn get(&self, port: u16) -> Option<Arc<DataStream>> {
        self.streams.lock().get(&port).cloned()
    }

    /// Opens `port`, failing if already in use (the responder path of
    /// `OpenDataStream(port=X>0)`).
    pub fn open_at(
        &self,
        port: u16,
        emit_frame: Box<dyn Fn(u16, &[u8]) -> Result<()> + Send + Sync>,
    ) -> Result<Arc<DataStream>> {
        let mut streams = self.streams.lock();
        if streams.contains_key(&port) {
            return Err(ErrorKind::PolicyReject(format!("port {port} already in use")).into());
        }
        let stream = DataStream::new(port, emit_frame);
        streams.insert(port, stream.clone());
        Ok(stream)
    }

    pub fn remove(&self, port: u16) {
        self.streams.lock().remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn noop_stream(port: u16) -> Arc<DataStream> {
        DataStream::new(port, Box::new(|_, _| Ok(())))
    }

    #[test]
    fn port_allocator_preserves_parity() {
        let mut server = PortAllocator::new(false);
        let mut client = PortAllocator::new(true);
        for _ in 0..5 {
            assert_eq!(server.allocate() % 2, 0);
            assert_eq!(client.allocate() % 2, 1);
        }
    }

    #[test]
    fn port_allocator_wraps() {
        let mut alloc = PortAllocator::new(false);
        alloc.last_port = WRAP_LIMIT;
        assert_eq!(alloc.allocate(), 0);
        assert_eq!(alloc.allocate(), 2);
    }

    #[test]
    fn feed_then_read_delivers_bytes() {
        let stream = noop_stream(4);
        stream.feed(vec![1, 2, 3], FEED_TIMEOUT).unwrap();
        let data = stream.read(DEFAULT_READ_TIMEOUT).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn zero_length_frame_closes_stream() {
        let stream = noop_stream(4);
        stream.feed(Vec::new(), FEED_TIMEOUT).unwrap();
        let data = stream.read(DEFAULT_READ_TIMEOUT).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn read_times_out_when_no_data_arrives() {
        let stream = noop_stream(4);
        let err = stream.read(Duration::from_millis(20)).unwrap_err();
        assert_matches::assert_matches!(err.0, ErrorKind::Timeout(_));
    }

    #[test]
    fn feed_blocks_until_previous_frame_drained() {
        let stream = noop_stream(4);
        stream.feed(vec![1], FEED_TIMEOUT).unwrap();

        let stream2 = stream.clone();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            stream2.feed(vec![2], Duration::from_secs(2)).unwrap();
            tx.send(()).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err(), "second feed should still be blocked");

        assert_eq!(stream.read(DEFAULT_READ_TIMEOUT).unwrap(), vec![1]);
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(stream.read(DEFAULT_READ_TIMEOUT).unwrap(), vec![2]);
    }

    #[test]
    fn open_at_rejects_duplicate_port() {
        let table = StreamTable::new();
        table.open_at(5, Box::new(|_, _| Ok(()))).unwrap();
        let err = table.open_at(5, Box::new(|_, _| Ok(()))).unwrap_err();
        assert_matches::assert_matches!(err.0, ErrorKind::PolicyReject(_));
    }
}
