//! The mesh network session fabric: secure-channel sessions, peer
//! buckets, per-network orchestration, in-channel stream multiplexing,
//! LAN-only discovery filtering, and versioned state snapshots.
//!
//! The cryptographic handshake, the DHT/relay service, the connection
//! manager, and the profile/identity holder are external collaborators
//! (`collaborators` module); this crate only calls through their trait
//! seams.

pub mod collaborators;
pub mod discovery;
pub mod error;
pub mod network;
pub mod packet;
pub mod peer;
pub mod session;
pub mod snapshot;
pub mod stream;

pub use error::{Error, ErrorKind, Result};
pub use network::{Network, NetworkEvent, NetworkOptions};
pub use peer::{Peer, PeerEvent, Profile, ProfileImage, MAX_MESSAGE_SIZE};
pub use session::{Session, SessionEvent};
