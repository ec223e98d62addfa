//! The in-memory (loopback-TCP) implementation of every external
//! collaborator seam `mesh_network::collaborators` declares: enough of a real transport and discovery service to drive the
//! mesh network session fabric end to end in a single test process.

pub mod directory;
pub mod handshake;
pub mod transport;

pub use directory::Directory;
pub use handshake::Hello;
pub use transport::{AcceptedConnection, InMemoryConnection, InMemoryConnectionManager, InMemorySecureChannel};
