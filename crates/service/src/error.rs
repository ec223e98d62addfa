//! Re-exports `mesh_network`'s error kinds: this crate only
//! adds wiring, not new failure modes.

pub use mesh_network::{Error, ErrorKind, Result};
