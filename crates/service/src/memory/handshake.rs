//! Pre-`Session` raw handshake used only by this crate's own in-memory
//! transport: a version byte, a claimed `networkId`, a claimed `userId`, and a
//! PSK, written directly on the raw socket before any `SecureChannel`
//! exists. Framed the same flat way `mesh_network::packet` frames its own
//! fixed-width fields, just without a length prefix since every field here
//! is a fixed 32 bytes.

use crate::error::{ErrorKind, Result};
use mesh_types::{NetworkId, UserId};
use std::io::{Read, Write};

const HELLO_VERSION: u8 = 1;

pub struct Hello {
    pub network_id: [u8; 32],
    pub user_id: [u8; 32],
    pub psk: [u8; 32],
}

impl Hello {
    pub fn new(network_id: NetworkId, user_id: UserId, psk: [u8; 32]) -> Hello {
        Hello {
            network_id: *network_id.as_fixed_bytes(),
            user_id: *user_id.as_fixed_bytes(),
            psk,
        }
    }

    pub fn network_id(&self) -> NetworkId {
        NetworkId::from_slice(&self.network_id)
    }

    pub fn user_id(&self) -> UserId {
        UserId::from_slice(&self.user_id)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&[HELLO_VERSION])?;
        w.write_all(&self.network_id)?;
        w.write_all(&self.user_id)?;
        w.write_all(&self.psk)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Hello> {
        let mut version = [0u8; 1];
        r.read_exact(&mut version)?;
        if version[0] != HELLO_VERSION {
            return Err(ErrorKind::ParseError(format!("unrecognised hello version {}", version[0])).into());
        }
        let mut network_id = [0u8; 32];
        let mut user_id = [0u8; 32];
        let mut psk = [0u8; 32];
        r.read_exact(&mut network_id)?;
        r.read_exact(&mut user_id)?;
        r.read_exact(&mut psk)?;
        Ok(Hello { network_id, user_id, psk })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_over_a_byte_buffer() {
        let hello = Hello::new(NetworkId::from_low_u64_be(1), UserId::from_low_u64_be(2), [9u8; 32]);
        let mut buf = Vec::new();
        hello.write(&mut buf).unwrap();
        let decoded = Hello::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.network_id, hello.network_id);
        assert_eq!(decoded.user_id, hello.user_id);
        assert_eq!(decoded.psk, hello.psk);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = vec![9u8];
        buf.extend_from_slice(&[0u8; 96]);
        let err = Hello::read(&mut Cursor::new(buf)).unwrap_err();
        assert_matches::assert_matches!(err.0, ErrorKind::ParseError(_));
    }
}
