//! Deterministic derivation of network identity and network secret from a
//! human-chosen shared secret. Pure functions only: no state, no I/O.
//!
//! The two-pass PBKDF2 construction (`kdf`) is an intentional memory-hard-ish
//! barrier inherited unchanged from the source design; implementers must not
//! "simplify" it away, or on-wire network ids stop matching across
//! implementations.

use hmac::{Hmac, Mac, NewMac};
use mesh_types::{MaskedUserId, NetworkId, NetworkKind, NetworkSecret, UserId};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Size, in bytes, of the intermediate PBKDF2 buffer. 1 MiB.
const INTERMEDIATE_LEN: usize = 1024 * 1024;

const USER_ID_MASK_SALT: &[u8] = b"mesh-network/user-id-mask/v1";
const NETWORK_SECRET_SALT: &[u8] = b"mesh-network/network-secret/v1";

/// `HMAC-SHA256(USER_ID_MASK_SALT, key=UserId)`. Public, safe to disclose.
pub fn masked_user_id(user_id: &UserId) -> MaskedUserId {
    let mut mac = HmacSha256::new_varkey(user_id.as_bytes()).expect("HMAC accepts any key length");
    mac.update(USER_ID_MASK_SALT);
    MaskedUserId::from_slice(&mac.finalize().into_bytes())
}

/// `localUserId XOR otherUserId`. Commutative by construction, so both
/// sides of a Private network derive the same salt regardless of who
/// invited whom.
pub fn private_salt(local_user_id: UserId, other_user_id: UserId) -> [u8; 32] {
    (local_user_id ^ other_user_id).to_fixed_bytes()
}

fn group_salt(network_name: &str) -> Vec<u8> {
    // Open question: the source lowercases the raw string with
    // invariant-locale semantics. We match that with ASCII-only lowercasing
    // (documented divergence for inputs containing non-ASCII casing).
    network_name.to_ascii_lowercase().into_bytes()
}

fn salt_for(kind: &NetworkKind, local_user_id: UserId) -> Vec<u8> {
    match kind {
        NetworkKind::Private { other_user_id } => {
            private_salt(local_user_id, *other_user_id).to_vec()
        }
        NetworkKind::Group { name } => group_salt(name),
    }
}

/// `PBKDF2-HMAC-SHA256` applied twice: first derives a 1 MiB intermediate
/// buffer with a single iteration, then re-runs PBKDF2 over that buffer
/// (as the password) with a single iteration to produce 32 bytes.
fn kdf(secret: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut intermediate = vec![0u8; INTERMEDIATE_LEN];
    pbkdf2::pbkdf2::<HmacSha256>(secret, salt, 1, &mut intermediate);

    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(&intermediate, salt, 1, &mut output);
    output
}

/// `networkId = KDF(secret, salt)`.
pub fn network_id(shared_secret: &str, kind: &NetworkKind, local_user_id: UserId) -> NetworkId {
    let salt = salt_for(kind, local_user_id);
    NetworkId::from_slice(&kdf(shared_secret.as_bytes(), &salt))
}

/// `networkSecret = KDF(HMAC-SHA256(NETWORK_SECRET_SALT, key=secret), salt)`.
pub fn network_secret(
    shared_secret: &str,
    kind: &NetworkKind,
    local_user_id: UserId,
) -> NetworkSecret {
    let salt = salt_for(kind, local_user_id);

    let mut mac = HmacSha256::new_varkey(shared_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(NETWORK_SECRET_SALT);
    let intermediate_secret = mac.finalize().into_bytes();

    NetworkSecret::from_slice(&kdf(&intermediate_secret, &salt))
}

/// Both halves of a network's derived cryptographic material, bundled so
/// callers never re-run the salt-selection branch by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub network_id: NetworkId,
    pub network_secret: NetworkSecret,
}

impl NetworkIdentity {
    pub fn derive(shared_secret: &str, kind: &NetworkKind, local_user_id: UserId) -> Self {
        NetworkIdentity {
            network_id: network_id(shared_secret, kind, local_user_id),
            network_secret: network_secret(shared_secret, kind, local_user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u64) -> UserId {
        UserId::from_low_u64_be(n)
    }

    #[test]
    fn network_id_is_deterministic() {
        let kind = NetworkKind::Group {
            name: "book-club".into(),
        };
        let a = network_id("s3cret", &kind, uid(1));
        let b = network_id("s3cret", &kind, uid(1));
        assert_eq!(a, b);
    }

    #[test]
    fn private_network_id_is_symmetric() {
        let alice = uid(0x01);
        let bob = uid(0x02);
        let id_ab = network_id(
            "hi",
            &NetworkKind::Private {
                other_user_id: bob,
            },
            alice,
        );
        let id_ba = network_id(
            "hi",
            &NetworkKind::Private {
                other_user_id: alice,
            },
            bob,
        );
        assert_eq!(id_ab, id_ba);
    }

    #[test]
    fn group_name_case_is_normalised() {
        let a = network_id(
            "s",
            &NetworkKind::Group {
                name: "Book Club".into(),
            },
            uid(1),
        );
        let b = network_id(
            "s",
            &NetworkKind::Group {
                name: "book club".into(),
            },
            uid(1),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn network_id_and_network_secret_differ() {
        let kind = NetworkKind::Group { name: "x".into() };
        let id = network_id("s", &kind, uid(1));
        let secret = network_secret("s", &kind, uid(1));
        assert_ne!(id.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn changing_shared_secret_changes_network_id() {
        let kind = NetworkKind::Group { name: "x".into() };
        let a = network_id("secret-a", &kind, uid(1));
        let b = network_id("secret-b", &kind, uid(1));
        assert_ne!(a, b);
    }

    #[test]
    fn masked_user_id_is_deterministic_and_distinct_from_user_id() {
        let id = uid(42);
        let masked = masked_user_id(&id);
        assert_eq!(masked, masked_user_id(&id));
        assert_ne!(masked.as_bytes(), id.as_bytes());
    }
}
