//! Error kinds for this crate: an `error_chain!` block with
//! `foreign_links` for I/O and RLP decode failures.

error_chain::error_chain! {
    foreign_links {
        Io(std::io::Error);
        Decoder(rlp::DecoderError);
        MessageStore(mesh_message_store::Error);
    }

    errors {
        /// On-disk/wire snapshot had a bad or unrecognised version byte.
        ParseError(detail: String) {
            description("parse error")
            display("parse error: {}", detail)
        }
        /// Secure-channel handshake failed: PSK mismatch or untrusted identity.
        CryptoFailure(detail: String) {
            description("secure channel failure")
            display("secure channel failure: {}", detail)
        }
        /// A blocking operation exceeded its deadline.
        Timeout(detail: String) {
            description("timeout")
            display("timeout: {}", detail)
        }
        /// Raw I/O failed in a way not covered by `foreign_links`.
        TransportError(detail: String) {
            description("transport error")
            display("transport error: {}", detail)
        }
        /// A caller-visible policy rejected the operation synchronously.
        PolicyReject(detail: String) {
            description("policy reject")
            display("policy reject: {}", detail)
        }
        /// The remote identity did not match what the network invariants allow.
        InvariantViolation(detail: String) {
            description("invariant violation")
            display("invariant violation: {}", detail)
        }
    }
}
