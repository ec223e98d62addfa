error_chain::error_chain! {
    foreign_links {
        Io(std::io::Error);
    }

    errors {
        /// On-disk entry failed to decode (corrupt record or bad RLP shape).
        Corrupt(detail: String) {
            description("corrupt message store entry")
            display("corrupt message store entry: {}", detail)
        }
        /// Referenced a message number past the end of the log.
        NoSuchMessage(number: u64) {
            description("no such message number")
            display("no such message number: {}", number)
        }
        /// MAC check failed on decrypt: wrong key or tampered data.
        AuthenticationFailed {
            description("message store entry failed authentication")
            display("message store entry failed authentication")
        }
    }
}
