//! LAN classification for the `localNetworkOnly` policy, implemented
//! against `std::net::IpAddr` directly rather than a custom address
//! wrapper.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// True if `addr` is within RFC 1918 private space, IPv4 link-local
/// (169.254.0.0/16), or IPv6 link-local (fe80::/10).
pub fn is_rfc1918_or_link_local(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => is_private_v4(v4) || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // fe80::/10: the top 10 bits are 1111111010.
            let segments = v6.segments();
            (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    match octets[0] {
        10 => true,
        172 => (16..=31).contains(&octets[1]),
        192 => octets[1] == 168,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn accepts_rfc1918_ranges() {
        assert!(is_rfc1918_or_link_local(&ep("10.0.0.1:80")));
        assert!(is_rfc1918_or_link_local(&ep("172.16.5.5:80")));
        assert!(is_rfc1918_or_link_local(&ep("172.31.255.255:80")));
        assert!(is_rfc1918_or_link_local(&ep("192.168.1.1:80")));
    }

    #[test]
    fn accepts_link_local() {
        assert!(is_rfc1918_or_link_local(&ep("169.254.1.1:80")));
        assert!(is_rfc1918_or_link_local(&ep("[fe80::1]:80")));
    }

    #[test]
    fn rejects_public_addresses() {
        assert!(!is_rfc1918_or_link_local(&ep("8.8.8.8:53")));
        assert!(!is_rfc1918_or_link_local(&ep("172.32.0.1:80")));
        assert!(!is_rfc1918_or_link_local(&ep("[2001:4860:4860::8888]:80")));
    }
}
