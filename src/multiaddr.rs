//! Multi-address IP/port/relay extraction used by the Gater (§6).

use std::net::IpAddr;

use libp2p::Multiaddr;
use libp2p::multiaddr::Protocol;

/// Extracts the first `/ip4/.../` or `/ip6/.../` component, if any.
pub fn extract_ip(addr: &Multiaddr) -> Option<IpAddr> {
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => return Some(IpAddr::V4(ip)),
            Protocol::Ip6(ip) => return Some(IpAddr::V6(ip)),
            _ => continue,
        }
    }
    None
}

/// Extracts the first `/tcp/<port>/` component, if any.
pub fn extract_tcp_port(addr: &Multiaddr) -> Option<u16> {
    for proto in addr.iter() {
        if let Protocol::Tcp(port) = proto {
            return Some(port);
        }
    }
    None
}

/// `true` iff the address traverses a relay (`/p2p-circuit`); its peer
/// identity can only be known after handshake, so accept-time gating must
/// always permit these (§4.4, point 3).
pub fn is_relay_circuit(addr: &Multiaddr) -> bool {
    addr.iter().any(|proto| matches!(proto, Protocol::P2pCircuit))
}

/// Parses a raw address string as used by [`crate::gater::Gater`]: a
/// `/`-prefixed string is a multi-address, anything else is a classical
/// `host:port` (or bare IP) string.
#[derive(Debug, Clone)]
pub enum ParsedAddr {
    Multiaddr(Multiaddr),
    Classical(String),
}

pub fn classify_addr_str(addr: &str) -> ParsedAddr {
    if addr.starts_with('/') {
        match addr.parse::<Multiaddr>() {
            Ok(multiaddr) => ParsedAddr::Multiaddr(multiaddr),
            Err(_) => ParsedAddr::Classical(addr.to_string()),
        }
    } else {
        ParsedAddr::Classical(addr.to_string())
    }
}

/// Extracts the host's `IpAddr` from a classical `host:port` or bare-IP
/// string. Returns `None` if the host portion isn't a literal IP (e.g. a
/// DNS name), which callers treat as a parse failure for gating purposes.
pub fn extract_ip_from_classical(addr: &str) -> Option<IpAddr> {
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return Some(socket.ip());
    }
    // Bracketed IPv6 without a port, e.g. "[::1]".
    if let Some(stripped) = addr.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if let Ok(ip) = stripped.parse::<IpAddr>() {
            return Some(ip);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ip4_and_tcp() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(extract_ip(&addr), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(extract_tcp_port(&addr), Some(4001));
        assert!(!is_relay_circuit(&addr));
    }

    #[test]
    fn dns_multiaddr_has_no_extractable_ip() {
        let addr: Multiaddr = "/dns4/example.com/tcp/4001".parse().unwrap();
        assert_eq!(extract_ip(&addr), None);
    }

    #[test]
    fn relay_circuit_is_detected() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001/p2p/12D3KooWGRUFjH6M1p3GRyGgaMD8ReBDWEFdBPMmfnpcPMvb5DZN/p2p-circuit"
            .parse()
            .unwrap();
        assert!(is_relay_circuit(&addr));
    }

    #[test]
    fn classifies_multiaddr_vs_classical() {
        match classify_addr_str("/ip4/10.0.0.1/tcp/4001") {
            ParsedAddr::Multiaddr(_) => {}
            ParsedAddr::Classical(_) => panic!("expected multiaddr"),
        }
        match classify_addr_str("10.0.0.1:4001") {
            ParsedAddr::Classical(_) => {}
            ParsedAddr::Multiaddr(_) => panic!("expected classical"),
        }
    }

    #[test]
    fn extracts_ip_from_classical_forms() {
        assert_eq!(extract_ip_from_classical("10.0.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(extract_ip_from_classical("10.0.0.1:4001"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(extract_ip_from_classical("[::1]"), Some("::1".parse().unwrap()));
        assert_eq!(extract_ip_from_classical("not-an-ip"), None);
    }
}
