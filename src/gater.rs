//! Connection gater (§4.4): the policy layer consulted at dial, accept,
//! and post-handshake, consuming the blocklist store and reporting through
//! two atomic counters.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ipnet::{Contains, IpNet};
use libp2p::{Multiaddr, PeerId};
use tracing::{debug, warn};

use crate::blocklist::BlocklistStore;
use crate::config::GaterConfig;
use crate::error::ConnMgrError;
use crate::multiaddr::{classify_addr_str, extract_ip, extract_ip_from_classical, extract_tcp_port, is_relay_circuit, ParsedAddr};

/// Snapshot of the three persisted block sets plus the process-local
/// blocked-port set, returned by [`Gater::export`] and accepted by
/// [`Gater::import`].
#[derive(Debug, Clone, Default)]
pub struct GaterSnapshot {
    pub peers: HashSet<String>,
    pub addrs: HashSet<IpAddr>,
    pub subnets: HashSet<String>,
    pub ports: HashSet<u16>,
}

#[derive(Default)]
struct GaterState {
    blocked_peers: HashSet<String>,
    blocked_addrs: HashSet<IpAddr>,
    blocked_subnets: HashMap<String, IpNet>,
    blocked_ports: HashSet<u16>,
}

impl GaterState {
    fn ip_is_blocked(&self, ip: &IpAddr) -> bool {
        if self.blocked_addrs.contains(ip) {
            return true;
        }
        self.blocked_subnets.values().any(|net| net.contains(*ip))
    }
}

/// Multi-stage connection filter. See §4.4 for the exact semantics of each
/// intercept point.
pub struct Gater {
    config: GaterConfig,
    state: parking_lot::RwLock<GaterState>,
    store: Option<Arc<dyn BlocklistStore>>,
    intercepted_dials: AtomicU64,
    intercepted_accepts: AtomicU64,
}

impl Gater {
    /// Builds a gater, populating its in-memory sets from `store` if given.
    pub fn new(config: GaterConfig, store: Option<Arc<dyn BlocklistStore>>) -> Result<Self, ConnMgrError> {
        let mut state = GaterState::default();
        if let Some(store) = &store {
            for peer in store.load_peers()? {
                state.blocked_peers.insert(peer);
            }
            for addr in store.load_addrs()? {
                match addr.parse::<IpAddr>() {
                    Ok(ip) => {
                        state.blocked_addrs.insert(ip);
                    }
                    Err(_) => warn!(addr, "skipping unparsable persisted blocked address"),
                }
            }
            for subnet in store.load_subnets()? {
                match subnet.parse::<IpNet>() {
                    Ok(net) => {
                        state.blocked_subnets.insert(subnet, net);
                    }
                    Err(_) => warn!(subnet, "skipping unparsable persisted blocked subnet"),
                }
            }
        }
        Ok(Self {
            config,
            state: parking_lot::RwLock::new(state),
            store,
            intercepted_dials: AtomicU64::new(0),
            intercepted_accepts: AtomicU64::new(0),
        })
    }

    // -- mutation: block_* persist-before-mutate, unblock_* best-effort --

    pub fn block_peer(&self, peer_id: &PeerId) -> Result<(), ConnMgrError> {
        let key = peer_id.to_string();
        if let Some(store) = &self.store {
            store.save_peer(&key).map_err(|err| ConnMgrError::persist_failure(None, err))?;
        }
        self.state.write().blocked_peers.insert(key);
        Ok(())
    }

    pub fn unblock_peer(&self, peer_id: &PeerId) {
        let key = peer_id.to_string();
        self.state.write().blocked_peers.remove(&key);
        if let Some(store) = &self.store {
            if let Err(err) = store.delete_peer(&key) {
                warn!(%err, peer_id = %peer_id, "failed to persist peer unblock");
            }
        }
    }

    pub fn block_addr(&self, addr: IpAddr) -> Result<(), ConnMgrError> {
        if let Some(store) = &self.store {
            store
                .save_addr(&addr.to_string())
                .map_err(|err| ConnMgrError::persist_failure(Some(addr), err))?;
        }
        self.state.write().blocked_addrs.insert(addr);
        Ok(())
    }

    pub fn unblock_addr(&self, addr: IpAddr) {
        self.state.write().blocked_addrs.remove(&addr);
        if let Some(store) = &self.store {
            if let Err(err) = store.delete_addr(&addr.to_string()) {
                warn!(%err, %addr, "failed to persist address unblock");
            }
        }
    }

    pub fn block_subnet(&self, subnet: IpNet) -> Result<(), ConnMgrError> {
        let key = subnet.to_string();
        if let Some(store) = &self.store {
            store.save_subnet(&key).map_err(|err| ConnMgrError::persist_failure(None, err))?;
        }
        self.state.write().blocked_subnets.insert(key, subnet);
        Ok(())
    }

    pub fn unblock_subnet(&self, subnet: &IpNet) {
        let key = subnet.to_string();
        self.state.write().blocked_subnets.remove(&key);
        if let Some(store) = &self.store {
            if let Err(err) = store.delete_subnet(&key) {
                warn!(%err, subnet = %key, "failed to persist subnet unblock");
            }
        }
    }

    /// Blocked ports are process-local only; no persistence kind exists for them.
    pub fn block_port(&self, port: u16) {
        self.state.write().blocked_ports.insert(port);
    }

    pub fn unblock_port(&self, port: u16) {
        self.state.write().blocked_ports.remove(&port);
    }

    pub fn is_blocked_peer(&self, peer_id: &PeerId) -> bool {
        self.state.read().blocked_peers.contains(&peer_id.to_string())
    }

    pub fn is_blocked_addr(&self, addr: &IpAddr) -> bool {
        self.state.read().ip_is_blocked(addr)
    }

    /// Empties all four sets. Takes a single write lock so the clear is
    /// observed atomically by concurrent readers.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.blocked_peers.clear();
        state.blocked_addrs.clear();
        state.blocked_subnets.clear();
        state.blocked_ports.clear();
    }

    pub fn export(&self) -> GaterSnapshot {
        let state = self.state.read();
        GaterSnapshot {
            peers: state.blocked_peers.clone(),
            addrs: state.blocked_addrs.clone(),
            subnets: state.blocked_subnets.keys().cloned().collect(),
            ports: state.blocked_ports.clone(),
        }
    }

    pub fn import(&self, snapshot: GaterSnapshot) {
        let subnets = snapshot
            .subnets
            .into_iter()
            .filter_map(|raw| match raw.parse::<IpNet>() {
                Ok(net) => Some((raw, net)),
                Err(_) => {
                    warn!(subnet = raw, "skipping unparsable subnet on import");
                    None
                }
            })
            .collect();
        let mut state = self.state.write();
        state.blocked_peers = snapshot.peers;
        state.blocked_addrs = snapshot.addrs;
        state.blocked_subnets = subnets;
        state.blocked_ports = snapshot.ports;
    }

    // -- intercept points, §4.4 --

    /// Point 1: before dialing a known peer-id.
    pub fn intercept_peer_dial(&self, peer_id: &PeerId) -> bool {
        self.intercepted_dials.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled {
            return true;
        }
        let permitted = !self.is_blocked_peer(peer_id);
        if !permitted {
            debug!(peer_id = %peer_id, "gater rejected dial: peer blocked");
        }
        permitted
    }

    /// Point 2: before dialing a peer-id at a specific multi-address.
    /// Reject-unknown: an address whose IP can't be extracted fails closed.
    pub fn intercept_peer_addr_dial(&self, peer_id: &PeerId, addr: &Multiaddr) -> bool {
        self.intercepted_dials.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled {
            return true;
        }
        if self.is_blocked_peer(peer_id) {
            debug!(peer_id = %peer_id, "gater rejected dial: peer blocked");
            return false;
        }
        let Some(ip) = extract_ip(addr) else {
            debug!(peer_id = %peer_id, %addr, "gater rejected dial: no extractable ip");
            return false;
        };
        if self.is_blocked_addr(&ip) {
            debug!(peer_id = %peer_id, %ip, "gater rejected dial: address blocked");
            return false;
        }
        if let Some(port) = extract_tcp_port(addr) {
            if self.state.read().blocked_ports.contains(&port) {
                debug!(peer_id = %peer_id, port, "gater rejected dial: port blocked");
                return false;
            }
        }
        true
    }

    /// Point 3: on accept of an inbound connection, before the peer-id is
    /// known. Permit-unknown: relay-circuit and unresolvable (DNS)
    /// multi-addresses pass; an unparsable classical address is rejected.
    pub fn intercept_accept(&self, addr: &str) -> bool {
        self.intercepted_accepts.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled {
            return true;
        }
        match classify_addr_str(addr) {
            ParsedAddr::Multiaddr(multiaddr) => {
                if is_relay_circuit(&multiaddr) {
                    return true;
                }
                match extract_ip(&multiaddr) {
                    Some(ip) => {
                        let permitted = !self.is_blocked_addr(&ip);
                        if !permitted {
                            debug!(%ip, "gater rejected accept: address blocked");
                        }
                        permitted
                    }
                    None => true,
                }
            }
            ParsedAddr::Classical(raw) => match extract_ip_from_classical(&raw) {
                Some(ip) => {
                    let permitted = !self.is_blocked_addr(&ip);
                    if !permitted {
                        debug!(%ip, "gater rejected accept: address blocked");
                    }
                    permitted
                }
                None => {
                    debug!(addr = raw, "gater rejected accept: unparsable classical address");
                    false
                }
            },
        }
    }

    /// Point 4: after the secure handshake, peer-id is now authenticated.
    /// Outbound connections were already checked at dial time and pass
    /// unconditionally; inbound connections are checked against the peer
    /// blocklist for the first time here.
    pub fn intercept_secured(&self, peer_id: &PeerId, inbound: bool) -> bool {
        if !self.config.enabled || !inbound {
            return true;
        }
        let permitted = !self.is_blocked_peer(peer_id);
        if !permitted {
            debug!(peer_id = %peer_id, "gater rejected secured handshake: peer blocked");
        }
        permitted
    }

    /// Mirrors [`Self::intercept_secured`] for the final upgraded hook.
    pub fn intercept_upgraded(&self, peer_id: &PeerId, inbound: bool) -> bool {
        self.intercept_secured(peer_id, inbound)
    }

    pub fn intercepted_dials(&self) -> u64 {
        self.intercepted_dials.load(Ordering::Relaxed)
    }

    pub fn intercepted_accepts(&self) -> u64 {
        self.intercepted_accepts.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &GaterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::MemoryBlocklistStore;
    use crate::test_support::test_peer_id as peer;

    fn enabled_gater(store: Option<Arc<dyn BlocklistStore>>) -> Gater {
        Gater::new(GaterConfig { enabled: true, auto_close_blocked: false }, store).unwrap()
    }

    #[test]
    fn disabled_gater_permits_everything() {
        let gater = Gater::new(GaterConfig { enabled: false, auto_close_blocked: false }, None).unwrap();
        let p = peer(1);
        gater.block_peer(&p).unwrap();
        assert!(gater.intercept_peer_dial(&p));
    }

    #[test]
    fn blocked_peer_is_rejected_at_dial_and_secured() {
        let gater = enabled_gater(None);
        let p = peer(2);
        assert!(gater.intercept_peer_dial(&p));
        gater.block_peer(&p).unwrap();
        assert!(!gater.intercept_peer_dial(&p));
        assert!(!gater.intercept_secured(&p, true));
        assert!(gater.intercept_secured(&p, false));
    }

    #[test]
    fn addr_dial_rejects_unknown_and_blocked_addresses() {
        let gater = enabled_gater(None);
        let p = peer(3);

        let dns_addr: Multiaddr = "/dns4/example.com/tcp/4001".parse().unwrap();
        assert!(!gater.intercept_peer_addr_dial(&p, &dns_addr));

        let ip_addr: Multiaddr = "/ip4/10.0.0.5/tcp/4001".parse().unwrap();
        assert!(gater.intercept_peer_addr_dial(&p, &ip_addr));

        gater.block_addr("10.0.0.5".parse().unwrap()).unwrap();
        assert!(!gater.intercept_peer_addr_dial(&p, &ip_addr));
    }

    #[test]
    fn accept_permits_relay_circuit_and_dns_but_rejects_bad_classical() {
        let gater = enabled_gater(None);

        let relay: Multiaddr = "/ip4/1.2.3.4/tcp/4001/p2p-circuit".parse().unwrap();
        gater.block_addr("1.2.3.4".parse().unwrap()).unwrap();
        assert!(gater.intercept_accept(&relay.to_string()));

        assert!(gater.intercept_accept("/dns4/example.com/tcp/4001"));
        assert!(!gater.intercept_accept("not-an-address"));
        assert!(gater.intercept_accept("127.0.0.1:4001"));
    }

    #[test]
    fn subnet_block_matches_contained_addresses_only() {
        let gater = enabled_gater(None);
        let subnet: IpNet = "10.0.0.0/24".parse().unwrap();
        gater.block_subnet(subnet).unwrap();

        assert!(gater.is_blocked_addr(&"10.0.0.42".parse().unwrap()));
        assert!(!gater.is_blocked_addr(&"10.0.1.42".parse().unwrap()));
    }

    #[test]
    fn persistence_failure_leaves_memory_state_unblocked() {
        struct AlwaysFails;
        impl BlocklistStore for AlwaysFails {
            fn load_peers(&self) -> Result<Vec<String>, ConnMgrError> {
                Ok(Vec::new())
            }
            fn save_peer(&self, _peer: &str) -> Result<(), ConnMgrError> {
                Err(ConnMgrError::StoreClosed)
            }
            fn delete_peer(&self, _peer: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
            fn load_addrs(&self) -> Result<Vec<String>, ConnMgrError> {
                Ok(Vec::new())
            }
            fn save_addr(&self, _addr: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
            fn delete_addr(&self, _addr: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
            fn load_subnets(&self) -> Result<Vec<String>, ConnMgrError> {
                Ok(Vec::new())
            }
            fn save_subnet(&self, _subnet: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
            fn delete_subnet(&self, _subnet: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
        }

        let gater = enabled_gater(Some(Arc::new(AlwaysFails)));
        let p = peer(4);
        match gater.block_peer(&p) {
            Err(ConnMgrError::PersistFailure { addr, .. }) => assert_eq!(addr, None),
            other => panic!("expected PersistFailure, got {other:?}"),
        }
        assert!(!gater.is_blocked_peer(&p));
    }

    #[test]
    fn block_addr_persist_failure_carries_the_address() {
        struct AlwaysFails;
        impl BlocklistStore for AlwaysFails {
            fn load_peers(&self) -> Result<Vec<String>, ConnMgrError> {
                Ok(Vec::new())
            }
            fn save_peer(&self, _peer: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
            fn delete_peer(&self, _peer: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
            fn load_addrs(&self) -> Result<Vec<String>, ConnMgrError> {
                Ok(Vec::new())
            }
            fn save_addr(&self, _addr: &str) -> Result<(), ConnMgrError> {
                Err(ConnMgrError::StoreClosed)
            }
            fn delete_addr(&self, _addr: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
            fn load_subnets(&self) -> Result<Vec<String>, ConnMgrError> {
                Ok(Vec::new())
            }
            fn save_subnet(&self, _subnet: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
            fn delete_subnet(&self, _subnet: &str) -> Result<(), ConnMgrError> {
                Ok(())
            }
        }

        let gater = enabled_gater(Some(Arc::new(AlwaysFails)));
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        match gater.block_addr(addr) {
            Err(ConnMgrError::PersistFailure { addr: failed, .. }) => assert_eq!(failed, Some(addr)),
            other => panic!("expected PersistFailure, got {other:?}"),
        }
        assert!(!gater.is_blocked_addr(&addr));
    }

    #[test]
    fn block_then_unblock_peer_round_trips() {
        let gater = enabled_gater(None);
        let p = peer(6);
        gater.block_peer(&p).unwrap();
        assert!(gater.is_blocked_peer(&p));
        gater.unblock_peer(&p);
        assert!(!gater.is_blocked_peer(&p));
    }

    #[test]
    fn export_import_round_trips() {
        let gater = enabled_gater(Some(Arc::new(MemoryBlocklistStore::default())));
        let p = peer(5);
        gater.block_peer(&p).unwrap();
        gater.block_addr("1.2.3.4".parse().unwrap()).unwrap();
        gater.block_subnet("10.0.0.0/24".parse().unwrap()).unwrap();
        gater.block_port(9999);

        let snapshot = gater.export();
        gater.clear();
        assert!(!gater.is_blocked_peer(&p));

        gater.import(snapshot);
        assert!(gater.is_blocked_peer(&p));
        assert!(gater.is_blocked_addr(&"1.2.3.4".parse().unwrap()));
    }
}
