//! Trivial in-memory blocklist store; no persistence across restarts.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::error::ConnMgrError;

use super::BlocklistStore;

#[derive(Debug, Default)]
pub struct MemoryBlocklistStore {
    peers: RwLock<HashSet<String>>,
    addrs: RwLock<HashSet<String>>,
    subnets: RwLock<HashSet<String>>,
}

impl MemoryBlocklistStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlocklistStore for MemoryBlocklistStore {
    fn load_peers(&self) -> Result<Vec<String>, ConnMgrError> {
        Ok(self.peers.read().iter().cloned().collect())
    }

    fn save_peer(&self, peer: &str) -> Result<(), ConnMgrError> {
        self.peers.write().insert(peer.to_string());
        Ok(())
    }

    fn delete_peer(&self, peer: &str) -> Result<(), ConnMgrError> {
        self.peers.write().remove(peer);
        Ok(())
    }

    fn load_addrs(&self) -> Result<Vec<String>, ConnMgrError> {
        Ok(self.addrs.read().iter().cloned().collect())
    }

    fn save_addr(&self, addr: &str) -> Result<(), ConnMgrError> {
        self.addrs.write().insert(addr.to_string());
        Ok(())
    }

    fn delete_addr(&self, addr: &str) -> Result<(), ConnMgrError> {
        self.addrs.write().remove(addr);
        Ok(())
    }

    fn load_subnets(&self) -> Result<Vec<String>, ConnMgrError> {
        Ok(self.subnets.read().iter().cloned().collect())
    }

    fn save_subnet(&self, subnet: &str) -> Result<(), ConnMgrError> {
        self.subnets.write().insert(subnet.to_string());
        Ok(())
    }

    fn delete_subnet(&self, subnet: &str) -> Result<(), ConnMgrError> {
        self.subnets.write().remove(subnet);
        Ok(())
    }
}
