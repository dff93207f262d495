//! Injectable blocklist persistence (§4.3).
//!
//! The store is a capability set — save/delete/load for each of the three
//! kinds (peers, IPs, subnets) — so the [`crate::gater::Gater`] can be
//! generic over "however this node happens to persist its blocklist" the
//! same way `NetPeerStore` is generic over peer persistence in the teacher
//! crate.

mod file;
mod memory;

use auto_impl::auto_impl;
use serde::{Deserialize, Serialize};

pub use file::FileBlocklistStore;
pub use memory::MemoryBlocklistStore;

use crate::error::ConnMgrError;

/// On-disk document shape for the file-backed store (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlocklistDocument {
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Persistence capability for the three blocklist sets.
///
/// Implementations: [`MemoryBlocklistStore`] (trivial, process-local) and
/// [`FileBlocklistStore`] (JSON document with atomic tmp-then-rename
/// writes). Any other type satisfying this trait can be injected into the
/// Gater.
#[auto_impl(&, Box, Arc)]
pub trait BlocklistStore: Send + Sync {
    fn load_peers(&self) -> Result<Vec<String>, ConnMgrError>;
    fn save_peer(&self, peer: &str) -> Result<(), ConnMgrError>;
    fn delete_peer(&self, peer: &str) -> Result<(), ConnMgrError>;

    fn load_addrs(&self) -> Result<Vec<String>, ConnMgrError>;
    fn save_addr(&self, addr: &str) -> Result<(), ConnMgrError>;
    fn delete_addr(&self, addr: &str) -> Result<(), ConnMgrError>;

    fn load_subnets(&self) -> Result<Vec<String>, ConnMgrError>;
    fn save_subnet(&self, subnet: &str) -> Result<(), ConnMgrError>;
    fn delete_subnet(&self, subnet: &str) -> Result<(), ConnMgrError>;
}
