//! JSON file-backed blocklist store with atomic tmp-then-rename writes.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::ConnMgrError;

use super::{BlocklistDocument, BlocklistStore};

/// JSON-document blocklist store. The full document is loaded into memory at
/// construction and rewritten atomically (write-to-`.tmp`-then-rename) on
/// every mutating call, so a crash never leaves a half-written file.
pub struct FileBlocklistStore {
    path: PathBuf,
    peers: RwLock<HashSet<String>>,
    addrs: RwLock<HashSet<String>>,
    subnets: RwLock<HashSet<String>>,
}

impl FileBlocklistStore {
    /// Loads `path` if it exists, otherwise starts empty. Does not create
    /// parent directories — use [`Self::new_with_create_dir`] for that.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConnMgrError> {
        let path = path.into();
        let document = if path.exists() {
            Self::load_document(&path)?
        } else {
            BlocklistDocument::default()
        };

        let (peers, skipped_peers) = validate_peers(document.peers);
        let (addrs, skipped_addrs) = validate_addrs(document.addrs);
        let (subnets, skipped_subnets) = validate_subnets(document.subnets);
        let skipped = skipped_peers + skipped_addrs + skipped_subnets;
        if skipped > 0 {
            warn!(skipped, path = %path.display(), "skipped corrupt blocklist entries on load");
        }

        Ok(Self {
            path,
            peers: RwLock::new(peers),
            addrs: RwLock::new(addrs),
            subnets: RwLock::new(subnets),
        })
    }

    /// Like [`Self::new`] but creates the parent directory (owner-only
    /// permissions on unix) if it doesn't exist, per §6.
    pub fn new_with_create_dir(path: impl Into<PathBuf>) -> Result<Self, ConnMgrError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
                }
            }
        }
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_document(path: &Path) -> Result<BlocklistDocument, ConnMgrError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    fn write_document(&self) -> Result<(), ConnMgrError> {
        let mut peers: Vec<String> = self.peers.read().iter().cloned().collect();
        let mut addrs: Vec<String> = self.addrs.read().iter().cloned().collect();
        let mut subnets: Vec<String> = self.subnets.read().iter().cloned().collect();
        peers.sort();
        addrs.sort();
        subnets.sort();
        let document = BlocklistDocument {
            peers,
            addrs,
            subnets,
        };

        let tmp_path = self.path.with_extension("json.tmp");
        let cleanup = scopeguard::guard(tmp_path.clone(), |tmp_path| {
            let _ = fs::remove_file(tmp_path);
        });

        let file = File::create(&tmp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &document)?;
        fs::rename(&tmp_path, &self.path)?;

        scopeguard::ScopeGuard::into_inner(cleanup);
        Ok(())
    }
}

fn validate_peers(raw: Vec<String>) -> (HashSet<String>, usize) {
    let mut valid = HashSet::new();
    let mut skipped = 0;
    for entry in raw {
        if entry.trim().is_empty() {
            skipped += 1;
            continue;
        }
        valid.insert(entry);
    }
    (valid, skipped)
}

fn validate_addrs(raw: Vec<String>) -> (HashSet<String>, usize) {
    let mut valid = HashSet::new();
    let mut skipped = 0;
    for entry in raw {
        match entry.parse::<std::net::IpAddr>() {
            Ok(ip) => {
                valid.insert(ip.to_string());
            }
            Err(_) => skipped += 1,
        }
    }
    (valid, skipped)
}

fn validate_subnets(raw: Vec<String>) -> (HashSet<String>, usize) {
    let mut valid = HashSet::new();
    let mut skipped = 0;
    for entry in raw {
        match entry.parse::<ipnet::IpNet>() {
            Ok(net) => {
                valid.insert(net.to_string());
            }
            Err(_) => skipped += 1,
        }
    }
    (valid, skipped)
}

impl BlocklistStore for FileBlocklistStore {
    fn load_peers(&self) -> Result<Vec<String>, ConnMgrError> {
        Ok(self.peers.read().iter().cloned().collect())
    }

    fn save_peer(&self, peer: &str) -> Result<(), ConnMgrError> {
        self.peers.write().insert(peer.to_string());
        self.write_document().inspect_err(|_| {
            self.peers.write().remove(peer);
        })
    }

    fn delete_peer(&self, peer: &str) -> Result<(), ConnMgrError> {
        let removed = self.peers.write().remove(peer);
        self.write_document().inspect_err(|_| {
            if removed {
                self.peers.write().insert(peer.to_string());
            }
        })
    }

    fn load_addrs(&self) -> Result<Vec<String>, ConnMgrError> {
        Ok(self.addrs.read().iter().cloned().collect())
    }

    fn save_addr(&self, addr: &str) -> Result<(), ConnMgrError> {
        self.addrs.write().insert(addr.to_string());
        self.write_document().inspect_err(|_| {
            self.addrs.write().remove(addr);
        })
    }

    fn delete_addr(&self, addr: &str) -> Result<(), ConnMgrError> {
        let removed = self.addrs.write().remove(addr);
        self.write_document().inspect_err(|_| {
            if removed {
                self.addrs.write().insert(addr.to_string());
            }
        })
    }

    fn load_subnets(&self) -> Result<Vec<String>, ConnMgrError> {
        Ok(self.subnets.read().iter().cloned().collect())
    }

    fn save_subnet(&self, subnet: &str) -> Result<(), ConnMgrError> {
        self.subnets.write().insert(subnet.to_string());
        self.write_document().inspect_err(|_| {
            self.subnets.write().remove(subnet);
        })
    }

    fn delete_subnet(&self, subnet: &str) -> Result<(), ConnMgrError> {
        let removed = self.subnets.write().remove(subnet);
        self.write_document().inspect_err(|_| {
            if removed {
                self.subnets.write().insert(subnet.to_string());
            }
        })
    }
}
