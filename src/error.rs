//! Error taxonomy for the connection-management core.

use std::net::IpAddr;

use thiserror::Error;

/// Errors returned by the public surface of this crate.
///
/// Background loops (trim tick, jitter monitor, subnet-limiter cleanup) never
/// propagate these; they log and self-heal instead, per the error handling
/// design.
#[derive(Debug, Error)]
pub enum ConnMgrError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("manager has not been started")]
    NotStarted,

    #[error("manager is already started")]
    AlreadyStarted,

    #[error("manager is closed")]
    ManagerClosed,

    #[error("store is closed")]
    StoreClosed,

    #[error("peer not found")]
    PeerNotFound,

    #[error("failed to persist blocklist entry for {addr:?}: {source}")]
    PersistFailure {
        addr: Option<IpAddr>,
        #[source]
        source: Box<ConnMgrError>,
    },

    #[error("callback failed: {0}")]
    CallbackFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConnMgrError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn persist_failure(addr: Option<IpAddr>, source: ConnMgrError) -> Self {
        Self::PersistFailure {
            addr,
            source: Box::new(source),
        }
    }
}
