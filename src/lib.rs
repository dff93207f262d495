//! Connection-management core for a peer-to-peer node: a watermark-trimmed
//! connection pool, a multi-stage dial/accept gater, a per-subnet
//! token-bucket rate limiter, and a jitter-tolerance/anti-false-positive
//! discipline that keeps brief flaps from looking like real churn.
//!
//! [`Manager`] is the facade most callers want; the individual components
//! remain public for transports that need to consult the gater or subnet
//! limiter directly on their own hot path.

mod flap;
mod grace;
mod removal_tracker;

pub mod antifalsepositive;
pub mod blocklist;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod gater;
pub mod jitter;
pub mod manager;
pub mod multiaddr;
pub mod peer_state;
pub mod protection;
pub mod shutdown;
pub mod subnet_limiter;
pub mod tags;
pub mod token_bucket;
pub mod trimmer;

#[cfg(test)]
pub(crate) mod test_support;

pub use antifalsepositive::{AntiFalsePositive, ManagerRemoveCallback, RejectReason};
pub use blocklist::{BlocklistDocument, BlocklistStore, FileBlocklistStore, MemoryBlocklistStore};
pub use callbacks::{CloseCallback, ReconnectCallback, close_callback_fn, reconnect_callback_fn};
pub use config::{GaterConfig, JitterConfig, ManagerConfig, PrefixRule, SubnetLimiterConfig, TrimScoringConfig};
pub use error::ConnMgrError;
pub use gater::{Gater, GaterSnapshot};
pub use jitter::JitterController;
pub use manager::{DebugPeerState, Manager, RegisterOutcome};
pub use peer_state::{Direction, NewConnection, PeerConnInfo};
pub use protection::ProtectionStore;
pub use shutdown::{BackgroundTask, Shutdown, ShutdownController};
pub use subnet_limiter::{SubnetLimiter, SubnetLimiterStats};
pub use tags::{TagInfo, TagStore};
pub use token_bucket::TokenBucket;
