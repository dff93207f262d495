//! Deterministic peer-id construction shared by this crate's unit tests.

use libp2p::PeerId;
use libp2p::identity::{Keypair, ed25519};

pub fn test_peer_id(n: u8) -> PeerId {
    let bytes = [n; 32];
    let key = ed25519::SecretKey::try_from_bytes(bytes).unwrap();
    let keypair = Keypair::from(ed25519::Keypair::from(key));
    keypair.public().to_peer_id()
}
