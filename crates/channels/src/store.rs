use std::{collections::HashSet, sync::RwLock};

/// Lookup of established pairings between senders and the agent.
///
/// Pairing records are created elsewhere (an approval flow, an operator
/// command). Channel plugins only ask whether one exists, so the lookup is
/// synchronous and must not block.
pub trait PairingStore: Send + Sync {
    fn is_paired(&self, channel_type: &str, account_id: &str, peer_id: &str) -> bool;
}

/// Pairing store that never reports a pairing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPairings;

impl PairingStore for NoPairings {
    fn is_paired(&self, _channel_type: &str, _account_id: &str, _peer_id: &str) -> bool {
        false
    }
}

/// In-memory pairing store keyed by `(channel_type, account_id, peer_id)`.
///
/// Peer IDs are compared case-insensitively.
#[derive(Debug, Default)]
pub struct MemoryPairingStore {
    pairs: RwLock<HashSet<(String, String, String)>>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve(&self, channel_type: &str, account_id: &str, peer_id: &str) {
        let mut pairs = self.pairs.write().unwrap_or_else(|e| e.into_inner());
        pairs.insert(key(channel_type, account_id, peer_id));
    }

    /// Remove a pairing. Returns `true` if one existed.
    pub fn revoke(&self, channel_type: &str, account_id: &str, peer_id: &str) -> bool {
        let mut pairs = self.pairs.write().unwrap_or_else(|e| e.into_inner());
        pairs.remove(&key(channel_type, account_id, peer_id))
    }
}

impl PairingStore for MemoryPairingStore {
    fn is_paired(&self, channel_type: &str, account_id: &str, peer_id: &str) -> bool {
        let pairs = self.pairs.read().unwrap_or_else(|e| e.into_inner());
        pairs.contains(&key(channel_type, account_id, peer_id))
    }
}

fn key(channel_type: &str, account_id: &str, peer_id: &str) -> (String, String, String) {
    (
        channel_type.to_string(),
        account_id.to_string(),
        peer_id.to_lowercase(),
    )
}
