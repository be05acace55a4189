//! Connection registry — the single source of truth for live peers.
//!
//! A partitioned map from peer identifier to live connection handle. The
//! key space is split over a fixed number of independently locked shards
//! so that concurrent joins and disconnects from thousands of peers
//! contend on O(1/N) of the structure. Iteration for broadcast snapshots
//! one shard at a time and never holds a lock across callbacks, so a slow
//! fan-out cannot stall inserts elsewhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use muster_core::{Credential, Identity};
use muster_session::MuxSession;

/// A live connection handle. Owned by its registry entry from insertion
/// until removal; everyone else works through `Arc` references handed out
/// by the registry.
pub struct Conn {
    pub id: u64,
    pub identity: Identity,
    pub credential: Credential,
    pub session: Arc<MuxSession>,
    pub connected_at: Instant,
}

/// FNV-1 64-bit. Uniform distribution is all that is needed here;
/// collision resistance is not.
fn fnv1_64(key: u64) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in key.to_le_bytes() {
        hash = hash.wrapping_mul(PRIME);
        hash ^= byte as u64;
    }
    hash
}

pub struct Registry {
    shards: Vec<Mutex<HashMap<u64, Arc<Conn>>>>,
    mask: u64,
}

impl Registry {
    /// `shards` must be a power of two.
    pub fn new(shards: usize) -> Self {
        assert!(shards.is_power_of_two(), "shard count must be a power of two");
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            mask: shards as u64 - 1,
        }
    }

    fn shard(&self, id: u64) -> &Mutex<HashMap<u64, Arc<Conn>>> {
        &self.shards[(fnv1_64(id) & self.mask) as usize]
    }

    /// Insert `conn` keyed by its id unless an entry already exists.
    /// Returns false, leaving the registry untouched, on duplicate.
    pub fn insert_if_absent(&self, conn: Arc<Conn>) -> bool {
        let mut shard = self.shard(conn.id).lock().expect("registry shard poisoned");
        match shard.entry(conn.id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(conn);
                true
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<Conn>> {
        self.shard(id)
            .lock()
            .expect("registry shard poisoned")
            .get(&id)
            .cloned()
    }

    /// Remove and return the entry for `id`. Idempotent — removing an
    /// absent id is a no-op returning None.
    pub fn remove(&self, id: u64) -> Option<Arc<Conn>> {
        self.shard(id)
            .lock()
            .expect("registry shard poisoned")
            .remove(&id)
    }

    /// Weakly consistent membership snapshot for fan-out: each shard is
    /// locked only long enough to copy its keys. Peers joining or leaving
    /// mid-iteration may or may not appear.
    pub fn snapshot_ids(&self) -> Vec<u64> {
        let mut ids = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let guard = shard.lock().expect("registry shard poisoned");
            ids.extend(guard.keys().copied());
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("registry shard poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
