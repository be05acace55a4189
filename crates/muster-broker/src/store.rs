//! Durable peer records — the narrow contract to the data tier.
//!
//! The broker only ever needs two things from persistence during a
//! handshake: find-or-create the durable record for an identity, and read
//! its activation status. Everything else about the data tier stays behind
//! this trait, so tests and embedders substitute their own store.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use muster_core::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// May join.
    Active,
    /// Known but not yet activated by an operator. Joins are refused
    /// non-retryably until flipped.
    Inactive,
    /// Removed from the fleet. Joins are refused permanently.
    Removed,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: u64,
    /// Correlation key the record was created under (hardware id, or the
    /// claimed address as fallback).
    pub key: String,
    pub status: PeerStatus,
}

pub trait PeerStore: Send + Sync + 'static {
    /// Find the durable record matching `identity`, creating one when none
    /// exists. The bool is true when a record was created by this call.
    fn lookup_or_create(&self, identity: &Identity) -> (PeerRecord, bool);

    /// Activation status for `id`. None when the id is unknown.
    fn status(&self, id: u64) -> Option<PeerStatus>;
}

/// In-memory store. Identifier assignment is monotonic and never reused
/// within a process lifetime.
pub struct MemPeerStore {
    by_key: DashMap<String, u64>,
    records: DashMap<u64, PeerRecord>,
    next_id: AtomicU64,
    default_status: PeerStatus,
}

impl MemPeerStore {
    pub fn new(default_status: PeerStatus) -> Self {
        Self {
            by_key: DashMap::new(),
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
            default_status,
        }
    }

    /// Operator-facing mutation (activate, remove). Returns false for an
    /// unknown id.
    pub fn set_status(&self, id: u64, status: PeerStatus) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PeerStore for MemPeerStore {
    fn lookup_or_create(&self, identity: &Identity) -> (PeerRecord, bool) {
        let key = identity.correlation_key();
        let mut created = false;
        let id = *self.by_key.entry(key.clone()).or_insert_with(|| {
            created = true;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.records.insert(
                id,
                PeerRecord {
                    id,
                    key: key.clone(),
                    status: self.default_status,
                },
            );
            id
        });
        let record = self
            .records
            .get(&id)
            .map(|r| r.clone())
            .unwrap_or(PeerRecord {
                id,
                key,
                status: self.default_status,
            });
        (record, created)
    }

    fn status(&self, id: u64) -> Option<PeerStatus> {
        self.records.get(&id).map(|r| r.status)
    }
}
