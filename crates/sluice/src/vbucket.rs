//! Vbucket state, failover lineage and the apply path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use thiserror::Error;

use sluice_core::{Item, ItemOp, Limits, Seqno, VBucketState, VbUuid, Vbid};

use crate::checkpoint::CheckpointManager;

/// One epoch in a vbucket's lineage: the uuid minted when the epoch began
/// and the seqno it began at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailoverEntry {
    pub vb_uuid: VbUuid,
    pub by_seqno: Seqno,
}

/// Per-vbucket lineage record, newest entry first. Peers quote the uuid
/// they last synchronized against; a uuid that has fallen off the table, or
/// a resume point past its epoch, forces a rollback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
}

impl FailoverTable {
    pub fn new(initial: VbUuid) -> Self {
        Self {
            entries: vec![FailoverEntry {
                vb_uuid: initial,
                by_seqno: Seqno::ZERO,
            }],
        }
    }

    pub fn latest_uuid(&self) -> VbUuid {
        self.entries[0].vb_uuid
    }

    pub fn add_entry(&mut self, vb_uuid: VbUuid, high_seqno: Seqno) {
        self.entries.insert(
            0,
            FailoverEntry {
                vb_uuid,
                by_seqno: high_seqno,
            },
        );
    }

    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Whether a peer resuming from `start` under `vb_uuid` must roll back,
    /// and to which seqno. Starting from scratch never rolls back.
    pub fn needs_rollback(&self, vb_uuid: VbUuid, start: Seqno) -> Option<Seqno> {
        let Some(pos) = self.entries.iter().position(|e| e.vb_uuid == vb_uuid) else {
            return if start > Seqno::ZERO {
                Some(Seqno::ZERO)
            } else {
                None
            };
        };
        // The epoch's history is valid up to where the next newer epoch
        // began; the newest epoch is open-ended.
        let valid_to = if pos == 0 {
            Seqno::MAX
        } else {
            self.entries[pos - 1].by_seqno
        };
        if start > valid_to {
            return Some(valid_to);
        }
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The engine is momentarily out of resources; retry later.
    #[error("temporary apply failure")]
    Temporary,
    #[error("{vb} rejects replicated writes in state {state}")]
    NotWritable { vb: Vbid, state: VBucketState },
}

/// Apply seam for the passive stream. The vbucket is the production sink;
/// tests interpose failure-injecting wrappers.
pub trait ItemSink: Send + Sync {
    fn apply(&self, item: &Item) -> Result<(), ApplyError>;
}

#[derive(Debug)]
struct StoredEntry {
    value: Bytes,
    seqno: Seqno,
    deleted: bool,
}

/// A logical shard: replication state, high-seqno, failover lineage, the
/// keyspace, and the checkpoint ring live streams read from.
pub struct VBucket {
    id: Vbid,
    state: AtomicU8,
    high_seqno: AtomicU64,
    manifest_uid: AtomicU64,
    failover: Mutex<FailoverTable>,
    keyspace: Mutex<BTreeMap<Bytes, StoredEntry>>,
    checkpoints: CheckpointManager,
}

impl VBucket {
    pub fn new(id: Vbid, state: VBucketState, vb_uuid: VbUuid, limits: &Limits) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(state.wire_code()),
            high_seqno: AtomicU64::new(0),
            manifest_uid: AtomicU64::new(0),
            failover: Mutex::new(FailoverTable::new(vb_uuid)),
            keyspace: Mutex::new(BTreeMap::new()),
            checkpoints: CheckpointManager::new(limits.checkpoint_max_items),
        })
    }

    pub fn id(&self) -> Vbid {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        VBucketState::from_wire_code(self.state.load(Ordering::SeqCst))
            .expect("vbucket state cell corrupt")
    }

    pub fn set_state(&self, to: VBucketState) {
        let from = self.state();
        self.state.store(to.wire_code(), Ordering::SeqCst);
        if from != to {
            tracing::debug!(vb = %self.id, %from, %to, "vbucket state change");
        }
    }

    pub fn high_seqno(&self) -> Seqno {
        Seqno::new(self.high_seqno.load(Ordering::SeqCst))
    }

    pub fn manifest_uid(&self) -> u64 {
        self.manifest_uid.load(Ordering::SeqCst)
    }

    pub fn set_manifest_uid(&self, uid: u64) {
        self.manifest_uid.store(uid, Ordering::SeqCst);
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn latest_vb_uuid(&self) -> VbUuid {
        self.failover().latest_uuid()
    }

    pub fn record_failover_entry(&self, vb_uuid: VbUuid) {
        let high = self.high_seqno();
        self.failover().add_entry(vb_uuid, high);
    }

    pub fn needs_rollback(&self, vb_uuid: VbUuid, start: Seqno) -> Option<Seqno> {
        self.failover().needs_rollback(vb_uuid, start)
    }

    pub fn failover_entries(&self) -> Vec<FailoverEntry> {
        self.failover().entries().to_vec()
    }

    fn failover(&self) -> MutexGuard<'_, FailoverTable> {
        self.failover.lock().expect("failover lock poisoned")
    }

    /// Local write on an active vbucket; assigns the next seqno and queues
    /// the mutation for streaming.
    pub fn set(&self, key: Bytes, value: Bytes) -> Arc<Item> {
        let mut keyspace = self.keyspace.lock().expect("keyspace lock poisoned");
        let seqno = Seqno::new(self.high_seqno.fetch_add(1, Ordering::SeqCst) + 1);
        let item = Arc::new(Item::mutation(self.id, seqno, key.clone(), value.clone(), 0));
        keyspace.insert(
            key,
            StoredEntry {
                value,
                seqno,
                deleted: false,
            },
        );
        self.checkpoints.queue(Arc::clone(&item));
        item
    }

    /// Local delete; a no-op returning `None` when the key is absent.
    pub fn delete(&self, key: &Bytes) -> Option<Arc<Item>> {
        let mut keyspace = self.keyspace.lock().expect("keyspace lock poisoned");
        let entry = keyspace.get_mut(key)?;
        if entry.deleted {
            return None;
        }
        let seqno = Seqno::new(self.high_seqno.fetch_add(1, Ordering::SeqCst) + 1);
        entry.deleted = true;
        entry.value = Bytes::new();
        entry.seqno = seqno;
        let item = Arc::new(Item::deletion(self.id, seqno, key.clone()));
        self.checkpoints.queue(Arc::clone(&item));
        Some(item)
    }

    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        let keyspace = self.keyspace.lock().expect("keyspace lock poisoned");
        keyspace
            .get(key)
            .filter(|entry| !entry.deleted)
            .map(|entry| entry.value.clone())
    }

    pub fn num_keys(&self) -> usize {
        let keyspace = self.keyspace.lock().expect("keyspace lock poisoned");
        keyspace.values().filter(|entry| !entry.deleted).count()
    }
}

impl ItemSink for VBucket {
    /// Replica apply path: writes arrive with producer-assigned seqnos and
    /// are queued into the local checkpoint ring.
    fn apply(&self, item: &Item) -> Result<(), ApplyError> {
        let state = self.state();
        if !matches!(state, VBucketState::Replica | VBucketState::Pending) {
            return Err(ApplyError::NotWritable { vb: self.id, state });
        }

        let mut keyspace = self.keyspace.lock().expect("keyspace lock poisoned");
        match item.op() {
            ItemOp::Mutation => {
                keyspace.insert(
                    item.key().clone(),
                    StoredEntry {
                        value: item.value().clone(),
                        seqno: item.seqno(),
                        deleted: false,
                    },
                );
            }
            ItemOp::Deletion | ItemOp::Expiration => {
                keyspace.insert(
                    item.key().clone(),
                    StoredEntry {
                        value: Bytes::new(),
                        seqno: item.seqno(),
                        deleted: true,
                    },
                );
            }
        }
        self.high_seqno.fetch_max(item.seqno().get(), Ordering::SeqCst);
        self.checkpoints.queue(Arc::new(item.clone()));
        Ok(())
    }
}
