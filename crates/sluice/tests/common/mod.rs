//! Shared fixtures for stream integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;

use sluice::{
    ActiveStream, BackfillError, BackfillManager, BackfillSource, DiskSnapshot, NullNotifier,
    Stream, VBucket,
};
use sluice_core::{
    Item, Limits, Opaque, Seqno, StreamFlags, StreamMessage, VBucketState, VbUuid, Vbid,
};

pub const VB: Vbid = Vbid::new(5);
pub const VB_UUID: VbUuid = VbUuid::new(0xfeed);
pub const OPAQUE: Opaque = Opaque::new(99);

pub fn key(seqno: u64) -> Bytes {
    Bytes::from(format!("key-{seqno:05}"))
}

pub fn value(seqno: u64) -> Bytes {
    Bytes::from(format!("value-{seqno:05}"))
}

/// An active vbucket whose checkpoint ring holds `seqnos` (assigned in
/// order by local writes).
pub fn active_vb(limits: &Limits, high: u64) -> Arc<VBucket> {
    let vb = VBucket::new(VB, VBucketState::Active, VB_UUID, limits);
    for seqno in 1..=high {
        vb.set(key(seqno), value(seqno));
    }
    vb
}

pub fn replica_vb(limits: &Limits) -> Arc<VBucket> {
    VBucket::new(VB, VBucketState::Replica, VB_UUID, limits)
}

/// Persisted history served to backfill scans.
pub struct VecDisk {
    pub items: Vec<Item>,
}

impl VecDisk {
    pub fn with_mutations(seqnos: impl IntoIterator<Item = u64>) -> Arc<Self> {
        let items = seqnos
            .into_iter()
            .map(|seqno| Item::mutation(VB, Seqno::new(seqno), key(seqno), value(seqno), 0))
            .collect();
        Arc::new(Self { items })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self { items: Vec::new() })
    }
}

impl BackfillSource for VecDisk {
    fn scan(&self, _vbucket: Vbid, start: Seqno, end: Seqno) -> Result<DiskSnapshot, BackfillError> {
        let items: Vec<Item> = self
            .items
            .iter()
            .filter(|item| item.seqno() > start && item.seqno() <= end)
            .cloned()
            .collect();
        let snap_end = items.last().map_or(start, |item| item.seqno());
        Ok(DiskSnapshot {
            start,
            end: snap_end,
            items,
        })
    }
}

pub struct FailingDisk;

impl BackfillSource for FailingDisk {
    fn scan(
        &self,
        _vbucket: Vbid,
        _start: Seqno,
        _end: Seqno,
    ) -> Result<DiskSnapshot, BackfillError> {
        Err(BackfillError::ScanFailed {
            reason: "simulated media failure".to_string(),
        })
    }
}

pub fn open_active(
    vb: &Arc<VBucket>,
    flags: StreamFlags,
    limits: Limits,
    manager: &BackfillManager,
    start: Seqno,
    end: Seqno,
) -> Arc<ActiveStream> {
    ActiveStream::new(
        "repl-conn",
        flags,
        OPAQUE,
        Arc::clone(vb),
        Arc::new(NullNotifier),
        manager.budget(),
        limits,
        start,
        end,
        VB_UUID,
        start,
        start,
    )
    .expect("valid stream request")
}

/// Pop messages until the stream has nothing ready.
pub fn drain(stream: &ActiveStream) -> Vec<StreamMessage> {
    let mut out = Vec::new();
    while let Some(msg) = stream.next() {
        out.push(msg);
    }
    out
}

/// Alternate backfill slices and queue drains until both are exhausted.
pub fn run_to_quiescence(manager: &BackfillManager, stream: &ActiveStream) -> Vec<StreamMessage> {
    let mut out = Vec::new();
    for _ in 0..10_000 {
        let progressed = manager.drive();
        let before = out.len();
        out.extend(drain(stream));
        if progressed == 0 && out.len() == before && manager.num_tasks() == 0 {
            return out;
        }
    }
    panic!("stream did not quiesce");
}

/// Marker ranges in emission order.
pub fn marker_ranges(messages: &[StreamMessage]) -> Vec<(Seqno, Seqno)> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            StreamMessage::SnapshotMarker { start, end, .. } => Some((*start, *end)),
            _ => None,
        })
        .collect()
}

/// Seqnos of item-bearing messages in emission order.
pub fn item_seqnos(messages: &[StreamMessage]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|msg| msg.seqno().map(Seqno::get))
        .collect()
}
