//! In-memory checkpoints and the cursors streams register into them.
//!
//! A checkpoint is a contiguous run of recent mutations with a snapshot
//! range attached. The producer seals a checkpoint once it reaches its item
//! cap and opens the next; streams pull batches through named cursors, one
//! checkpoint at a time, so each memory-phase run maps onto a single
//! snapshot on the wire.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use sluice_core::{Item, Seqno};

#[derive(Debug)]
pub struct CheckpointManager {
    max_checkpoint_items: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    checkpoints: VecDeque<Checkpoint>,
    cursors: BTreeMap<String, Cursor>,
}

#[derive(Debug)]
struct Checkpoint {
    snap_start: Seqno,
    snap_end: Seqno,
    open: bool,
    items: VecDeque<Arc<Item>>,
}

impl Checkpoint {
    fn open_at(seqno: Seqno) -> Self {
        Self {
            snap_start: seqno,
            snap_end: seqno,
            open: true,
            items: VecDeque::new(),
        }
    }
}

/// Cursors emit items with seqnos strictly greater than `last`.
#[derive(Clone, Copy, Debug)]
struct Cursor {
    last: Seqno,
}

impl CheckpointManager {
    pub fn new(max_checkpoint_items: usize) -> Self {
        Self {
            max_checkpoint_items: max_checkpoint_items.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("checkpoint lock poisoned")
    }

    /// Append a mutation to the open checkpoint, sealing it once it reaches
    /// the item cap.
    pub fn queue(&self, item: Arc<Item>) {
        let mut inner = self.lock();
        let seqno = item.seqno();
        let needs_new = !matches!(inner.checkpoints.back(), Some(c) if c.open);
        if needs_new {
            inner.checkpoints.push_back(Checkpoint::open_at(seqno));
        }
        let open = inner.checkpoints.back_mut().expect("open checkpoint");
        open.items.push_back(item);
        open.snap_end = seqno;
        if open.items.len() >= self.max_checkpoint_items {
            open.open = false;
        }
    }

    /// The earliest seqno still held in memory, if any.
    pub fn earliest_seqno(&self) -> Option<Seqno> {
        let inner = self.lock();
        earliest(&inner)
    }

    /// Register a named cursor that will emit items after `from`. If the
    /// requested position was already reclaimed, the cursor is clamped
    /// forward; the effective position is returned.
    pub fn register_cursor(&self, name: &str, from: Seqno) -> Seqno {
        let mut inner = self.lock();
        let effective = match earliest(&inner) {
            Some(e) if from.get().saturating_add(1) < e.get() => {
                Seqno::new(e.get().saturating_sub(1))
            }
            _ => from,
        };
        inner
            .cursors
            .insert(name.to_string(), Cursor { last: effective });
        effective
    }

    pub fn remove_cursor(&self, name: &str) {
        let mut inner = self.lock();
        inner.cursors.remove(name);
    }

    pub fn cursor_seqno(&self, name: &str) -> Option<Seqno> {
        let inner = self.lock();
        inner.cursors.get(name).map(|c| c.last)
    }

    /// Pull the next run for `name`: at most `max_items` items, never past
    /// `up_to`, and never across a checkpoint boundary.
    pub fn next_items(&self, name: &str, max_items: usize, up_to: Seqno) -> Vec<Arc<Item>> {
        let mut inner = self.lock();
        let Some(cursor) = inner.cursors.get(name).copied() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut last = cursor.last;
        'checkpoints: for chk in &inner.checkpoints {
            let mut pulled = false;
            for item in &chk.items {
                if item.seqno() <= last {
                    continue;
                }
                if item.seqno() > up_to || out.len() >= max_items {
                    break 'checkpoints;
                }
                last = item.seqno();
                out.push(Arc::clone(item));
                pulled = true;
            }
            if pulled {
                break;
            }
        }

        if let Some(cursor) = inner.cursors.get_mut(name) {
            cursor.last = last;
        }
        out
    }

    /// Items a cursor has not yet emitted.
    pub fn items_remaining(&self, name: &str) -> u64 {
        let inner = self.lock();
        let Some(cursor) = inner.cursors.get(name) else {
            return 0;
        };
        inner
            .checkpoints
            .iter()
            .flat_map(|chk| chk.items.iter())
            .filter(|item| item.seqno() > cursor.last)
            .count() as u64
    }

    /// Seal the open checkpoint under an explicit snapshot range. Used by
    /// the consumer apply path when a disk snapshot completes.
    pub fn seal_snapshot(&self, start: Seqno, end: Seqno) {
        let mut inner = self.lock();
        if let Some(back) = inner.checkpoints.back_mut()
            && back.open
        {
            back.snap_start = start;
            back.snap_end = end;
            back.open = false;
        }
    }

    /// Stretch the open checkpoint's snapshot range; memory snapshots are
    /// continuations of the open checkpoint.
    pub fn extend_open_snapshot(&self, end: Seqno) {
        let mut inner = self.lock();
        if let Some(back) = inner.checkpoints.back_mut()
            && back.open
            && back.snap_end < end
        {
            back.snap_end = end;
        }
    }

    /// Reclaim items at or below `seqno`, never past a registered cursor.
    pub fn trim_to(&self, seqno: Seqno) {
        let mut inner = self.lock();
        let floor = inner
            .cursors
            .values()
            .map(|c| c.last)
            .min()
            .map_or(seqno, |cursor_floor| seqno.min(cursor_floor));

        for chk in &mut inner.checkpoints {
            while matches!(chk.items.front(), Some(item) if item.seqno() <= floor) {
                chk.items.pop_front();
            }
        }
        while matches!(inner.checkpoints.front(), Some(c) if !c.open && c.items.is_empty()) {
            inner.checkpoints.pop_front();
        }
    }

    /// Snapshot ranges of all non-empty checkpoints, oldest first.
    pub fn snapshot_ranges(&self) -> Vec<(Seqno, Seqno)> {
        let inner = self.lock();
        inner
            .checkpoints
            .iter()
            .filter(|chk| !chk.items.is_empty())
            .map(|chk| (chk.snap_start, chk.snap_end))
            .collect()
    }

    pub fn num_checkpoints(&self) -> usize {
        self.lock().checkpoints.len()
    }

    pub fn num_items(&self) -> u64 {
        let inner = self.lock();
        inner
            .checkpoints
            .iter()
            .map(|chk| chk.items.len() as u64)
            .sum()
    }
}

fn earliest(inner: &Inner) -> Option<Seqno> {
    inner
        .checkpoints
        .iter()
        .flat_map(|chk| chk.items.front())
        .map(|item| item.seqno())
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sluice_core::Vbid;

    fn item(seqno: u64) -> Arc<Item> {
        Arc::new(Item::mutation(
            Vbid::new(0),
            Seqno::new(seqno),
            Bytes::from(format!("key-{seqno}")),
            Bytes::from_static(b"v"),
            0,
        ))
    }

    fn filled(max_per_checkpoint: usize, seqnos: impl IntoIterator<Item = u64>) -> CheckpointManager {
        let manager = CheckpointManager::new(max_per_checkpoint);
        for seqno in seqnos {
            manager.queue(item(seqno));
        }
        manager
    }

    #[test]
    fn queue_seals_at_item_cap() {
        let manager = filled(3, 1..=7);
        assert_eq!(manager.num_checkpoints(), 3);
        assert_eq!(
            manager.snapshot_ranges(),
            vec![
                (Seqno::new(1), Seqno::new(3)),
                (Seqno::new(4), Seqno::new(6)),
                (Seqno::new(7), Seqno::new(7)),
            ]
        );
    }

    #[test]
    fn cursor_clamps_to_reclaimed_history() {
        let manager = filled(100, 150..=200);
        assert_eq!(manager.earliest_seqno(), Some(Seqno::new(150)));
        let effective = manager.register_cursor("s", Seqno::ZERO);
        assert_eq!(effective, Seqno::new(149));
        let run = manager.next_items("s", 1000, Seqno::MAX);
        assert_eq!(run.len(), 51);
        assert_eq!(run[0].seqno(), Seqno::new(150));
    }

    #[test]
    fn cursor_keeps_position_when_history_is_complete() {
        let manager = filled(100, 1..=10);
        let effective = manager.register_cursor("s", Seqno::ZERO);
        assert_eq!(effective, Seqno::ZERO);
        let run = manager.next_items("s", 1000, Seqno::MAX);
        assert_eq!(run.len(), 10);
        assert_eq!(run[0].seqno(), Seqno::new(1));
    }

    #[test]
    fn next_items_stops_at_checkpoint_boundary() {
        let manager = filled(3, 1..=7);
        manager.register_cursor("s", Seqno::ZERO);
        let first = manager.next_items("s", 1000, Seqno::MAX);
        assert_eq!(
            first.iter().map(|i| i.seqno().get()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let second = manager.next_items("s", 1000, Seqno::MAX);
        assert_eq!(
            second.iter().map(|i| i.seqno().get()).collect::<Vec<_>>(),
            vec![4, 5, 6]
        );
        assert_eq!(manager.items_remaining("s"), 1);
    }

    #[test]
    fn next_items_honors_item_cap_and_up_to() {
        let manager = filled(100, 1..=10);
        manager.register_cursor("s", Seqno::ZERO);
        let capped = manager.next_items("s", 4, Seqno::MAX);
        assert_eq!(capped.len(), 4);
        let bounded = manager.next_items("s", 100, Seqno::new(6));
        assert_eq!(
            bounded.iter().map(|i| i.seqno().get()).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }

    #[test]
    fn trim_respects_cursors() {
        let manager = filled(3, 1..=6);
        manager.register_cursor("s", Seqno::new(2));
        manager.trim_to(Seqno::new(5));
        // Cursor still needs 3..=5, so only 1..=2 can go.
        assert_eq!(manager.earliest_seqno(), Some(Seqno::new(3)));
        manager.remove_cursor("s");
        manager.trim_to(Seqno::new(5));
        assert_eq!(manager.earliest_seqno(), Some(Seqno::new(6)));
    }

    #[test]
    fn seal_snapshot_closes_open_checkpoint() {
        let manager = filled(100, 1..=4);
        manager.seal_snapshot(Seqno::ZERO, Seqno::new(4));
        assert_eq!(
            manager.snapshot_ranges(),
            vec![(Seqno::ZERO, Seqno::new(4))]
        );
        // Next queue opens a fresh checkpoint.
        manager.queue(item(5));
        assert_eq!(manager.num_checkpoints(), 2);
    }

    #[test]
    fn extend_open_snapshot_stretches_range() {
        let manager = filled(100, 1..=2);
        manager.extend_open_snapshot(Seqno::new(9));
        assert_eq!(
            manager.snapshot_ranges(),
            vec![(Seqno::new(1), Seqno::new(9))]
        );
    }
}
