//! Producer-side stream: backfill, in-memory and takeover phases.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sluice_core::{
    EndReason, Item, Limits, MarkerFlags, Opaque, Seqno, StreamFlags, StreamMessage, VBucketState,
    VbUuid,
};

use crate::backfill::{BackfillBudget, BackfillError, BackfillManager, BackfillSource,
    BackfillSourceKind};
use crate::notify::StreamNotifier;
use crate::stats::StatSink;
use crate::stream::{CoreInner, Stream, StreamCore, StreamIdent, StreamRequestError, StreamState};
use crate::vbucket::VBucket;

#[derive(Default)]
struct BackfillItemCounters {
    memory: AtomicU64,
    disk: AtomicU64,
    sent: AtomicU64,
}

struct ActiveInner {
    /// Last seqno the checkpoint cursor has handed us.
    cur_chk_seqno: Seqno,
    /// Vbucket state most recently sent on the takeover stream.
    takeover_state: Option<VBucketState>,
    first_marker_sent: bool,
    /// Ack-flagged markers the peer has not confirmed yet; takeover holds
    /// the handoff until this drains.
    wait_for_snapshot_acks: u32,
    backfill_task_running: bool,
    cursor_registered: bool,
    last_marker_start: Seqno,
    last_marker_end: Seqno,
    takeover_deadline: Option<Instant>,
}

type Inner = CoreInner<ActiveInner>;

pub struct ActiveStream {
    core: StreamCore<ActiveInner>,
    vb: Arc<VBucket>,
    notifier: Arc<dyn StreamNotifier>,
    budget: Arc<BackfillBudget>,
    limits: Limits,
    last_read_seqno: AtomicU64,
    last_sent_seqno: AtomicU64,
    backfill_remaining: AtomicU64,
    backfill_items: BackfillItemCounters,
    items_from_memory_phase: AtomicU64,
    buffered_backfill_bytes: AtomicU64,
    buffered_backfill_items: AtomicU64,
}

impl ActiveStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        flags: StreamFlags,
        opaque: Opaque,
        vb: Arc<VBucket>,
        notifier: Arc<dyn StreamNotifier>,
        budget: Arc<BackfillBudget>,
        limits: Limits,
        start_seqno: Seqno,
        end_seqno: Seqno,
        vb_uuid: VbUuid,
        snap_start_seqno: Seqno,
        snap_end_seqno: Seqno,
    ) -> Result<Arc<Self>, StreamRequestError> {
        let ident = StreamIdent::new(
            name,
            flags,
            opaque,
            vb.id(),
            start_seqno,
            end_seqno,
            vb_uuid,
            snap_start_seqno,
            snap_end_seqno,
        )?;
        if let Some(rollback_seqno) = vb.needs_rollback(vb_uuid, start_seqno) {
            tracing::info!(
                vb = %vb.id(),
                %vb_uuid,
                start = %start_seqno,
                rollback = %rollback_seqno,
                "stream request refused: rollback required"
            );
            return Err(StreamRequestError::RollbackRequired {
                start: start_seqno,
                rollback_seqno,
            });
        }
        Ok(Arc::new(Self {
            core: StreamCore::new(
                ident,
                StreamState::Pending,
                ActiveInner {
                    cur_chk_seqno: start_seqno,
                    takeover_state: None,
                    first_marker_sent: false,
                    wait_for_snapshot_acks: 0,
                    backfill_task_running: false,
                    cursor_registered: false,
                    last_marker_start: start_seqno,
                    last_marker_end: start_seqno,
                    takeover_deadline: None,
                },
            ),
            vb,
            notifier,
            budget,
            limits,
            last_read_seqno: AtomicU64::new(start_seqno.get()),
            last_sent_seqno: AtomicU64::new(start_seqno.get()),
            backfill_remaining: AtomicU64::new(0),
            backfill_items: BackfillItemCounters::default(),
            items_from_memory_phase: AtomicU64::new(0),
            buffered_backfill_bytes: AtomicU64::new(0),
            buffered_backfill_items: AtomicU64::new(0),
        }))
    }

    /// First activation: leave Pending and decide where history comes from.
    pub fn set_active(
        self: &Arc<Self>,
        manager: &BackfillManager,
        source: &Arc<dyn BackfillSource>,
    ) {
        let scan = {
            let mut inner = self.core.lock();
            if self.core.state() != StreamState::Pending {
                return;
            }
            self.transition(&mut inner, StreamState::Backfilling);
            self.schedule_backfill(&mut inner)
        };
        if let Some((start, end)) = scan {
            manager.schedule(self, Arc::clone(source), start, end);
        }
    }

    /// Pick the mutation sources for the requested range. Returns the disk
    /// scan to schedule, if one is needed; otherwise the stream has already
    /// moved to the in-memory phase.
    fn schedule_backfill(&self, inner: &mut Inner) -> Option<(Seqno, Seqno)> {
        let ident = self.core.ident();
        let start = ident.start_seqno();
        let high = self.vb.high_seqno();
        if ident.flags().latest() {
            ident.clamp_end_seqno(high);
        }
        let end = ident.end_seqno();
        let chk = self.vb.checkpoints();

        if start > high {
            // Nothing historical to replay.
            inner.ext.cur_chk_seqno = chk.register_cursor(ident.name(), start);
            inner.ext.cursor_registered = true;
            self.transition(inner, StreamState::InMemory);
            return None;
        }

        let earliest = chk.earliest_seqno();
        // The first seqno the peer needs is start + 1; if the checkpoint
        // ring still holds it, disk is unnecessary.
        if matches!(earliest, Some(e) if start.get().saturating_add(1) >= e.get()) {
            inner.ext.cur_chk_seqno = chk.register_cursor(ident.name(), start);
            inner.ext.cursor_registered = true;
            self.transition(inner, StreamState::InMemory);
            return None;
        }

        let backfill_end = end.min(high);
        let boundary = earliest.map_or(backfill_end, |e| Seqno::new(e.get().saturating_sub(1)));
        inner.ext.cur_chk_seqno = chk.register_cursor(ident.name(), start.max(boundary));
        inner.ext.cursor_registered = true;
        inner.ext.backfill_task_running = true;
        Some((start, backfill_end))
    }

    /// Frame the incoming disk snapshot. Called by the backfill task before
    /// it feeds any item.
    pub fn mark_disk_snapshot(&self, start: Seqno, end: Seqno) {
        let mut notify = false;
        {
            let mut inner = self.core.lock();
            if self.core.state() == StreamState::Dead {
                return;
            }
            let ident = self.core.ident();
            if ident.flags().disk_only() {
                ident.clamp_end_seqno(end);
            }
            let mut flags = MarkerFlags::DISK;
            if ident.flags().takeover() {
                flags = flags.union(MarkerFlags::ACK);
                inner.ext.wait_for_snapshot_acks += 1;
            }
            inner.ext.first_marker_sent = true;
            inner.ext.last_marker_start = start;
            inner.ext.last_marker_end = end;
            tracing::debug!(vb = %ident.vbucket(), %start, %end, "disk snapshot marked");
            let marker = StreamMessage::SnapshotMarker {
                opaque: ident.opaque(),
                vbucket: ident.vbucket(),
                start,
                end,
                flags,
            };
            self.core.push_ready(&mut inner, marker);
            notify = true;
        }
        if notify {
            self.signal();
        }
    }

    /// Accept one backfilled item; `false` tells the task to park until the
    /// producer-wide budget drains.
    pub fn backfill_received(&self, item: Item, source: BackfillSourceKind) -> bool {
        if self.core.state() == StreamState::Dead {
            // Consume and drop; the task will retire on its next slice.
            return true;
        }
        if self.budget.over_limit() {
            return false;
        }

        let mut notify = false;
        {
            let mut inner = self.core.lock();
            if self.core.state() == StreamState::Dead {
                return true;
            }
            match source {
                BackfillSourceKind::Disk => {
                    self.backfill_items.disk.fetch_add(1, Ordering::Relaxed);
                    saturating_dec(&self.backfill_remaining, 1);
                }
                BackfillSourceKind::Memory => {
                    self.backfill_items.memory.fetch_add(1, Ordering::Relaxed);
                }
            }
            let seqno = item.seqno();
            let ident = self.core.ident();
            let msg = StreamMessage::from_item(ident.opaque(), item, ident.flags().no_value());
            let size = msg.size() as u64;
            self.last_read_seqno.fetch_max(seqno.get(), Ordering::Relaxed);
            self.core.push_ready(&mut inner, msg);
            self.buffered_backfill_bytes.fetch_add(size, Ordering::Relaxed);
            self.buffered_backfill_items.fetch_add(1, Ordering::Relaxed);
            self.budget.charge(size);
            notify = true;

            if self.core.ready_bytes() > self.limits.ready_queue_max_bytes as u64 {
                tracing::warn!(
                    vb = %self.core.ident().vbucket(),
                    ready_bytes = self.core.ready_bytes(),
                    "ready queue over cap during backfill"
                );
                self.die_locked(&mut inner, EndReason::Slow, true);
            }
        }
        if notify {
            self.signal();
        }
        true
    }

    /// The backfill task has no more items to feed.
    pub fn complete_backfill(&self) {
        {
            let mut inner = self.core.lock();
            inner.ext.backfill_task_running = false;
            tracing::debug!(
                vb = %self.core.ident().vbucket(),
                read_disk = self.backfill_items.disk.load(Ordering::Relaxed),
                read_memory = self.backfill_items.memory.load(Ordering::Relaxed),
                "backfill complete"
            );
        }
        // Wake the connection so next() can conclude the phase change.
        self.signal();
    }

    /// The disk scan failed; the stream cannot satisfy its range.
    pub fn backfill_failed(&self, err: &BackfillError) {
        {
            let mut inner = self.core.lock();
            if self.core.state() == StreamState::Dead {
                return;
            }
            tracing::warn!(vb = %self.core.ident().vbucket(), %err, "backfill failed");
            inner.ext.backfill_task_running = false;
            self.die_locked(&mut inner, EndReason::Closed, false);
        }
        self.signal();
    }

    pub fn incr_backfill_remaining(&self, by: u64) {
        self.backfill_remaining.fetch_add(by, Ordering::Relaxed);
    }

    /// Peer confirmed an ack-flagged snapshot marker.
    pub fn snapshot_marker_ack_received(&self) {
        {
            let mut inner = self.core.lock();
            inner.ext.wait_for_snapshot_acks = inner.ext.wait_for_snapshot_acks.saturating_sub(1);
        }
        self.signal();
    }

    /// Peer confirmed a takeover SetVBucketState message.
    pub fn set_vbucket_state_ack_received(&self) {
        let mut notify = false;
        {
            let mut inner = self.core.lock();
            match (self.core.state(), inner.ext.takeover_state) {
                (StreamState::TakeoverSend, Some(VBucketState::Pending)) => {
                    // The peer holds the pending copy; give up local
                    // ownership and offer it the active role.
                    self.vb.set_state(VBucketState::Dead);
                    self.transition(&mut inner, StreamState::TakeoverWait);
                    inner.ext.takeover_state = Some(VBucketState::Active);
                    let ident = self.core.ident();
                    let msg = StreamMessage::SetVBucketState {
                        opaque: ident.opaque(),
                        vbucket: ident.vbucket(),
                        state: VBucketState::Active,
                    };
                    self.core.push_ready(&mut inner, msg);
                    notify = true;
                }
                (StreamState::TakeoverWait, Some(VBucketState::Active)) => {
                    self.end_stream_locked(&mut inner, EndReason::Ok);
                    notify = true;
                }
                (state, takeover_state) => {
                    tracing::warn!(
                        vb = %self.core.ident().vbucket(),
                        %state,
                        ?takeover_state,
                        "unexpected set-vbucket-state ack"
                    );
                }
            }
        }
        if notify {
            self.signal();
        }
    }

    /// The owning vbucket left the active state outside of a takeover.
    pub fn handle_vbucket_state_change(&self) {
        let mut notify = false;
        {
            let mut inner = self.core.lock();
            let state = self.core.state();
            if matches!(
                state,
                StreamState::Dead | StreamState::TakeoverSend | StreamState::TakeoverWait
            ) {
                return;
            }
            if self.vb.state() != VBucketState::Active {
                self.end_stream_locked(&mut inner, EndReason::StateChanged);
                notify = true;
            }
        }
        if notify {
            self.signal();
        }
    }

    pub fn last_read_seqno(&self) -> Seqno {
        Seqno::new(self.last_read_seqno.load(Ordering::Relaxed))
    }

    pub fn last_sent_seqno(&self) -> Seqno {
        Seqno::new(self.last_sent_seqno.load(Ordering::Relaxed))
    }

    pub fn backfill_remaining(&self) -> u64 {
        self.backfill_remaining.load(Ordering::Relaxed)
    }

    /// Estimate of items still to stream: disk remainder plus whatever the
    /// cursor has not pulled yet.
    pub fn items_remaining(&self) -> u64 {
        self.backfill_remaining()
            + self
                .vb
                .checkpoints()
                .items_remaining(self.core.ident().name())
    }

    pub fn add_takeover_stats(&self, sink: &mut dyn StatSink) {
        let vb = self.core.ident().vbucket();
        let status = match self.core.state() {
            StreamState::Backfilling => "backfilling",
            StreamState::InMemory => "in-memory",
            StreamState::TakeoverSend => "takeover-send",
            StreamState::TakeoverWait => "takeover-wait",
            other => other.as_str(),
        };
        sink.stat(&format!("vb_{}_status", vb.get()), status.to_string());
        sink.stat(
            &format!("vb_{}_estimate", vb.get()),
            self.items_remaining().to_string(),
        );
        sink.stat(
            &format!("vb_{}_backfill_remaining", vb.get()),
            self.backfill_remaining().to_string(),
        );
    }

    fn signal(&self) {
        self.core.signal_ready(self.notifier.as_ref());
    }

    fn transition(&self, inner: &mut Inner, to: StreamState) {
        let from = self.core.state();
        let legal = matches!(
            (from, to),
            (StreamState::Pending, StreamState::Backfilling)
                | (StreamState::Backfilling, StreamState::InMemory)
                | (StreamState::Backfilling, StreamState::TakeoverSend)
                | (StreamState::InMemory, StreamState::TakeoverSend)
                | (StreamState::TakeoverSend, StreamState::TakeoverWait)
                | (_, StreamState::Dead)
        );
        assert!(legal, "invalid active stream transition {from} -> {to}");
        self.core.record_transition(inner, to);
        if to == StreamState::InMemory || to == StreamState::Dead {
            inner.ext.backfill_task_running = false;
        }
    }

    /// Graceful end: keep the queue for draining (Slow clears it, since the
    /// queue itself is the problem) and tell the peer why.
    fn end_stream_locked(&self, inner: &mut Inner, reason: EndReason) {
        self.die_locked(inner, reason, matches!(reason, EndReason::Slow));
    }

    fn die_locked(&self, inner: &mut Inner, reason: EndReason, clear_queue: bool) -> u64 {
        if self.core.state() == StreamState::Dead {
            return 0;
        }
        let freed = if clear_queue {
            self.core.clear_ready(inner)
        } else {
            0
        };
        let ident = self.core.ident();
        if reason != EndReason::Disconnected {
            let msg = StreamMessage::StreamEnd {
                opaque: ident.opaque(),
                vbucket: ident.vbucket(),
                reason,
            };
            self.core.push_ready(&mut *inner, msg);
        }
        self.transition(inner, StreamState::Dead);
        if inner.ext.cursor_registered {
            self.vb.checkpoints().remove_cursor(ident.name());
            inner.ext.cursor_registered = false;
        }
        let buffered = self.buffered_backfill_bytes.swap(0, Ordering::Relaxed);
        self.buffered_backfill_items.store(0, Ordering::Relaxed);
        self.budget.release(buffered);
        tracing::info!(
            vb = %ident.vbucket(),
            stream = ident.name(),
            %reason,
            last_sent = %self.last_sent_seqno(),
            "stream ended"
        );
        freed
    }

    fn backfill_phase(&self, inner: &mut Inner) -> Option<StreamMessage> {
        if let Some(msg) = self.core.pop_ready(inner) {
            if msg.is_item() {
                self.release_backfill_msg(msg.size() as u64);
                self.backfill_items.sent.fetch_add(1, Ordering::Relaxed);
            }
            return Some(msg);
        }

        if inner.ext.backfill_task_running {
            return None;
        }

        // Backfill drained; decide where the stream goes next.
        let ident = self.core.ident();
        let last_read = self.last_read_seqno();
        if ident.flags().disk_only() || last_read >= ident.end_seqno() {
            self.end_stream_locked(inner, EndReason::Ok);
            return self.core.pop_ready(inner);
        }
        if ident.flags().takeover() && last_read >= self.vb.high_seqno() {
            self.transition(inner, StreamState::TakeoverSend);
            return self.takeover_send_phase(inner);
        }
        self.transition(inner, StreamState::InMemory);
        self.in_memory_phase(inner)
    }

    fn in_memory_phase(&self, inner: &mut Inner) -> Option<StreamMessage> {
        if inner.ready.is_empty() {
            self.next_checkpoint_batch(inner);
            if inner.ready.is_empty() && self.core.state() == StreamState::InMemory {
                let ident = self.core.ident();
                let last_read = self.last_read_seqno();
                if last_read >= ident.end_seqno() {
                    self.end_stream_locked(inner, EndReason::Ok);
                } else if ident.flags().takeover() && last_read >= self.vb.high_seqno() {
                    self.transition(inner, StreamState::TakeoverSend);
                    return self.takeover_send_phase(inner);
                } else {
                    return None;
                }
            }
        }
        self.core.pop_ready(inner)
    }

    /// Pull one run from the checkpoint cursor and frame it as a memory
    /// snapshot: a single marker followed by the run's items.
    fn next_checkpoint_batch(&self, inner: &mut Inner) {
        if !inner.ext.cursor_registered {
            return;
        }
        let ident = self.core.ident();
        let items = self.vb.checkpoints().next_items(
            ident.name(),
            self.limits.checkpoint_batch_items,
            ident.end_seqno(),
        );
        let (Some(first), Some(last)) = (items.first(), items.last()) else {
            return;
        };
        let (run_start, run_end) = (first.seqno(), last.seqno());
        inner.ext.cur_chk_seqno = run_end;

        let mut flags = MarkerFlags::MEMORY.union(MarkerFlags::CHK);
        if ident.flags().takeover() {
            flags = flags.union(MarkerFlags::ACK);
            inner.ext.wait_for_snapshot_acks += 1;
        }
        // The marker opens at the first seqno actually pulled, not at the
        // snapshot boundary quoted in the open request.
        inner.ext.first_marker_sent = true;
        inner.ext.last_marker_start = run_start;
        inner.ext.last_marker_end = run_end;
        let marker = StreamMessage::SnapshotMarker {
            opaque: ident.opaque(),
            vbucket: ident.vbucket(),
            start: run_start,
            end: run_end,
            flags,
        };
        self.core.push_ready(&mut *inner, marker);

        let key_only = ident.flags().no_value();
        let opaque = ident.opaque();
        for item in items {
            let seqno = item.seqno();
            self.last_read_seqno.fetch_max(seqno.get(), Ordering::Relaxed);
            let msg = StreamMessage::from_item(opaque, item.as_ref().clone(), key_only);
            self.core.push_ready(&mut *inner, msg);
            self.items_from_memory_phase.fetch_add(1, Ordering::Relaxed);
            if self.core.ready_bytes() > self.limits.ready_queue_max_bytes as u64 {
                tracing::warn!(
                    vb = %self.core.ident().vbucket(),
                    ready_bytes = self.core.ready_bytes(),
                    at_seqno = %seqno,
                    "ready queue over cap"
                );
                self.die_locked(inner, EndReason::Slow, true);
                return;
            }
        }
    }

    fn takeover_send_phase(&self, inner: &mut Inner) -> Option<StreamMessage> {
        self.ensure_takeover_deadline(inner);
        if self.takeover_expired(inner) {
            self.end_stream_locked(inner, EndReason::Closed);
            return self.core.pop_ready(inner);
        }
        if let Some(msg) = self.core.pop_ready(inner) {
            return Some(msg);
        }
        if inner.ext.wait_for_snapshot_acks > 0 {
            return None;
        }
        if inner.ext.takeover_state.is_none() {
            inner.ext.takeover_state = Some(VBucketState::Pending);
            let ident = self.core.ident();
            let msg = StreamMessage::SetVBucketState {
                opaque: ident.opaque(),
                vbucket: ident.vbucket(),
                state: VBucketState::Pending,
            };
            self.core.push_ready(&mut *inner, msg);
            return self.core.pop_ready(inner);
        }
        None
    }

    fn takeover_wait_phase(&self, inner: &mut Inner) -> Option<StreamMessage> {
        self.ensure_takeover_deadline(inner);
        if self.takeover_expired(inner) {
            self.end_stream_locked(inner, EndReason::Closed);
        }
        self.core.pop_ready(inner)
    }

    fn ensure_takeover_deadline(&self, inner: &mut Inner) {
        if inner.ext.takeover_deadline.is_none() {
            inner.ext.takeover_deadline =
                Some(Instant::now() + Duration::from_millis(self.limits.takeover_max_time_ms));
        }
    }

    fn takeover_expired(&self, inner: &Inner) -> bool {
        matches!(inner.ext.takeover_deadline, Some(deadline) if Instant::now() > deadline)
    }

    fn release_backfill_msg(&self, size: u64) {
        // Skip if teardown already settled the budget.
        let mut items = self.buffered_backfill_items.load(Ordering::Relaxed);
        loop {
            if items == 0 {
                return;
            }
            match self.buffered_backfill_items.compare_exchange_weak(
                items,
                items - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => items = observed,
            }
        }
        saturating_dec(&self.buffered_backfill_bytes, size);
        self.budget.release(size);
    }
}

impl Stream for ActiveStream {
    fn ident(&self) -> &StreamIdent {
        self.core.ident()
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    fn next(&self) -> Option<StreamMessage> {
        let msg = {
            let mut inner = self.core.lock();
            match self.core.state() {
                StreamState::Pending => None,
                StreamState::Backfilling => self.backfill_phase(&mut inner),
                StreamState::InMemory => self.in_memory_phase(&mut inner),
                StreamState::TakeoverSend => self.takeover_send_phase(&mut inner),
                StreamState::TakeoverWait => self.takeover_wait_phase(&mut inner),
                StreamState::Dead => self.core.pop_ready(&mut inner),
                StreamState::Reading => unreachable!("producer stream cannot be reading"),
            }
        };
        match &msg {
            Some(msg) => {
                if let Some(seqno) = msg.seqno() {
                    self.last_sent_seqno.fetch_max(seqno.get(), Ordering::Relaxed);
                }
            }
            None => self.core.edge_clear(),
        }
        msg
    }

    fn set_dead(&self, reason: EndReason) -> u64 {
        let freed = {
            let mut inner = self.core.lock();
            self.die_locked(&mut inner, reason, !matches!(reason, EndReason::Ok))
        };
        if reason != EndReason::Disconnected {
            self.signal();
        }
        freed
    }

    fn notify_seqno_available(&self, _seqno: Seqno) {
        if self.core.state() == StreamState::Dead {
            return;
        }
        let queue_empty = {
            let inner = self.core.lock();
            inner.ready.is_empty()
        };
        if queue_empty {
            self.signal();
        }
    }

    fn clear(&self) {
        let mut inner = self.core.lock();
        self.core.clear_ready(&mut inner);
    }

    fn add_stats(&self, sink: &mut dyn StatSink) {
        self.core.add_base_stats(sink);
        let ident = self.core.ident();
        let prefix = format!("{}:stream_{}", ident.name(), ident.vbucket().get());
        sink.stat(
            &format!("{prefix}_last_read_seqno"),
            self.last_read_seqno().get().to_string(),
        );
        sink.stat(
            &format!("{prefix}_last_sent_seqno"),
            self.last_sent_seqno().get().to_string(),
        );
        sink.stat(
            &format!("{prefix}_backfill_remaining"),
            self.backfill_remaining().to_string(),
        );
        sink.stat(
            &format!("{prefix}_backfill_disk_items"),
            self.backfill_items.disk.load(Ordering::Relaxed).to_string(),
        );
        sink.stat(
            &format!("{prefix}_backfill_mem_items"),
            self.backfill_items
                .memory
                .load(Ordering::Relaxed)
                .to_string(),
        );
        sink.stat(
            &format!("{prefix}_backfill_sent"),
            self.backfill_items.sent.load(Ordering::Relaxed).to_string(),
        );
        sink.stat(
            &format!("{prefix}_memory_phase_items"),
            self.items_from_memory_phase
                .load(Ordering::Relaxed)
                .to_string(),
        );
        sink.stat(
            &format!("{prefix}_buffered_backfill_bytes"),
            self.buffered_backfill_bytes
                .load(Ordering::Relaxed)
                .to_string(),
        );
        let inner = self.core.lock();
        sink.stat(
            &format!("{prefix}_cur_chk_seqno"),
            inner.ext.cur_chk_seqno.get().to_string(),
        );
        sink.stat(
            &format!("{prefix}_first_marker_sent"),
            inner.ext.first_marker_sent.to_string(),
        );
    }
}

fn saturating_dec(cell: &AtomicU64, by: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(by);
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}
