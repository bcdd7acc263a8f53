//! Consumer-side stream: inbound validation, buffering and the apply path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use sluice_core::{
    EndReason, Limits, Opaque, STATUS_SUCCESS, Seqno, SnapshotType, StreamFlags, StreamMessage,
    VbUuid,
};

use crate::notify::StreamNotifier;
use crate::stats::StatSink;
use crate::stream::{CoreInner, Stream, StreamCore, StreamIdent, StreamRequestError, StreamState};
use crate::vbucket::{ApplyError, ItemSink, VBucket};

/// Result of one buffered-processing slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// The buffer is empty after this call.
    AllProcessed,
    /// Work remains; the caller should reschedule.
    MoreToProcess,
    /// The slice stopped early. If the stream is still alive the failure
    /// was transient and the caller should reschedule; a dead stream means
    /// a protocol violation already tore it down.
    CannotProcess,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ReceiveError {
    #[error("stream is dead")]
    StreamDead,
    #[error("snapshot marker received while snapshot [{start}..{end}] open at {last}")]
    MarkerWhileSnapshotOpen {
        start: Seqno,
        end: Seqno,
        last: Seqno,
    },
    #[error("snapshot marker names no snapshot type")]
    MarkerWithoutType,
    #[error("seqno {seqno} outside snapshot [{start}..{end}]")]
    SeqnoOutsideSnapshot {
        seqno: Seqno,
        start: Seqno,
        end: Seqno,
    },
    #[error("seqno {seqno} does not advance past {last}")]
    NonMonotonicSeqno { seqno: Seqno, last: Seqno },
    #[error("apply rejected: {0}")]
    ApplyRejected(ApplyError),
    #[error("{kind} not expected by a consumer stream")]
    UnexpectedMessage { kind: &'static str },
    #[error("stream buffer full at {bytes} bytes / {items} items")]
    BufferFull { bytes: usize, items: usize },
}

enum ProcessFailure {
    Temporary,
    Violation(ReceiveError),
}

struct PassiveInner {
    cur_snapshot_type: SnapshotType,
    cur_snapshot_ack: bool,
}

type Inner = CoreInner<PassiveInner>;

#[derive(Default)]
struct StreamBuffer {
    messages: VecDeque<StreamMessage>,
    bytes: usize,
}

pub struct PassiveStream {
    core: StreamCore<PassiveInner>,
    vb: Arc<VBucket>,
    sink: Arc<dyn ItemSink>,
    notifier: Arc<dyn StreamNotifier>,
    limits: Limits,
    last_seqno: AtomicU64,
    cur_snapshot_start: AtomicU64,
    cur_snapshot_end: AtomicU64,
    unacked_bytes: AtomicU64,
    buffer: Mutex<StreamBuffer>,
}

impl PassiveStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        flags: StreamFlags,
        opaque: Opaque,
        vb: Arc<VBucket>,
        sink: Arc<dyn ItemSink>,
        notifier: Arc<dyn StreamNotifier>,
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
        let last_applied = vb.high_seqno();
        let stream = Arc::new(Self {
            core: StreamCore::new(
                ident,
                StreamState::Pending,
                PassiveInner {
                    cur_snapshot_type: SnapshotType::None,
                    cur_snapshot_ack: false,
                },
            ),
            vb,
            sink,
            notifier,
            limits,
            last_seqno: AtomicU64::new(last_applied.get()),
            cur_snapshot_start: AtomicU64::new(0),
            cur_snapshot_end: AtomicU64::new(0),
            unacked_bytes: AtomicU64::new(0),
            buffer: Mutex::new(StreamBuffer::default()),
        });
        // Ask the producer to open the stream.
        {
            let mut inner = stream.core.lock();
            let request = stream.stream_request(start_seqno, snap_start_seqno, snap_end_seqno);
            stream.core.push_ready(&mut inner, request);
        }
        stream.signal();
        Ok(stream)
    }

    pub fn last_seqno(&self) -> Seqno {
        Seqno::new(self.last_seqno.load(Ordering::SeqCst))
    }

    pub fn cur_snapshot(&self) -> (Seqno, Seqno) {
        (
            Seqno::new(self.cur_snapshot_start.load(Ordering::SeqCst)),
            Seqno::new(self.cur_snapshot_end.load(Ordering::SeqCst)),
        )
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_lock().bytes
    }

    pub fn buffer_items(&self) -> usize {
        self.buffer_lock().messages.len()
    }

    /// The transport accepted (or rejected) our stream request.
    pub fn accept_stream(&self, status: u16, add_opaque: Opaque) {
        {
            let mut inner = self.core.lock();
            if self.core.state() == StreamState::Pending {
                if status == STATUS_SUCCESS {
                    self.transition(&mut inner, StreamState::Reading);
                } else {
                    tracing::warn!(
                        vb = %self.core.ident().vbucket(),
                        status,
                        "stream request rejected"
                    );
                    self.transition(&mut inner, StreamState::Dead);
                }
            }
            let msg = StreamMessage::AddStreamResponse {
                opaque: self.core.ident().opaque(),
                add_opaque,
                status,
            };
            self.core.push_ready(&mut inner, msg);
        }
        self.signal();
    }

    /// The transport re-established with the stream identity preserved:
    /// take the new opaque, resume at `start_seqno`, drop anything
    /// buffered, and re-request the stream. Dead is terminal; a dead
    /// stream is not resurrected and this call is a no-op.
    pub fn reconnect_stream(&self, new_opaque: Opaque, start_seqno: Seqno) {
        if self.core.state() == StreamState::Dead {
            tracing::debug!(
                vb = %self.core.ident().vbucket(),
                "reconnect ignored on dead stream"
            );
            return;
        }
        {
            let mut buffer = self.buffer_lock();
            buffer.messages.clear();
            buffer.bytes = 0;
        }
        {
            let mut inner = self.core.lock();
            if self.core.state() == StreamState::Dead {
                return;
            }
            let ident = self.core.ident();
            ident.set_opaque(new_opaque);
            ident.set_start_seqno(start_seqno);
            inner.ext.cur_snapshot_type = SnapshotType::None;
            inner.ext.cur_snapshot_ack = false;
            self.cur_snapshot_start.store(0, Ordering::SeqCst);
            self.cur_snapshot_end.store(0, Ordering::SeqCst);
            tracing::info!(
                vb = %ident.vbucket(),
                opaque = %new_opaque,
                start = %start_seqno,
                "stream reconnecting"
            );
            if self.core.state() != StreamState::Pending {
                self.transition(&mut inner, StreamState::Pending);
            }
            let request = self.stream_request(start_seqno, start_seqno, start_seqno);
            self.core.push_ready(&mut inner, request);
        }
        self.signal();
    }

    /// Validate an inbound message and apply it now, or park it in the
    /// buffer when a backlog exists or the apply path pushed back.
    pub fn message_received(&self, msg: StreamMessage) -> Result<(), ReceiveError> {
        if self.core.state() == StreamState::Dead {
            return Err(ReceiveError::StreamDead);
        }
        match &msg {
            StreamMessage::SnapshotMarker { .. }
            | StreamMessage::Mutation { .. }
            | StreamMessage::Deletion { .. }
            | StreamMessage::Expiration { .. }
            | StreamMessage::SetVBucketState { .. }
            | StreamMessage::StreamEnd { .. } => {}
            other => {
                return Err(ReceiveError::UnexpectedMessage { kind: other.kind() });
            }
        }

        let backlog = !self.buffer_lock().messages.is_empty();
        if backlog {
            return self.buffer_message(msg);
        }

        let mut notify = false;
        let result = self.process_message(&msg, &mut notify);
        if notify {
            self.signal();
        }
        match result {
            Ok(()) => Ok(()),
            Err(ProcessFailure::Temporary) => self.buffer_message(msg),
            Err(ProcessFailure::Violation(err)) => Err(err),
        }
    }

    /// Drain up to a batch worth of bytes from the buffer, applying each
    /// message. Returns the outcome and the bytes processed.
    pub fn process_buffered_messages(&self) -> (ProcessResult, u64) {
        let mut batch = {
            let mut buffer = self.buffer_lock();
            let mut batch = VecDeque::new();
            let mut batch_bytes = 0usize;
            while let Some(front) = buffer.messages.front() {
                let size = front.size();
                if !batch.is_empty() && batch_bytes + size > self.limits.processor_batch_bytes {
                    break;
                }
                batch_bytes += size;
                buffer.bytes -= size;
                batch.push_back(buffer.messages.pop_front().expect("front checked"));
            }
            batch
        };
        if batch.is_empty() {
            return (ProcessResult::AllProcessed, 0);
        }

        let mut processed = 0u64;
        let mut notify = false;
        let mut stopped = false;
        while let Some(msg) = batch.pop_front() {
            match self.process_message(&msg, &mut notify) {
                Ok(()) => processed += msg.size() as u64,
                Err(ProcessFailure::Temporary) => {
                    batch.push_front(msg);
                    self.refront(batch);
                    stopped = true;
                    break;
                }
                Err(ProcessFailure::Violation(err)) => {
                    tracing::warn!(
                        vb = %self.core.ident().vbucket(),
                        %err,
                        "protocol violation in buffered message"
                    );
                    self.set_dead(EndReason::Closed);
                    stopped = true;
                    break;
                }
            }
        }

        if processed > 0 {
            let total = self.unacked_bytes.fetch_add(processed, Ordering::Relaxed) + processed;
            if total >= self.limits.buffer_ack_threshold_bytes as u64 {
                let acked = self.unacked_bytes.swap(0, Ordering::Relaxed);
                if acked > 0 {
                    let ident = self.core.ident();
                    let ack = StreamMessage::BufferAck {
                        opaque: ident.opaque(),
                        vbucket: ident.vbucket(),
                        bytes: acked.min(u64::from(u32::MAX)) as u32,
                    };
                    let mut inner = self.core.lock();
                    self.core.push_ready(&mut inner, ack);
                    notify = true;
                }
            }
        }
        if notify {
            self.signal();
        }

        if stopped {
            return (ProcessResult::CannotProcess, processed);
        }
        let empty = self.buffer_lock().messages.is_empty();
        let result = if empty {
            ProcessResult::AllProcessed
        } else {
            ProcessResult::MoreToProcess
        };
        (result, processed)
    }

    fn buffer_message(&self, msg: StreamMessage) -> Result<(), ReceiveError> {
        let mut buffer = self.buffer_lock();
        let size = msg.size();
        if buffer.messages.len() >= self.limits.stream_buffer_max_items
            || buffer.bytes + size > self.limits.stream_buffer_max_bytes
        {
            return Err(ReceiveError::BufferFull {
                bytes: buffer.bytes,
                items: buffer.messages.len(),
            });
        }
        buffer.bytes += size;
        buffer.messages.push_back(msg);
        Ok(())
    }

    fn refront(&self, leftover: VecDeque<StreamMessage>) {
        let mut buffer = self.buffer_lock();
        for msg in leftover.into_iter().rev() {
            buffer.bytes += msg.size();
            buffer.messages.push_front(msg);
        }
    }

    /// Apply one message under the stream lock. Validation happens here so
    /// it always runs against the window the preceding messages left
    /// behind, whether the message arrived straight off the wire or
    /// through the buffer.
    fn process_message(
        &self,
        msg: &StreamMessage,
        notify: &mut bool,
    ) -> Result<(), ProcessFailure> {
        let mut inner = self.core.lock();
        if self.core.state() == StreamState::Dead {
            return Err(ProcessFailure::Violation(ReceiveError::StreamDead));
        }
        match msg {
            StreamMessage::SnapshotMarker {
                start, end, flags, ..
            } => {
                let ty = flags
                    .snapshot_type()
                    .map_err(|_| ProcessFailure::Violation(ReceiveError::MarkerWithoutType))?;
                let last = self.last_seqno();
                let (cur_start, cur_end) = self.cur_snapshot();
                if inner.ext.cur_snapshot_type != SnapshotType::None && last < cur_end {
                    return Err(ProcessFailure::Violation(
                        ReceiveError::MarkerWhileSnapshotOpen {
                            start: cur_start,
                            end: cur_end,
                            last,
                        },
                    ));
                }
                inner.ext.cur_snapshot_type = ty;
                inner.ext.cur_snapshot_ack = flags.requires_ack();
                self.cur_snapshot_start.store(start.get(), Ordering::SeqCst);
                self.cur_snapshot_end.store(end.get(), Ordering::SeqCst);
                tracing::debug!(
                    vb = %self.core.ident().vbucket(),
                    %start,
                    %end,
                    %ty,
                    "snapshot opened"
                );
            }
            StreamMessage::Mutation { item, .. }
            | StreamMessage::Deletion { item, .. }
            | StreamMessage::Expiration { item, .. } => {
                let seqno = item.seqno();
                let last = self.last_seqno();
                if inner.ext.cur_snapshot_type == SnapshotType::None {
                    return Err(ProcessFailure::Violation(
                        ReceiveError::SeqnoOutsideSnapshot {
                            seqno,
                            start: last,
                            end: last,
                        },
                    ));
                }
                if seqno <= last {
                    return Err(ProcessFailure::Violation(ReceiveError::NonMonotonicSeqno {
                        seqno,
                        last,
                    }));
                }
                let (start, end) = self.cur_snapshot();
                if seqno < start || seqno > end {
                    return Err(ProcessFailure::Violation(
                        ReceiveError::SeqnoOutsideSnapshot { seqno, start, end },
                    ));
                }
                match self.sink.apply(item) {
                    Ok(()) => {}
                    Err(ApplyError::Temporary) => return Err(ProcessFailure::Temporary),
                    Err(err @ ApplyError::NotWritable { .. }) => {
                        return Err(ProcessFailure::Violation(ReceiveError::ApplyRejected(err)));
                    }
                }
                self.last_seqno.store(seqno.get(), Ordering::SeqCst);
                self.handle_snapshot_end(&mut inner, seqno, notify);
            }
            StreamMessage::SetVBucketState { state, .. } => {
                self.vb.set_state(*state);
                let ident = self.core.ident();
                let response = StreamMessage::SetVBucketStateResponse {
                    opaque: ident.opaque(),
                    vbucket: ident.vbucket(),
                    status: STATUS_SUCCESS,
                };
                self.core.push_ready(&mut inner, response);
                *notify = true;
            }
            StreamMessage::StreamEnd { reason, .. } => {
                tracing::info!(
                    vb = %self.core.ident().vbucket(),
                    %reason,
                    last_seqno = %self.last_seqno(),
                    "producer ended stream"
                );
                self.transition(&mut inner, StreamState::Dead);
            }
            other => {
                return Err(ProcessFailure::Violation(ReceiveError::UnexpectedMessage {
                    kind: other.kind(),
                }));
            }
        }
        Ok(())
    }

    /// Close out the current snapshot once its end seqno has been applied:
    /// disk snapshots are flushed to the local checkpoint as a new
    /// snapshot, memory snapshots are a continuation of the open one.
    fn handle_snapshot_end(&self, inner: &mut Inner, seqno: Seqno, notify: &mut bool) {
        if inner.ext.cur_snapshot_type == SnapshotType::None {
            return;
        }
        let (start, end) = self.cur_snapshot();
        if seqno != end {
            return;
        }
        match inner.ext.cur_snapshot_type {
            SnapshotType::Disk => self.vb.checkpoints().seal_snapshot(start, end),
            SnapshotType::Memory => self.vb.checkpoints().extend_open_snapshot(end),
            SnapshotType::None => {}
        }
        if inner.ext.cur_snapshot_ack {
            let ident = self.core.ident();
            let ack = StreamMessage::SnapshotMarkerAck {
                opaque: ident.opaque(),
                vbucket: ident.vbucket(),
                status: STATUS_SUCCESS,
            };
            self.core.push_ready(&mut *inner, ack);
            *notify = true;
        }
        inner.ext.cur_snapshot_type = SnapshotType::None;
        inner.ext.cur_snapshot_ack = false;
        self.cur_snapshot_start.store(0, Ordering::SeqCst);
        self.cur_snapshot_end.store(0, Ordering::SeqCst);
        tracing::debug!(vb = %self.core.ident().vbucket(), %end, "snapshot complete");
    }

    fn stream_request(&self, start: Seqno, snap_start: Seqno, snap_end: Seqno) -> StreamMessage {
        let ident = self.core.ident();
        StreamMessage::StreamRequest {
            opaque: ident.opaque(),
            vbucket: ident.vbucket(),
            flags: ident.flags(),
            start,
            end: ident.end_seqno(),
            vb_uuid: ident.vb_uuid(),
            snap_start,
            snap_end,
        }
    }

    fn transition(&self, inner: &mut Inner, to: StreamState) {
        let from = self.core.state();
        let legal = matches!(
            (from, to),
            (StreamState::Pending, StreamState::Reading)
                | (_, StreamState::Dead)
                // Reconnect re-requests the stream after a transport drop.
                | (StreamState::Reading, StreamState::Pending)
        );
        assert!(legal, "invalid passive stream transition {from} -> {to}");
        self.core.record_transition(inner, to);
    }

    fn buffer_lock(&self) -> MutexGuard<'_, StreamBuffer> {
        self.buffer.lock().expect("stream buffer lock poisoned")
    }

    fn signal(&self) {
        self.core.signal_ready(self.notifier.as_ref());
    }
}

impl Stream for PassiveStream {
    fn ident(&self) -> &StreamIdent {
        self.core.ident()
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Control responses only: stream requests, add-stream responses,
    /// marker acks, vbucket-state responses and buffer acks.
    fn next(&self) -> Option<StreamMessage> {
        let msg = {
            let mut inner = self.core.lock();
            self.core.pop_ready(&mut inner)
        };
        if msg.is_none() {
            self.core.edge_clear();
        }
        msg
    }

    fn set_dead(&self, reason: EndReason) -> u64 {
        let freed = {
            let mut buffer = self.buffer_lock();
            let freed = buffer.bytes as u64;
            buffer.messages.clear();
            buffer.bytes = 0;
            freed
        };
        {
            let mut inner = self.core.lock();
            if self.core.state() == StreamState::Dead {
                return 0;
            }
            self.transition(&mut inner, StreamState::Dead);
        }
        let vb = self.core.ident().vbucket();
        if reason == EndReason::Disconnected {
            tracing::info!(%vb, %reason, last_seqno = %self.last_seqno(), "passive stream dead");
        } else {
            tracing::warn!(%vb, %reason, last_seqno = %self.last_seqno(), "passive stream dead");
        }
        freed
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
            &format!("{prefix}_last_received_seqno"),
            self.last_seqno().get().to_string(),
        );
        let (start, end) = self.cur_snapshot();
        sink.stat(
            &format!("{prefix}_cur_snapshot_start"),
            start.get().to_string(),
        );
        sink.stat(&format!("{prefix}_cur_snapshot_end"), end.get().to_string());
        {
            let inner = self.core.lock();
            sink.stat(
                &format!("{prefix}_cur_snapshot_type"),
                inner.ext.cur_snapshot_type.to_string(),
            );
        }
        sink.stat(
            &format!("{prefix}_buffer_bytes"),
            self.buffer_bytes().to_string(),
        );
        sink.stat(
            &format!("{prefix}_buffer_items"),
            self.buffer_items().to_string(),
        );
        sink.stat(
            &format!("{prefix}_unacked_bytes"),
            self.unacked_bytes.load(Ordering::Relaxed).to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;

    use sluice_core::{Item, MarkerFlags, STATUS_ROLLBACK, VBucketState, Vbid};

    use crate::notify::NullNotifier;

    struct FlakySink {
        vb: Arc<VBucket>,
        failures_left: AtomicU32,
    }

    impl ItemSink for FlakySink {
        fn apply(&self, item: &Item) -> Result<(), ApplyError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ApplyError::Temporary);
            }
            self.vb.apply(item)
        }
    }

    fn replica_vb() -> Arc<VBucket> {
        VBucket::new(
            Vbid::new(7),
            VBucketState::Replica,
            VbUuid::new(0xbeef),
            &Limits::default(),
        )
    }

    fn passive(
        vb: &Arc<VBucket>,
        sink: Arc<dyn ItemSink>,
        limits: Limits,
    ) -> Arc<PassiveStream> {
        let stream = PassiveStream::new(
            "conn-2",
            StreamFlags::NONE,
            Opaque::new(41),
            Arc::clone(vb),
            sink,
            Arc::new(NullNotifier),
            limits,
            Seqno::ZERO,
            Seqno::MAX,
            VbUuid::new(0xbeef),
            Seqno::ZERO,
            Seqno::ZERO,
        )
        .expect("valid stream");
        // Swallow the initial stream request and enter Reading.
        assert!(matches!(
            stream.next(),
            Some(StreamMessage::StreamRequest { .. })
        ));
        stream.accept_stream(STATUS_SUCCESS, Opaque::new(41));
        assert!(matches!(
            stream.next(),
            Some(StreamMessage::AddStreamResponse { .. })
        ));
        stream
    }

    fn marker(start: u64, end: u64, ty: MarkerFlags) -> StreamMessage {
        StreamMessage::SnapshotMarker {
            opaque: Opaque::new(41),
            vbucket: Vbid::new(7),
            start: Seqno::new(start),
            end: Seqno::new(end),
            flags: ty,
        }
    }

    fn mutation(seqno: u64) -> StreamMessage {
        StreamMessage::Mutation {
            opaque: Opaque::new(41),
            item: Item::mutation(
                Vbid::new(7),
                Seqno::new(seqno),
                Bytes::from(format!("key-{seqno}")),
                Bytes::from(format!("value-{seqno}")),
                0,
            ),
        }
    }

    #[test]
    fn applies_marked_mutations_in_order() {
        let vb = replica_vb();
        let stream = passive(&vb, vb.clone() as Arc<dyn ItemSink>, Limits::default());

        stream
            .message_received(marker(1, 3, MarkerFlags::MEMORY))
            .unwrap();
        for seqno in 1..=3 {
            stream.message_received(mutation(seqno)).unwrap();
        }
        assert_eq!(stream.last_seqno(), Seqno::new(3));
        assert_eq!(vb.high_seqno(), Seqno::new(3));
        // Window closed at the snapshot end.
        assert_eq!(stream.cur_snapshot(), (Seqno::ZERO, Seqno::ZERO));
    }

    #[test]
    fn disk_snapshot_end_seals_local_checkpoint_and_acks() {
        let vb = replica_vb();
        let stream = passive(&vb, vb.clone() as Arc<dyn ItemSink>, Limits::default());

        stream
            .message_received(marker(0, 2, MarkerFlags::DISK.union(MarkerFlags::ACK)))
            .unwrap();
        stream.message_received(mutation(1)).unwrap();
        stream.message_received(mutation(2)).unwrap();

        assert_eq!(
            vb.checkpoints().snapshot_ranges(),
            vec![(Seqno::ZERO, Seqno::new(2))]
        );
        let ack = stream.next().expect("marker ack");
        assert!(matches!(
            ack,
            StreamMessage::SnapshotMarkerAck {
                status: STATUS_SUCCESS,
                ..
            }
        ));
    }

    #[test]
    fn rejects_mutation_outside_snapshot() {
        let vb = replica_vb();
        let stream = passive(&vb, vb.clone() as Arc<dyn ItemSink>, Limits::default());

        stream
            .message_received(marker(1, 40, MarkerFlags::MEMORY))
            .unwrap();
        stream.message_received(mutation(5)).unwrap();

        let err = stream.message_received(mutation(50)).unwrap_err();
        assert!(matches!(err, ReceiveError::SeqnoOutsideSnapshot { .. }));

        // The connection reacts by killing the stream.
        let freed = stream.set_dead(EndReason::Closed);
        assert_eq!(freed, 0);
        assert_eq!(stream.state(), StreamState::Dead);
        assert!(matches!(
            stream.message_received(mutation(6)),
            Err(ReceiveError::StreamDead)
        ));
    }

    #[test]
    fn rejects_duplicate_and_early_marker() {
        let vb = replica_vb();
        let stream = passive(&vb, vb.clone() as Arc<dyn ItemSink>, Limits::default());

        stream
            .message_received(marker(1, 4, MarkerFlags::MEMORY))
            .unwrap();
        stream.message_received(mutation(1)).unwrap();
        let err = stream.message_received(mutation(1)).unwrap_err();
        assert!(matches!(err, ReceiveError::NonMonotonicSeqno { .. }));

        let err = stream
            .message_received(marker(5, 9, MarkerFlags::MEMORY))
            .unwrap_err();
        assert!(matches!(err, ReceiveError::MarkerWhileSnapshotOpen { .. }));
    }

    #[test]
    fn temporary_apply_failure_buffers_then_recovers() {
        let vb = replica_vb();
        let sink = Arc::new(FlakySink {
            vb: Arc::clone(&vb),
            failures_left: AtomicU32::new(1),
        });
        let limits = Limits {
            buffer_ack_threshold_bytes: 1,
            ..Limits::default()
        };
        let stream = passive(&vb, sink, limits);

        stream
            .message_received(marker(1, 2, MarkerFlags::MEMORY))
            .unwrap();
        // Sink pushes back; the mutation lands in the buffer.
        stream.message_received(mutation(1)).unwrap();
        assert_eq!(stream.buffer_items(), 1);
        // Later messages queue behind it regardless of the sink.
        stream.message_received(mutation(2)).unwrap();
        assert_eq!(stream.buffer_items(), 2);

        let (result, processed) = stream.process_buffered_messages();
        assert_eq!(result, ProcessResult::AllProcessed);
        assert!(processed > 0);
        assert_eq!(stream.last_seqno(), Seqno::new(2));

        let ack = stream.next().expect("buffer ack");
        assert!(matches!(ack, StreamMessage::BufferAck { .. }));
    }

    #[test]
    fn repeated_temporary_failure_reports_cannot_process() {
        let vb = replica_vb();
        // One failure is burnt by the inline receive attempt, three more by
        // buffered-processing slices.
        let sink = Arc::new(FlakySink {
            vb: Arc::clone(&vb),
            failures_left: AtomicU32::new(4),
        });
        let stream = passive(&vb, sink, Limits::default());

        stream
            .message_received(marker(1, 1, MarkerFlags::MEMORY))
            .unwrap();
        stream.message_received(mutation(1)).unwrap();

        let (result, processed) = stream.process_buffered_messages();
        assert_eq!(result, ProcessResult::CannotProcess);
        assert_eq!(processed, 0);
        assert!(stream.is_active());
        assert_eq!(stream.buffer_items(), 1);

        // Two more pushbacks, then the apply path heals.
        assert_eq!(
            stream.process_buffered_messages().0,
            ProcessResult::CannotProcess
        );
        assert_eq!(
            stream.process_buffered_messages().0,
            ProcessResult::CannotProcess
        );
        let (result, _) = stream.process_buffered_messages();
        assert_eq!(result, ProcessResult::AllProcessed);
        assert_eq!(stream.last_seqno(), Seqno::new(1));
    }

    #[test]
    fn buffered_violation_kills_stream() {
        let vb = replica_vb();
        let sink = Arc::new(FlakySink {
            vb: Arc::clone(&vb),
            failures_left: AtomicU32::new(1),
        });
        let stream = passive(&vb, sink, Limits::default());

        stream
            .message_received(marker(1, 2, MarkerFlags::MEMORY))
            .unwrap();
        stream.message_received(mutation(1)).unwrap();
        // Outside the window, but deferred because of the backlog.
        stream.message_received(mutation(9)).unwrap();

        let (result, _) = stream.process_buffered_messages();
        assert_eq!(result, ProcessResult::CannotProcess);
        assert_eq!(stream.state(), StreamState::Dead);
        assert_eq!(stream.buffer_items(), 0);
    }

    #[test]
    fn buffer_overflow_is_reported() {
        let vb = replica_vb();
        let sink = Arc::new(FlakySink {
            vb: Arc::clone(&vb),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let limits = Limits {
            stream_buffer_max_items: 2,
            ..Limits::default()
        };
        let stream = passive(&vb, sink, limits);

        stream
            .message_received(marker(1, 10, MarkerFlags::MEMORY))
            .unwrap();
        stream.message_received(mutation(1)).unwrap();
        stream.message_received(mutation(2)).unwrap();
        let err = stream.message_received(mutation(3)).unwrap_err();
        assert!(matches!(err, ReceiveError::BufferFull { .. }));
    }

    #[test]
    fn set_vbucket_state_applies_and_responds() {
        let vb = replica_vb();
        let stream = passive(&vb, vb.clone() as Arc<dyn ItemSink>, Limits::default());

        stream
            .message_received(StreamMessage::SetVBucketState {
                opaque: Opaque::new(41),
                vbucket: Vbid::new(7),
                state: VBucketState::Active,
            })
            .unwrap();
        assert_eq!(vb.state(), VBucketState::Active);
        let response = stream.next().expect("state response");
        assert!(matches!(
            response,
            StreamMessage::SetVBucketStateResponse {
                status: STATUS_SUCCESS,
                ..
            }
        ));
    }

    #[test]
    fn stream_end_from_producer_goes_dead() {
        let vb = replica_vb();
        let stream = passive(&vb, vb.clone() as Arc<dyn ItemSink>, Limits::default());

        stream
            .message_received(StreamMessage::StreamEnd {
                opaque: Opaque::new(41),
                vbucket: Vbid::new(7),
                reason: EndReason::Ok,
            })
            .unwrap();
        assert_eq!(stream.state(), StreamState::Dead);
    }

    #[test]
    fn reconnect_on_dead_stream_is_a_noop() {
        let vb = replica_vb();
        let stream = passive(&vb, vb.clone() as Arc<dyn ItemSink>, Limits::default());

        stream.set_dead(EndReason::Disconnected);
        assert_eq!(stream.state(), StreamState::Dead);

        stream.reconnect_stream(Opaque::new(9), Seqno::new(74));
        assert_eq!(stream.state(), StreamState::Dead);
        assert_eq!(stream.ident().opaque(), Opaque::new(41));
        // No stream request was enqueued; a dead stream only drains.
        assert!(stream.next().is_none());
    }

    #[test]
    fn rollback_status_at_accept_kills_stream() {
        let vb = replica_vb();
        let stream = PassiveStream::new(
            "conn-2",
            StreamFlags::NONE,
            Opaque::new(41),
            Arc::clone(&vb),
            vb.clone() as Arc<dyn ItemSink>,
            Arc::new(NullNotifier),
            Limits::default(),
            Seqno::new(50),
            Seqno::MAX,
            VbUuid::new(0xbeef),
            Seqno::new(50),
            Seqno::new(50),
        )
        .expect("valid stream");
        assert!(matches!(
            stream.next(),
            Some(StreamMessage::StreamRequest { .. })
        ));

        stream.accept_stream(STATUS_ROLLBACK, Opaque::new(41));
        assert_eq!(stream.state(), StreamState::Dead);
        let response = stream.next().expect("add stream response");
        assert!(matches!(
            response,
            StreamMessage::AddStreamResponse {
                status: STATUS_ROLLBACK,
                ..
            }
        ));
    }

    #[test]
    fn reconnect_resets_identity_and_rerequests() {
        let vb = replica_vb();
        let sink = Arc::new(FlakySink {
            vb: Arc::clone(&vb),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let stream = passive(&vb, sink, Limits::default());

        stream
            .message_received(marker(1, 90, MarkerFlags::MEMORY))
            .unwrap();
        stream.message_received(mutation(74)).unwrap();
        assert_eq!(stream.buffer_items(), 1);

        stream.reconnect_stream(Opaque::new(9), Seqno::new(74));
        assert_eq!(stream.state(), StreamState::Pending);
        assert_eq!(stream.buffer_items(), 0);
        assert_eq!(stream.ident().opaque(), Opaque::new(9));
        assert_eq!(stream.ident().start_seqno(), Seqno::new(74));

        let request = stream.next().expect("stream request");
        let StreamMessage::StreamRequest { opaque, start, .. } = request else {
            panic!("expected stream request");
        };
        assert_eq!(opaque, Opaque::new(9));
        assert_eq!(start, Seqno::new(74));

        stream.accept_stream(STATUS_SUCCESS, Opaque::new(9));
        assert_eq!(stream.state(), StreamState::Reading);
    }
}
