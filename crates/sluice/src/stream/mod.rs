//! Stream identity, state, and the shared ready-queue core.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use sluice_core::{EndReason, Opaque, Seqno, StreamFlags, StreamMessage, VbUuid, Vbid};

use crate::notify::StreamNotifier;
use crate::stats::StatSink;

pub mod active;
pub mod notifier;
pub mod passive;

/// Phase of a stream's life. Producers move Pending → Backfilling →
/// InMemory (→ TakeoverSend → TakeoverWait); consumers move Pending →
/// Reading. Dead is terminal for both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamState {
    Pending = 0,
    Backfilling = 1,
    InMemory = 2,
    TakeoverSend = 3,
    TakeoverWait = 4,
    Reading = 5,
    Dead = 6,
}

impl StreamState {
    pub const fn as_str(self) -> &'static str {
        match self {
            StreamState::Pending => "pending",
            StreamState::Backfilling => "backfilling",
            StreamState::InMemory => "in-memory",
            StreamState::TakeoverSend => "takeover-send",
            StreamState::TakeoverWait => "takeover-wait",
            StreamState::Reading => "reading",
            StreamState::Dead => "dead",
        }
    }

    fn from_u8(value: u8) -> StreamState {
        match value {
            0 => StreamState::Pending,
            1 => StreamState::Backfilling,
            2 => StreamState::InMemory,
            3 => StreamState::TakeoverSend,
            4 => StreamState::TakeoverWait,
            5 => StreamState::Reading,
            6 => StreamState::Dead,
            _ => unreachable!("stream state cell corrupt"),
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StreamRequestError {
    #[error("requested range invalid: start {start} after end {end}")]
    InvalidRange { start: Seqno, end: Seqno },
    #[error(
        "snapshot range invalid: start {start} not within or before snapshot \
         [{snap_start}..{snap_end}]"
    )]
    InvalidSnapshotRange {
        start: Seqno,
        snap_start: Seqno,
        snap_end: Seqno,
    },
    #[error("resume at {start} unreachable under the quoted lineage; roll back to {rollback_seqno}")]
    RollbackRequired {
        start: Seqno,
        rollback_seqno: Seqno,
    },
}

/// Stream identity fixed at open. `opaque` and the request range are only
/// rewritten by the passive reconnect path; they are atomics so stat
/// readers and message builders never take the stream lock.
#[derive(Debug)]
pub struct StreamIdent {
    name: String,
    flags: StreamFlags,
    opaque: AtomicU32,
    vbucket: Vbid,
    start_seqno: AtomicU64,
    end_seqno: AtomicU64,
    vb_uuid: VbUuid,
    snap_start_seqno: Seqno,
    snap_end_seqno: Seqno,
}

impl StreamIdent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        flags: StreamFlags,
        opaque: Opaque,
        vbucket: Vbid,
        start_seqno: Seqno,
        end_seqno: Seqno,
        vb_uuid: VbUuid,
        snap_start_seqno: Seqno,
        snap_end_seqno: Seqno,
    ) -> Result<Self, StreamRequestError> {
        if start_seqno > end_seqno {
            return Err(StreamRequestError::InvalidRange {
                start: start_seqno,
                end: end_seqno,
            });
        }
        if start_seqno > snap_start_seqno || snap_start_seqno > snap_end_seqno {
            return Err(StreamRequestError::InvalidSnapshotRange {
                start: start_seqno,
                snap_start: snap_start_seqno,
                snap_end: snap_end_seqno,
            });
        }
        Ok(Self {
            name: name.into(),
            flags,
            opaque: AtomicU32::new(opaque.get()),
            vbucket,
            start_seqno: AtomicU64::new(start_seqno.get()),
            end_seqno: AtomicU64::new(end_seqno.get()),
            vb_uuid,
            snap_start_seqno,
            snap_end_seqno,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn opaque(&self) -> Opaque {
        Opaque::new(self.opaque.load(Ordering::SeqCst))
    }

    pub fn vbucket(&self) -> Vbid {
        self.vbucket
    }

    pub fn start_seqno(&self) -> Seqno {
        Seqno::new(self.start_seqno.load(Ordering::SeqCst))
    }

    pub fn end_seqno(&self) -> Seqno {
        Seqno::new(self.end_seqno.load(Ordering::SeqCst))
    }

    pub fn vb_uuid(&self) -> VbUuid {
        self.vb_uuid
    }

    pub fn snap_start_seqno(&self) -> Seqno {
        self.snap_start_seqno
    }

    pub fn snap_end_seqno(&self) -> Seqno {
        self.snap_end_seqno
    }

    pub(crate) fn set_opaque(&self, opaque: Opaque) {
        self.opaque.store(opaque.get(), Ordering::SeqCst);
    }

    pub(crate) fn set_start_seqno(&self, seqno: Seqno) {
        self.start_seqno.store(seqno.get(), Ordering::SeqCst);
    }

    pub(crate) fn clamp_end_seqno(&self, cap: Seqno) {
        self.end_seqno.fetch_min(cap.get(), Ordering::SeqCst);
    }
}

pub(crate) struct CoreInner<X> {
    pub ready: VecDeque<StreamMessage>,
    pub ext: X,
}

/// State shared by every stream variant: identity, the state cell, the
/// ready queue and its gauges. The ready queue and any per-variant
/// extension state are mutated only under the stream lock; the gauges are
/// lock-free so stat readers never contend with the data path.
pub(crate) struct StreamCore<X> {
    ident: StreamIdent,
    state: AtomicState,
    items_ready: AtomicBool,
    ready_bytes: AtomicU64,
    inner: Mutex<CoreInner<X>>,
}

impl<X> StreamCore<X> {
    pub fn new(ident: StreamIdent, state: StreamState, ext: X) -> Self {
        Self {
            ident,
            state: AtomicState::new(state),
            items_ready: AtomicBool::new(false),
            ready_bytes: AtomicU64::new(0),
            inner: Mutex::new(CoreInner {
                ready: VecDeque::new(),
                ext,
            }),
        }
    }

    pub fn ident(&self) -> &StreamIdent {
        &self.ident
    }

    pub fn state(&self) -> StreamState {
        self.state.load()
    }

    pub fn lock(&self) -> MutexGuard<'_, CoreInner<X>> {
        self.inner.lock().expect("stream lock poisoned")
    }

    /// Record a state change; the caller holds the stream lock and has
    /// already validated the edge.
    pub fn record_transition(&self, _inner: &mut CoreInner<X>, to: StreamState) {
        let from = self.state.load();
        tracing::debug!(
            vb = %self.ident.vbucket(),
            stream = self.ident.name(),
            %from,
            %to,
            "stream transition"
        );
        self.state.store(to);
    }

    pub fn push_ready(&self, inner: &mut CoreInner<X>, msg: StreamMessage) {
        self.ready_bytes
            .fetch_add(msg.size() as u64, Ordering::Relaxed);
        inner.ready.push_back(msg);
    }

    pub fn pop_ready(&self, inner: &mut CoreInner<X>) -> Option<StreamMessage> {
        let msg = inner.ready.pop_front()?;
        self.ready_bytes
            .fetch_sub(msg.size() as u64, Ordering::Relaxed);
        Some(msg)
    }

    /// Drop every queued message, returning the bytes freed.
    pub fn clear_ready(&self, inner: &mut CoreInner<X>) -> u64 {
        let freed: u64 = inner.ready.iter().map(|msg| msg.size() as u64).sum();
        inner.ready.clear();
        self.ready_bytes.fetch_sub(freed, Ordering::Relaxed);
        freed
    }

    pub fn ready_bytes(&self) -> u64 {
        self.ready_bytes.load(Ordering::Relaxed)
    }

    pub fn items_ready(&self) -> bool {
        self.items_ready.load(Ordering::SeqCst)
    }

    /// Raise the edge trigger; true exactly once per empty-to-nonempty
    /// transition. Called outside the stream lock.
    pub fn edge_raise(&self) -> bool {
        self.items_ready
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn edge_clear(&self) {
        self.items_ready.store(false, Ordering::SeqCst);
    }

    /// Wake the connection if this is the first pending item since it last
    /// drained us.
    pub fn signal_ready(&self, notifier: &dyn StreamNotifier) {
        if self.edge_raise() {
            notifier.schedule_notify(self.ident.vbucket());
        }
    }

    /// Identity and queue stats common to every variant.
    pub fn add_base_stats(&self, sink: &mut dyn StatSink) {
        let ident = &self.ident;
        let prefix = format!("{}:stream_{}", ident.name(), ident.vbucket().get());
        sink.stat(&format!("{prefix}_flags"), ident.flags().to_string());
        sink.stat(&format!("{prefix}_opaque"), ident.opaque().to_string());
        sink.stat(
            &format!("{prefix}_start_seqno"),
            ident.start_seqno().get().to_string(),
        );
        sink.stat(
            &format!("{prefix}_end_seqno"),
            ident.end_seqno().get().to_string(),
        );
        sink.stat(&format!("{prefix}_vb_uuid"), ident.vb_uuid().to_string());
        sink.stat(
            &format!("{prefix}_snap_start_seqno"),
            ident.snap_start_seqno().get().to_string(),
        );
        sink.stat(
            &format!("{prefix}_snap_end_seqno"),
            ident.snap_end_seqno().get().to_string(),
        );
        sink.stat(&format!("{prefix}_state"), self.state().to_string());
        sink.stat(
            &format!("{prefix}_items_ready"),
            self.items_ready().to_string(),
        );
        sink.stat(
            &format!("{prefix}_ready_queue_bytes"),
            self.ready_bytes().to_string(),
        );
    }
}

/// Operations every stream variant provides to its owning connection.
pub trait Stream: Send + Sync {
    fn ident(&self) -> &StreamIdent;

    fn state(&self) -> StreamState;

    fn is_active(&self) -> bool {
        self.state() != StreamState::Dead
    }

    /// The next outbound message, or `None` when nothing is ready; the
    /// transport must then await the items-ready edge.
    fn next(&self) -> Option<StreamMessage>;

    /// Transition to Dead, reporting the bytes the discarded queue held.
    /// Idempotent: later callers observe Dead and free nothing.
    fn set_dead(&self, reason: EndReason) -> u64;

    /// Hint that a new mutation exists at `seqno`.
    fn notify_seqno_available(&self, seqno: Seqno) {
        let _ = seqno;
    }

    /// Drop all queued messages.
    fn clear(&self);

    fn add_stats(&self, sink: &mut dyn StatSink);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use sluice_core::EndReason;

    fn ident() -> StreamIdent {
        StreamIdent::new(
            "conn-0",
            StreamFlags::NONE,
            Opaque::new(7),
            Vbid::new(3),
            Seqno::ZERO,
            Seqno::MAX,
            VbUuid::new(0xab),
            Seqno::ZERO,
            Seqno::ZERO,
        )
        .expect("valid ident")
    }

    fn end_msg() -> StreamMessage {
        StreamMessage::StreamEnd {
            opaque: Opaque::new(7),
            vbucket: Vbid::new(3),
            reason: EndReason::Ok,
        }
    }

    #[test]
    fn ident_rejects_bad_ranges() {
        let err = StreamIdent::new(
            "conn-0",
            StreamFlags::NONE,
            Opaque::new(7),
            Vbid::new(3),
            Seqno::new(10),
            Seqno::new(5),
            VbUuid::new(0xab),
            Seqno::new(10),
            Seqno::new(10),
        )
        .unwrap_err();
        assert!(matches!(err, StreamRequestError::InvalidRange { .. }));

        let err = StreamIdent::new(
            "conn-0",
            StreamFlags::NONE,
            Opaque::new(7),
            Vbid::new(3),
            Seqno::new(10),
            Seqno::MAX,
            VbUuid::new(0xab),
            Seqno::new(4),
            Seqno::new(12),
        )
        .unwrap_err();
        assert!(matches!(err, StreamRequestError::InvalidSnapshotRange { .. }));
    }

    #[test]
    fn ready_queue_bytes_track_push_pop_clear() {
        let core = StreamCore::new(ident(), StreamState::Pending, ());
        let size = end_msg().size() as u64;
        {
            let mut inner = core.lock();
            core.push_ready(&mut inner, end_msg());
            core.push_ready(&mut inner, end_msg());
        }
        assert_eq!(core.ready_bytes(), 2 * size);
        {
            let mut inner = core.lock();
            assert!(core.pop_ready(&mut inner).is_some());
        }
        assert_eq!(core.ready_bytes(), size);
        {
            let mut inner = core.lock();
            assert_eq!(core.clear_ready(&mut inner), size);
        }
        assert_eq!(core.ready_bytes(), 0);
    }

    #[test]
    fn edge_trigger_fires_once_per_drain() {
        let core = StreamCore::new(ident(), StreamState::Pending, ());
        let (notifier, rx) = ChannelNotifier::unbounded();

        core.signal_ready(notifier.as_ref());
        core.signal_ready(notifier.as_ref());
        assert_eq!(rx.try_iter().count(), 1);

        core.edge_clear();
        core.signal_ready(notifier.as_ref());
        assert_eq!(rx.try_iter().count(), 1);
    }
}
