//! Connection wake-up seam.
//!
//! A stream raises `items_ready` exactly once per empty-to-nonempty queue
//! transition and tells the owning connection through this trait. The
//! notifier must not call back into the stream; it is invoked outside the
//! stream's critical section.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use sluice_core::Vbid;

pub trait StreamNotifier: Send + Sync {
    fn schedule_notify(&self, vbucket: Vbid);
}

/// Notifier that discards wake-ups.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl StreamNotifier for NullNotifier {
    fn schedule_notify(&self, _vbucket: Vbid) {}
}

/// Notifier backed by an unbounded channel; the connection's writer drains
/// the receiver to learn which vbuckets have work.
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: Sender<Vbid>,
}

impl ChannelNotifier {
    pub fn unbounded() -> (Arc<Self>, Receiver<Vbid>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl StreamNotifier for ChannelNotifier {
    fn schedule_notify(&self, vbucket: Vbid) {
        // A dropped receiver just means the connection is gone.
        let _ = self.tx.send(vbucket);
    }
}
