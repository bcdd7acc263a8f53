//! Notifier stream: no data, just a wake-up once a target seqno exists.

use std::sync::Arc;

use sluice_core::{EndReason, Opaque, Seqno, StreamFlags, StreamMessage, VbUuid, Vbid};

use crate::notify::StreamNotifier;
use crate::stats::StatSink;
use crate::stream::{Stream, StreamCore, StreamIdent, StreamRequestError, StreamState};

pub struct NotifierStream {
    core: StreamCore<()>,
    notifier: Arc<dyn StreamNotifier>,
}

impl NotifierStream {
    pub fn new(
        name: impl Into<String>,
        flags: StreamFlags,
        opaque: Opaque,
        vbucket: Vbid,
        end_seqno: Seqno,
        vb_uuid: VbUuid,
        notifier: Arc<dyn StreamNotifier>,
    ) -> Result<Arc<Self>, StreamRequestError> {
        let ident = StreamIdent::new(
            name,
            flags,
            opaque,
            vbucket,
            Seqno::ZERO,
            end_seqno,
            vb_uuid,
            Seqno::ZERO,
            Seqno::ZERO,
        )?;
        Ok(Arc::new(Self {
            core: StreamCore::new(ident, StreamState::Pending, ()),
            notifier,
        }))
    }
}

impl Stream for NotifierStream {
    fn ident(&self) -> &StreamIdent {
        self.core.ident()
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

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

    fn set_dead(&self, _reason: EndReason) -> u64 {
        let mut inner = self.core.lock();
        if self.core.state() == StreamState::Dead {
            return 0;
        }
        let freed = self.core.clear_ready(&mut inner);
        self.core.record_transition(&mut inner, StreamState::Dead);
        freed
    }

    fn notify_seqno_available(&self, seqno: Seqno) {
        {
            let mut inner = self.core.lock();
            if self.core.state() == StreamState::Dead
                || seqno < self.core.ident().end_seqno()
            {
                return;
            }
            let ident = self.core.ident();
            tracing::debug!(
                vb = %ident.vbucket(),
                %seqno,
                target = %ident.end_seqno(),
                "notifier target reached"
            );
            let msg = StreamMessage::StreamEnd {
                opaque: ident.opaque(),
                vbucket: ident.vbucket(),
                reason: EndReason::Ok,
            };
            self.core.push_ready(&mut inner, msg);
            self.core.record_transition(&mut inner, StreamState::Dead);
        }
        self.core.signal_ready(self.notifier.as_ref());
    }

    fn clear(&self) {
        let mut inner = self.core.lock();
        self.core.clear_ready(&mut inner);
    }

    fn add_stats(&self, sink: &mut dyn StatSink) {
        self.core.add_base_stats(sink);
    }
}
