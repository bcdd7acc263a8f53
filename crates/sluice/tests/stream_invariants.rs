//! Property checks over producer framing and consumer agreement.

mod common;

use std::sync::Arc;

use common::*;
use proptest::prelude::*;

use sluice::{BackfillManager, BackfillSource, ItemSink, NullNotifier, PassiveStream, Stream};
use sluice_core::{Limits, STATUS_SUCCESS, Seqno, StreamFlags, StreamMessage};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever mix of disk and memory serves the range, and however small
    /// the checkpoints and batches are:
    /// - every item falls inside the most recent marker's range,
    /// - item seqnos strictly increase,
    /// - the full range arrives exactly once,
    /// - and a replica applying the sequence agrees with the producer.
    #[test]
    fn framing_ordering_and_consumer_agreement(
        high in 1u64..100,
        chk_cap in 1usize..40,
        batch_cap in 1usize..40,
        trimmed in 0u64..100,
    ) {
        let limits = Limits {
            checkpoint_max_items: chk_cap,
            checkpoint_batch_items: batch_cap,
            ..Limits::default()
        };
        let vb = active_vb(&limits, high);
        let trimmed = trimmed.min(high);
        vb.checkpoints().trim_to(Seqno::new(trimmed));

        let manager = BackfillManager::new(&limits);
        let stream = open_active(
            &vb,
            StreamFlags::NONE,
            limits.clone(),
            &manager,
            Seqno::ZERO,
            Seqno::MAX,
        );
        let source: Arc<dyn BackfillSource> = VecDisk::with_mutations(1..=trimmed);
        stream.set_active(&manager, &source);
        let messages = run_to_quiescence(&manager, &stream);

        let mut window: Option<(u64, u64)> = None;
        let mut last_item = 0u64;
        for msg in &messages {
            match msg {
                StreamMessage::SnapshotMarker { start, end, .. } => {
                    prop_assert!(start.get() <= end.get());
                    window = Some((start.get(), end.get()));
                }
                msg if msg.is_item() => {
                    let seqno = msg.seqno().expect("item seqno").get();
                    prop_assert!(window.is_some(), "item emitted before any marker");
                    let (start, end) = window.expect("window");
                    prop_assert!(
                        start <= seqno && seqno <= end,
                        "seqno {} outside marker [{}..{}]",
                        seqno,
                        start,
                        end
                    );
                    prop_assert!(seqno > last_item, "seqno {} after {}", seqno, last_item);
                    last_item = seqno;
                }
                _ => {}
            }
        }
        prop_assert_eq!(item_seqnos(&messages), (1..=high).collect::<Vec<_>>());
        prop_assert_eq!(stream.last_read_seqno().get(), high);

        let replica = replica_vb(&limits);
        let passive = PassiveStream::new(
            "repl-conn",
            StreamFlags::NONE,
            OPAQUE,
            Arc::clone(&replica),
            Arc::clone(&replica) as Arc<dyn ItemSink>,
            Arc::new(NullNotifier),
            limits,
            Seqno::ZERO,
            Seqno::MAX,
            VB_UUID,
            Seqno::ZERO,
            Seqno::ZERO,
        )
        .expect("valid passive stream");
        let _ = passive.next();
        passive.accept_stream(STATUS_SUCCESS, OPAQUE);
        for msg in &messages {
            passive.message_received(msg.clone()).expect("clean apply");
        }
        prop_assert_eq!(passive.last_seqno(), stream.last_read_seqno());
        prop_assert_eq!(replica.high_seqno(), vb.high_seqno());
    }
}
