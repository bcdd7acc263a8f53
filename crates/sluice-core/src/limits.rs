//! Normative stream-engine limits.
//!
//! Values are explicit about their units. Every back-pressure and batching
//! decision in the engine reads from here; embedders override via serde.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Per-stream cap on the outbound ready queue; exceeding it kills the
    /// stream as too slow.
    pub ready_queue_max_bytes: usize,
    /// Producer-wide budget for backfill items held pending dispatch.
    pub backfill_budget_bytes: usize,
    /// Item cap for one memory-phase run pulled from the checkpoint cursor.
    pub checkpoint_batch_items: usize,
    /// Item cap per checkpoint before the producer seals it and opens a
    /// new one.
    pub checkpoint_max_items: usize,
    /// Byte cap for the passive stream's inbound buffer.
    pub stream_buffer_max_bytes: usize,
    /// Item cap for the passive stream's inbound buffer.
    pub stream_buffer_max_items: usize,
    /// Bytes drained per `process_buffered_messages` call before yielding.
    pub processor_batch_bytes: usize,
    /// Processed bytes accumulated before the consumer emits a buffer ack.
    pub buffer_ack_threshold_bytes: usize,
    /// Ceiling on the whole takeover handoff, milliseconds.
    pub takeover_max_time_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            ready_queue_max_bytes: 50 * 1024 * 1024,
            backfill_budget_bytes: 20 * 1024 * 1024,
            checkpoint_batch_items: 500,
            checkpoint_max_items: 10_000,
            stream_buffer_max_bytes: 10 * 1024 * 1024,
            stream_buffer_max_items: 50_000,
            processor_batch_bytes: 512 * 1024,
            buffer_ack_threshold_bytes: 1024 * 1024,
            takeover_max_time_ms: 60_000,
        }
    }
}
