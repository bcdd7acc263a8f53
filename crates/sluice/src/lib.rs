//! Per-vbucket replication stream engine.
//!
//! For each (connection, vbucket) pair a stream object drives the
//! change-propagation protocol: [`stream::active::ActiveStream`] produces an
//! ordered, snapshot-framed message sequence by stitching disk backfills and
//! in-memory checkpoint cursors; [`stream::passive::PassiveStream`] validates
//! and applies the inbound sequence under back-pressure;
//! [`stream::notifier::NotifierStream`] fires once a target seqno exists.
//!
//! Collaborators are seams, not implementations: backfill sources, apply
//! sinks and connection wake-ups are traits the embedding server provides.

pub mod backfill;
pub mod checkpoint;
pub mod notify;
pub mod stats;
pub mod stream;
pub mod vbucket;

pub use backfill::{
    BackfillBudget, BackfillError, BackfillManager, BackfillSource, BackfillSourceKind,
    DiskSnapshot, RunOutcome,
};
pub use checkpoint::CheckpointManager;
pub use notify::{ChannelNotifier, NullNotifier, StreamNotifier};
pub use stats::{StatMap, StatSink};
pub use stream::active::ActiveStream;
pub use stream::notifier::NotifierStream;
pub use stream::passive::{PassiveStream, ProcessResult, ReceiveError};
pub use stream::{Stream, StreamIdent, StreamRequestError, StreamState};
pub use vbucket::{ApplyError, FailoverEntry, FailoverTable, ItemSink, VBucket};
