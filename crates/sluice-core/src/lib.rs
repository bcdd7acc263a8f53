//! Protocol vocabulary shared by the sluice stream engine.
//!
//! Everything in this crate is pure data: identifiers, wire messages, the
//! CBOR codec and the normative limits. Engine state (streams, vbuckets,
//! checkpoints) lives in the `sluice` crate.

pub mod codec;
pub mod flags;
pub mod item;
pub mod limits;
pub mod message;
pub mod seqno;

pub use codec::{WireDecodeError, WireEncodeError, decode_message, encode_message};
pub use flags::{MarkerFlags, StreamFlags, UnknownFlags};
pub use item::{Item, ItemOp};
pub use limits::Limits;
pub use message::{
    EndReason, STATUS_ROLLBACK, STATUS_SUCCESS, SnapshotType, StreamMessage, UnknownEndReason,
    UnknownSnapshotType, UnknownVBucketState, VBucketState,
};
pub use seqno::{Opaque, Seqno, VbUuid, Vbid};
