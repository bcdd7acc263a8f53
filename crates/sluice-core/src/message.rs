//! Wire messages exchanged on a replication stream.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flags::{MarkerFlags, StreamFlags};
use crate::item::Item;
use crate::seqno::{Opaque, Seqno, VbUuid, Vbid};

/// Response status carried by control responses; zero is success.
pub const STATUS_SUCCESS: u16 = 0;

/// Producer refusal of a stream request: the quoted resume point is not
/// reachable under the current failover lineage and the peer must roll
/// back first.
pub const STATUS_ROLLBACK: u16 = 0x23;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotType {
    #[default]
    None,
    Disk,
    Memory,
}

impl SnapshotType {
    pub const fn as_str(self) -> &'static str {
        match self {
            SnapshotType::None => "none",
            SnapshotType::Disk => "disk",
            SnapshotType::Memory => "memory",
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("marker flags {got:#x} do not name exactly one snapshot type")]
pub struct UnknownSnapshotType {
    pub got: u32,
}

impl MarkerFlags {
    pub fn for_type(ty: SnapshotType) -> Result<MarkerFlags, UnknownSnapshotType> {
        match ty {
            SnapshotType::Memory => Ok(MarkerFlags::MEMORY),
            SnapshotType::Disk => Ok(MarkerFlags::DISK),
            SnapshotType::None => Err(UnknownSnapshotType { got: 0 }),
        }
    }

    pub fn snapshot_type(self) -> Result<SnapshotType, UnknownSnapshotType> {
        let memory = self.contains(MarkerFlags::MEMORY);
        let disk = self.contains(MarkerFlags::DISK);
        match (memory, disk) {
            (true, false) => Ok(SnapshotType::Memory),
            (false, true) => Ok(SnapshotType::Disk),
            _ => Err(UnknownSnapshotType { got: self.bits() }),
        }
    }

    pub fn requires_ack(self) -> bool {
        self.contains(MarkerFlags::ACK)
    }
}

/// Why a stream ended, as reported to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndReason {
    /// All requested items were streamed.
    Ok,
    /// The stream was closed early by request or protocol error.
    Closed,
    /// The vbucket moved out of the streaming state.
    StateChanged,
    /// The owning connection went away.
    Disconnected,
    /// The stream could not keep up and was cut off.
    Slow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("unknown end-reason wire code {got}")]
pub struct UnknownEndReason {
    pub got: u32,
}

impl EndReason {
    pub const fn wire_code(self) -> u32 {
        match self {
            EndReason::Ok => 0,
            EndReason::Closed => 1,
            EndReason::StateChanged => 2,
            EndReason::Disconnected => 3,
            EndReason::Slow => 4,
        }
    }

    pub fn from_wire_code(code: u32) -> Result<Self, UnknownEndReason> {
        match code {
            0 => Ok(EndReason::Ok),
            1 => Ok(EndReason::Closed),
            2 => Ok(EndReason::StateChanged),
            3 => Ok(EndReason::Disconnected),
            4 => Ok(EndReason::Slow),
            got => Err(UnknownEndReason { got }),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EndReason::Ok => "ok",
            EndReason::Closed => "closed",
            EndReason::StateChanged => "state changed",
            EndReason::Disconnected => "disconnected",
            EndReason::Slow => "too slow",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vbucket replication state, as carried by takeover handoff messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("unknown vbucket-state wire code {got}")]
pub struct UnknownVBucketState {
    pub got: u8,
}

impl VBucketState {
    pub const fn wire_code(self) -> u8 {
        match self {
            VBucketState::Active => 1,
            VBucketState::Replica => 2,
            VBucketState::Pending => 3,
            VBucketState::Dead => 4,
        }
    }

    pub fn from_wire_code(code: u8) -> Result<Self, UnknownVBucketState> {
        match code {
            1 => Ok(VBucketState::Active),
            2 => Ok(VBucketState::Replica),
            3 => Ok(VBucketState::Pending),
            4 => Ok(VBucketState::Dead),
            got => Err(UnknownVBucketState { got }),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Wire-header footprints per message type, charged on top of key/value
// payloads for queue accounting.
const MARKER_BASE: usize = 44;
const MUTATION_BASE: usize = 55;
const DELETION_BASE: usize = 42;
const EXPIRATION_BASE: usize = 42;
const SET_STATE_BASE: usize = 25;
const STREAM_END_BASE: usize = 28;
const BUFFER_ACK_BASE: usize = 28;
const MARKER_ACK_BASE: usize = 28;
const SET_STATE_RESPONSE_BASE: usize = 28;
const ADD_STREAM_RESPONSE_BASE: usize = 32;
const STREAM_REQUEST_BASE: usize = 72;

/// A single message on a replication stream, in either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    SnapshotMarker {
        opaque: Opaque,
        vbucket: Vbid,
        start: Seqno,
        end: Seqno,
        flags: MarkerFlags,
    },
    Mutation {
        opaque: Opaque,
        item: Item,
    },
    Deletion {
        opaque: Opaque,
        item: Item,
    },
    Expiration {
        opaque: Opaque,
        item: Item,
    },
    SetVBucketState {
        opaque: Opaque,
        vbucket: Vbid,
        state: VBucketState,
    },
    StreamEnd {
        opaque: Opaque,
        vbucket: Vbid,
        reason: EndReason,
    },
    BufferAck {
        opaque: Opaque,
        vbucket: Vbid,
        bytes: u32,
    },
    SnapshotMarkerAck {
        opaque: Opaque,
        vbucket: Vbid,
        status: u16,
    },
    SetVBucketStateResponse {
        opaque: Opaque,
        vbucket: Vbid,
        status: u16,
    },
    AddStreamResponse {
        opaque: Opaque,
        add_opaque: Opaque,
        status: u16,
    },
    StreamRequest {
        opaque: Opaque,
        vbucket: Vbid,
        flags: StreamFlags,
        start: Seqno,
        end: Seqno,
        vb_uuid: VbUuid,
        snap_start: Seqno,
        snap_end: Seqno,
    },
}

impl StreamMessage {
    /// Build the item-bearing message matching `item.op()`.
    pub fn from_item(opaque: Opaque, item: Item, key_only: bool) -> StreamMessage {
        let item = if key_only { item.without_value() } else { item };
        match item.op() {
            crate::item::ItemOp::Mutation => StreamMessage::Mutation { opaque, item },
            crate::item::ItemOp::Deletion => StreamMessage::Deletion { opaque, item },
            crate::item::ItemOp::Expiration => StreamMessage::Expiration { opaque, item },
        }
    }

    pub fn opaque(&self) -> Opaque {
        match self {
            StreamMessage::SnapshotMarker { opaque, .. }
            | StreamMessage::Mutation { opaque, .. }
            | StreamMessage::Deletion { opaque, .. }
            | StreamMessage::Expiration { opaque, .. }
            | StreamMessage::SetVBucketState { opaque, .. }
            | StreamMessage::StreamEnd { opaque, .. }
            | StreamMessage::BufferAck { opaque, .. }
            | StreamMessage::SnapshotMarkerAck { opaque, .. }
            | StreamMessage::SetVBucketStateResponse { opaque, .. }
            | StreamMessage::AddStreamResponse { opaque, .. }
            | StreamMessage::StreamRequest { opaque, .. } => *opaque,
        }
    }

    pub fn vbucket(&self) -> Option<Vbid> {
        match self {
            StreamMessage::SnapshotMarker { vbucket, .. }
            | StreamMessage::SetVBucketState { vbucket, .. }
            | StreamMessage::StreamEnd { vbucket, .. }
            | StreamMessage::BufferAck { vbucket, .. }
            | StreamMessage::SnapshotMarkerAck { vbucket, .. }
            | StreamMessage::SetVBucketStateResponse { vbucket, .. }
            | StreamMessage::StreamRequest { vbucket, .. } => Some(*vbucket),
            StreamMessage::Mutation { item, .. }
            | StreamMessage::Deletion { item, .. }
            | StreamMessage::Expiration { item, .. } => Some(item.vbucket()),
            StreamMessage::AddStreamResponse { .. } => None,
        }
    }

    /// The seqno this message advances the stream to, for item-bearing
    /// messages.
    pub fn seqno(&self) -> Option<Seqno> {
        match self {
            StreamMessage::Mutation { item, .. }
            | StreamMessage::Deletion { item, .. }
            | StreamMessage::Expiration { item, .. } => Some(item.seqno()),
            _ => None,
        }
    }

    pub fn is_item(&self) -> bool {
        self.seqno().is_some()
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            StreamMessage::SnapshotMarker { .. } => "snapshot marker",
            StreamMessage::Mutation { .. } => "mutation",
            StreamMessage::Deletion { .. } => "deletion",
            StreamMessage::Expiration { .. } => "expiration",
            StreamMessage::SetVBucketState { .. } => "set vbucket state",
            StreamMessage::StreamEnd { .. } => "stream end",
            StreamMessage::BufferAck { .. } => "buffer ack",
            StreamMessage::SnapshotMarkerAck { .. } => "snapshot marker ack",
            StreamMessage::SetVBucketStateResponse { .. } => "set vbucket state response",
            StreamMessage::AddStreamResponse { .. } => "add stream response",
            StreamMessage::StreamRequest { .. } => "stream request",
        }
    }

    /// Serialized size used for ready-queue and buffer accounting.
    pub fn size(&self) -> usize {
        match self {
            StreamMessage::SnapshotMarker { .. } => MARKER_BASE,
            StreamMessage::Mutation { item, .. } => {
                MUTATION_BASE + item.key().len() + item.value().len()
            }
            StreamMessage::Deletion { item, .. } => DELETION_BASE + item.key().len(),
            StreamMessage::Expiration { item, .. } => EXPIRATION_BASE + item.key().len(),
            StreamMessage::SetVBucketState { .. } => SET_STATE_BASE,
            StreamMessage::StreamEnd { .. } => STREAM_END_BASE,
            StreamMessage::BufferAck { .. } => BUFFER_ACK_BASE,
            StreamMessage::SnapshotMarkerAck { .. } => MARKER_ACK_BASE,
            StreamMessage::SetVBucketStateResponse { .. } => SET_STATE_RESPONSE_BASE,
            StreamMessage::AddStreamResponse { .. } => ADD_STREAM_RESPONSE_BASE,
            StreamMessage::StreamRequest { .. } => STREAM_REQUEST_BASE,
        }
    }
}
