//! Stream open-flags and snapshot marker flags.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("unknown flag bits {got:#x} (known mask {known:#x})")]
pub struct UnknownFlags {
    pub got: u32,
    pub known: u32,
}

/// Flags negotiated at stream open.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const NONE: StreamFlags = StreamFlags(0);
    /// The stream also transfers vbucket ownership state.
    pub const TAKEOVER: StreamFlags = StreamFlags(0x01);
    /// Only stream what is already on disk, then end.
    pub const DISK_ONLY: StreamFlags = StreamFlags(0x02);
    /// Cap the stream at the high-seqno observed at open.
    pub const LATEST: StreamFlags = StreamFlags(0x04);
    /// Key-only payloads on the wire.
    pub const NO_VALUE: StreamFlags = StreamFlags(0x08);

    const KNOWN: u32 = 0x0f;

    pub fn from_bits(bits: u32) -> Result<Self, UnknownFlags> {
        if bits & !Self::KNOWN != 0 {
            return Err(UnknownFlags {
                got: bits,
                known: Self::KNOWN,
            });
        }
        Ok(Self(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 | other.0)
    }

    pub const fn takeover(self) -> bool {
        self.contains(Self::TAKEOVER)
    }

    pub const fn disk_only(self) -> bool {
        self.contains(Self::DISK_ONLY)
    }

    pub const fn latest(self) -> bool {
        self.contains(Self::LATEST)
    }

    pub const fn no_value(self) -> bool {
        self.contains(Self::NO_VALUE)
    }
}

impl fmt::Debug for StreamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamFlags({:#x})", self.0)
    }
}

impl fmt::Display for StreamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Flags carried by a snapshot marker.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerFlags(u32);

impl MarkerFlags {
    pub const MEMORY: MarkerFlags = MarkerFlags(0x01);
    pub const DISK: MarkerFlags = MarkerFlags(0x02);
    /// The snapshot maps to a checkpoint boundary on the producer.
    pub const CHK: MarkerFlags = MarkerFlags(0x04);
    /// The consumer must acknowledge snapshot completion.
    pub const ACK: MarkerFlags = MarkerFlags(0x08);

    const KNOWN: u32 = 0x0f;

    pub fn from_bits(bits: u32) -> Result<Self, UnknownFlags> {
        if bits & !Self::KNOWN != 0 {
            return Err(UnknownFlags {
                got: bits,
                known: Self::KNOWN,
            });
        }
        Ok(Self(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: MarkerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: MarkerFlags) -> MarkerFlags {
        MarkerFlags(self.0 | other.0)
    }
}

impl fmt::Debug for MarkerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MarkerFlags({:#x})", self.0)
    }
}
