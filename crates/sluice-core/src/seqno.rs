//! Sequence-number and identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-vbucket sequence number. Every mutation in a vbucket is assigned the
/// next value; `Seqno::MAX` is the wire sentinel for "until the stream is
/// closed".
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Seqno(u64);

impl Seqno {
    pub const ZERO: Seqno = Seqno(0);
    pub const MAX: Seqno = Seqno(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Seqno {
        Seqno(self.0.checked_add(1).expect("seqno overflow computing next"))
    }

    pub const fn is_max(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seqno({})", self.0)
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "max")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for Seqno {
    fn from(value: u64) -> Seqno {
        Seqno(value)
    }
}

impl From<Seqno> for u64 {
    fn from(value: Seqno) -> u64 {
        value.0
    }
}

/// Vbucket id: the 16-bit logical shard a stream replicates.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Vbid(u16);

impl Vbid {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vbid({})", self.0)
    }
}

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb:{}", self.0)
    }
}

/// Failover-epoch identifier. A new uuid is minted whenever a vbucket's
/// lineage forks; peers quote the uuid they last synchronized against.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VbUuid(u64);

impl VbUuid {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for VbUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VbUuid({:#x})", self.0)
    }
}

impl fmt::Display for VbUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Connection-scoped correlator echoed in every message of a stream.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Opaque(u32);

impl Opaque {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({})", self.0)
    }
}

impl fmt::Display for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_helpers_work() {
        let seqno = Seqno::ZERO;
        assert_eq!(seqno.next().get(), 1);
        assert_eq!(Seqno::new(41).next(), Seqno::new(42));
        assert!(Seqno::MAX.is_max());
        assert_eq!(Seqno::MAX.to_string(), "max");
        assert_eq!(Seqno::new(7).to_string(), "7");
    }

    #[test]
    fn seqno_serde_is_transparent() {
        let raw = serde_json::to_string(&Seqno::new(9)).unwrap();
        assert_eq!(raw, "9");
        let back: Seqno = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, Seqno::new(9));
    }

    #[test]
    fn vbid_displays_with_prefix() {
        assert_eq!(Vbid::new(512).to_string(), "vb:512");
    }
}
