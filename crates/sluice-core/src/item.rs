//! Mutation records crossing the checkpoint, backfill and apply seams.

use std::fmt;

use bytes::Bytes;

use crate::seqno::{Seqno, Vbid};

/// Fixed bookkeeping charged per item on top of key and value bytes.
pub const ITEM_OVERHEAD: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemOp {
    Mutation,
    Deletion,
    Expiration,
}

impl ItemOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            ItemOp::Mutation => "mutation",
            ItemOp::Deletion => "deletion",
            ItemOp::Expiration => "expiration",
        }
    }
}

impl fmt::Display for ItemOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change to a key, stamped with the vbucket seqno that ordered it.
///
/// Deletions and expirations carry an empty value; `expiry` is seconds since
/// the epoch, zero meaning no expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    key: Bytes,
    value: Bytes,
    vbucket: Vbid,
    op: ItemOp,
    seqno: Seqno,
    expiry: u32,
}

impl Item {
    pub fn mutation(vbucket: Vbid, seqno: Seqno, key: Bytes, value: Bytes, expiry: u32) -> Self {
        Self {
            key,
            value,
            vbucket,
            op: ItemOp::Mutation,
            seqno,
            expiry,
        }
    }

    pub fn deletion(vbucket: Vbid, seqno: Seqno, key: Bytes) -> Self {
        Self {
            key,
            value: Bytes::new(),
            vbucket,
            op: ItemOp::Deletion,
            seqno,
            expiry: 0,
        }
    }

    pub fn expiration(vbucket: Vbid, seqno: Seqno, key: Bytes) -> Self {
        Self {
            key,
            value: Bytes::new(),
            vbucket,
            op: ItemOp::Expiration,
            seqno,
            expiry: 0,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn vbucket(&self) -> Vbid {
        self.vbucket
    }

    pub fn op(&self) -> ItemOp {
        self.op
    }

    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    /// Memory footprint used for queue and buffer accounting.
    pub fn size(&self) -> usize {
        ITEM_OVERHEAD + self.key.len() + self.value.len()
    }

    /// Copy of this item with the value stripped, for key-only streams.
    pub fn without_value(&self) -> Item {
        Item {
            key: self.key.clone(),
            value: Bytes::new(),
            vbucket: self.vbucket,
            op: self.op,
            seqno: self.seqno,
            expiry: self.expiry,
        }
    }
}
