//! Node identity
//! -------------
//! `NodeId` is the compact stable name of a tree node: a 48-bit handle index
//! and a 16-bit ABA tag packed into one `u64`. The handle index locates the
//! object-table slot; the tag distinguishes successive lives of the same
//! slot so a stale reference can never resolve to a newer node.
//!
//! Layout: `[63:16]` handle index, `[15:0]` tag. Tag 0 is reserved to catch
//! uninitialized values; the all-ones raw value is the invalid sentinel. In
//! sharded deployments bits `[47:42]` of the handle index carry the shard id
//! (see [`ShardBits`]).

use serde::{Deserialize, Serialize};

/// Opaque 64-bit node identifier. Trivially copyable, exactly 8 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(u64);

const _: () = assert!(std::mem::size_of::<NodeId>() == 8);
const _: () = assert!(std::mem::align_of::<NodeId>() == 8);

impl NodeId {
    pub const INVALID_RAW: u64 = u64::MAX;

    #[inline]
    pub const fn from_raw(v: u64) -> Self {
        NodeId(v)
    }

    #[inline]
    pub const fn invalid() -> Self {
        NodeId(Self::INVALID_RAW)
    }

    /// Build from handle index and tag. Tag 0 is silently promoted to 1;
    /// no live id ever carries tag 0.
    #[inline]
    pub const fn from_parts(handle_idx: u64, tag: u16) -> Self {
        let tag = if tag == 0 { 1 } else { tag };
        NodeId((handle_idx << 16) | tag as u64)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn handle_index(self) -> u64 {
        self.0 >> 16
    }

    /// Low 16 bits: the ABA tag. Bumped each time the handle is reused so
    /// references from a prior life fail validation.
    #[inline]
    pub const fn tag(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID_RAW
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "NodeId({}#{})", self.handle_index(), self.tag())
        } else {
            write!(f, "NodeId(invalid)")
        }
    }
}

/// Kind tag distinguishing what a handle points at. Readers use it to pick
/// the right deserializer; the core only uses it to tell free slots
/// (`Invalid`) from everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    /// Free OT slot, never visible to readers.
    Invalid = 0,
    Internal = 1,
    Leaf = 2,
    /// Child vector for supernodes.
    ChildVec = 3,
    ValueVec = 4,
    DataRecord = 5,
    /// Leaf-record MVCC only; never an OT slot state.
    Tombstone = 255,
}

impl NodeKind {
    #[inline]
    pub fn from_u8(v: u8) -> Option<NodeKind> {
        match v {
            0 => Some(NodeKind::Invalid),
            1 => Some(NodeKind::Internal),
            2 => Some(NodeKind::Leaf),
            3 => Some(NodeKind::ChildVec),
            4 => Some(NodeKind::ValueVec),
            5 => Some(NodeKind::DataRecord),
            255 => Some(NodeKind::Tombstone),
            _ => None,
        }
    }
}

/// Handle layout for sharded deployments.
///
/// The 48-bit handle index is carved as `[47:42]` shard id (up to 64
/// shards) and `[41:0]` local handle. Both the plain and the sharded object
/// table normalize through these helpers so a global handle routes without
/// extra locking.
pub struct ShardBits;

impl ShardBits {
    pub const TAG_BITS: u32 = 16;
    pub const SHARD_BITS: u32 = 6;
    pub const HANDLE_BITS: u32 = 48;
    pub const LOCAL_BITS: u32 = Self::HANDLE_BITS - Self::SHARD_BITS; // 42
    pub const SHARD_MASK: u64 = (1 << Self::SHARD_BITS) - 1;
    pub const LOCAL_MASK: u64 = (1 << Self::LOCAL_BITS) - 1;

    #[inline]
    pub const fn make_global_handle_idx(shard: u32, local: u64) -> u64 {
        ((shard as u64 & Self::SHARD_MASK) << Self::LOCAL_BITS) | (local & Self::LOCAL_MASK)
    }

    #[inline]
    pub const fn shard_from_handle_idx(handle_idx: u64) -> u32 {
        ((handle_idx >> Self::LOCAL_BITS) & Self::SHARD_MASK) as u32
    }

    #[inline]
    pub const fn local_from_handle_idx(handle_idx: u64) -> u64 {
        handle_idx & Self::LOCAL_MASK
    }

    /// Rewrap a local id as a global one, preserving the tag.
    #[inline]
    pub fn to_global(shard: u32, local: NodeId) -> NodeId {
        NodeId::from_parts(
            Self::make_global_handle_idx(shard, local.handle_index()),
            local.tag(),
        )
    }

    /// Strip shard bits, preserving the tag.
    #[inline]
    pub fn to_local(global: NodeId) -> NodeId {
        NodeId::from_parts(
            Self::local_from_handle_idx(global.handle_index()),
            global.tag(),
        )
    }
}

#[cfg(test)]
#[path = "node_id_tests.rs"]
mod node_id_tests;
