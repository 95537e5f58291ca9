//! Object table entry
//! ------------------
//! One `OtEntry` is the metadata cell for one handle. The cell is a bundle
//! of atomics so readers can inspect it without taking the shard lock; the
//! `tag` field is the publication point. Writers store every other field
//! first and then store `tag` with release ordering; readers load `tag`
//! with acquire, copy the fields, and re-check `tag` to reject a
//! concurrent reuse.
//!
//! Lifecycle states, encoded by `(birth_epoch, kind, retire_epoch)`:
//!
//! | State    | birth_epoch | kind      | retire_epoch        |
//! |----------|-------------|-----------|---------------------|
//! | FREE     | 0           | Invalid   | any (breadcrumb ok) |
//! | RESERVED | 0           | ≠ Invalid | `RETIRE_LIVE`       |
//! | LIVE     | > 0         | ≠ Invalid | `RETIRE_LIVE`       |
//! | RETIRED  | > 0         | ≠ Invalid | finite              |

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::node_id::NodeKind;

/// `retire_epoch` value meaning "not retired".
pub const RETIRE_LIVE: u64 = u64::MAX;

/// Physical address of a payload inside the segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OtAddr {
    pub file_id: u32,
    pub segment_id: u32,
    pub offset: u64,
    pub length: u32,
}

/// The atomic metadata cell for one handle. Never moves once its slab is
/// published; all mutation happens through `&self`.
pub struct OtEntry {
    file_id: AtomicU32,
    segment_id: AtomicU32,
    offset: AtomicU64,
    length: AtomicU32,
    class_id: AtomicU8,
    kind: AtomicU8,
    tag: AtomicU16,
    /// CRC of the payload bytes; 0 when unknown. Lets reads reject a slot
    /// whose segment write never reached disk.
    data_crc: AtomicU32,
    birth_epoch: AtomicU64,
    retire_epoch: AtomicU64,
}

impl Default for OtEntry {
    fn default() -> Self {
        OtEntry {
            file_id: AtomicU32::new(0),
            segment_id: AtomicU32::new(0),
            offset: AtomicU64::new(0),
            length: AtomicU32::new(0),
            class_id: AtomicU8::new(0),
            kind: AtomicU8::new(NodeKind::Invalid as u8),
            tag: AtomicU16::new(0),
            data_crc: AtomicU32::new(0),
            birth_epoch: AtomicU64::new(0),
            retire_epoch: AtomicU64::new(RETIRE_LIVE),
        }
    }
}

/// A consistent copy of an entry, taken after tag validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryView {
    pub addr: OtAddr,
    pub class_id: u8,
    pub kind: NodeKind,
    pub tag: u16,
    pub data_crc: u32,
    pub birth_epoch: u64,
    pub retire_epoch: u64,
}

impl EntryView {
    #[inline]
    pub fn is_live(&self) -> bool {
        self.birth_epoch != 0 && self.retire_epoch == RETIRE_LIVE
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.birth_epoch == 0 && self.kind != NodeKind::Invalid && self.retire_epoch == RETIRE_LIVE
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.birth_epoch != 0 && self.retire_epoch != RETIRE_LIVE
    }
}

impl OtEntry {
    /// Write the non-tag fields. Callers hold the shard lock; ordering
    /// toward readers is provided by the subsequent `publish_tag`.
    pub fn store_metadata(&self, addr: OtAddr, class_id: u8, kind: NodeKind) {
        self.file_id.store(addr.file_id, Ordering::Relaxed);
        self.segment_id.store(addr.segment_id, Ordering::Relaxed);
        self.offset.store(addr.offset, Ordering::Relaxed);
        self.length.store(addr.length, Ordering::Relaxed);
        self.class_id.store(class_id, Ordering::Relaxed);
        self.kind.store(kind as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn addr(&self) -> OtAddr {
        OtAddr {
            file_id: self.file_id.load(Ordering::Relaxed),
            segment_id: self.segment_id.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            length: self.length.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn class_id(&self) -> u8 {
        self.class_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_u8(self.kind.load(Ordering::Relaxed)).unwrap_or(NodeKind::Invalid)
    }

    #[inline]
    pub fn set_kind(&self, kind: NodeKind) {
        self.kind.store(kind as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn data_crc(&self) -> u32 {
        self.data_crc.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_data_crc(&self, crc: u32) {
        self.data_crc.store(crc, Ordering::Relaxed);
    }

    #[inline]
    pub fn tag_acquire(&self) -> u16 {
        self.tag.load(Ordering::Acquire)
    }

    #[inline]
    pub fn tag_relaxed(&self) -> u16 {
        self.tag.load(Ordering::Relaxed)
    }

    /// Release-store of the tag: the publication point for everything
    /// stored before it.
    #[inline]
    pub fn publish_tag(&self, tag: u16) {
        self.tag.store(tag, Ordering::Release);
    }

    #[inline]
    pub fn birth_epoch(&self) -> u64 {
        self.birth_epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_birth_epoch(&self, epoch: u64) {
        self.birth_epoch.store(epoch, Ordering::Release);
    }

    #[inline]
    pub fn retire_epoch(&self) -> u64 {
        self.retire_epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_retire_epoch(&self, epoch: u64) {
        self.retire_epoch.store(epoch, Ordering::Release);
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        // FREE: birth=0 && kind=Invalid; the retire field may hold a breadcrumb.
        self.birth_epoch.load(Ordering::Relaxed) == 0
            && self.kind.load(Ordering::Relaxed) == NodeKind::Invalid as u8
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.birth_epoch.load(Ordering::Relaxed) != 0
            && self.retire_epoch.load(Ordering::Relaxed) == RETIRE_LIVE
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.birth_epoch.load(Ordering::Relaxed) != 0
            && self.retire_epoch.load(Ordering::Relaxed) != RETIRE_LIVE
    }

    /// Copy the whole cell without tag validation. Used under the shard
    /// lock (snapshots, recovery) and by handle-holding writers.
    pub fn view(&self) -> EntryView {
        EntryView {
            addr: self.addr(),
            class_id: self.class_id(),
            kind: self.kind(),
            tag: self.tag.load(Ordering::Acquire),
            data_crc: self.data_crc(),
            birth_epoch: self.birth_epoch.load(Ordering::Acquire),
            retire_epoch: self.retire_epoch.load(Ordering::Acquire),
        }
    }

    /// Validated read: acquire the tag, copy fields, re-check the tag.
    /// Returns `None` on any mismatch — never stale data.
    pub fn try_view(&self, expect_tag: u16) -> Option<EntryView> {
        let t0 = self.tag.load(Ordering::Acquire);
        if t0 != expect_tag {
            return None;
        }
        let view = EntryView {
            addr: self.addr(),
            class_id: self.class_id(),
            kind: self.kind(),
            tag: t0,
            data_crc: self.data_crc(),
            birth_epoch: self.birth_epoch.load(Ordering::Acquire),
            retire_epoch: self.retire_epoch.load(Ordering::Acquire),
        };
        // Reject a concurrent reuse that republished the slot mid-copy.
        if self.tag.load(Ordering::Acquire) != expect_tag {
            return None;
        }
        Some(view)
    }

    /// Reset to FREE, leaving the tag and the retire breadcrumb in place.
    pub fn clear_to_free(&self) {
        self.store_metadata(OtAddr::default(), 0, NodeKind::Invalid);
        self.data_crc.store(0, Ordering::Relaxed);
        self.birth_epoch.store(0, Ordering::Release);
    }
}
