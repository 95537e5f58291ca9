//! Segment allocator
//! -----------------
//! Node payloads are packed into per-size-class, append-only segment
//! files. A class holds fixed-size slots (powers of two, 64 B up to
//! 1 MiB); allocation is bump-pointer within the current segment with
//! O(1)-amortized reuse from a per-segment free bitmap. Freed ranges are
//! tracked as dead bytes but never punched; a compactor may later rewrite
//! live slots of a mostly-dead segment into a fresh one.
//!
//! Segment files are mmap'd for both write and read. Readers hold a
//! [`SegmentPin`] while touching mapped bytes so a mapping is never torn
//! down under them; consistency of the bytes themselves is provided by
//! the object-table tag protocol, not by this module.

use anyhow::{anyhow, bail, Context, Result};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::entry::OtAddr;

/// Smallest slot size; classes double from here.
pub const MIN_SLOT_BYTES: u32 = 64;
/// 64 B .. 1 MiB inclusive.
pub const NUM_CLASSES: usize = 15;

#[inline]
pub fn class_slot_bytes(class_id: u8) -> u32 {
    MIN_SLOT_BYTES << class_id
}

/// Smallest class whose slot fits `len`. `None` when `len` exceeds the
/// largest class (callers surface that as exhaustion).
pub fn class_for_len(len: u32) -> Option<u8> {
    if len == 0 {
        return Some(0);
    }
    (0..NUM_CLASSES as u8).find(|&c| class_slot_bytes(c) >= len)
}

/// One carved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub file_id: u32,
    pub segment_id: u32,
    pub offset: u64,
    pub length: u32,
    pub class_id: u8,
}

impl Allocation {
    #[inline]
    pub fn addr(&self) -> OtAddr {
        OtAddr {
            file_id: self.file_id,
            segment_id: self.segment_id,
            offset: self.offset,
            length: self.length,
        }
    }
}

/// Per-class occupancy statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassStats {
    pub class_id: u8,
    pub slot_bytes: u32,
    pub segments: usize,
    pub live_bytes: u64,
    pub dead_bytes: u64,
    pub free_slots: u64,
}

/// A segment whose dead/total ratio crossed the compaction threshold.
#[derive(Debug, Clone, Copy)]
pub struct CompactionCandidate {
    pub file_id: u32,
    pub class_id: u8,
    pub dead_ratio: f64,
}

/// A segment file created since the last manifest update.
#[derive(Debug, Clone)]
pub struct NewSegmentFile {
    pub class_id: u8,
    pub seq: u32,
    pub file_name: String,
    pub bytes: u64,
}

// ---------------- Mapped segment file ----------------

pub struct SegmentFile {
    pub file_id: u32,
    pub class_id: u8,
    pub seq: u32,
    path: PathBuf,
    capacity: u64,
    map: UnsafeCell<MmapMut>,
}

// Safety: all access to the mapping goes through `write`/`bytes`, whose
// ranges are disjoint live slots; cross-thread visibility of payload bytes
// is ordered by the object-table tag release/acquire protocol.
unsafe impl Sync for SegmentFile {}
unsafe impl Send for SegmentFile {}

impl SegmentFile {
    fn create(dir: &Path, file_id: u32, class_id: u8, seq: u32, capacity: u64) -> Result<Arc<SegmentFile>> {
        let path = dir.join(segment_file_name(class_id, seq));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("create segment {}", path.display()))?;
        file.set_len(capacity)?;
        // Safety: mapping is private to the store process; see struct note.
        let map = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mmap segment {}", path.display()))?;
        Ok(Arc::new(SegmentFile {
            file_id,
            class_id,
            seq,
            path,
            capacity,
            map: UnsafeCell::new(map),
        }))
    }

    fn open(dir: &Path, file_id: u32, class_id: u8, seq: u32) -> Result<Arc<SegmentFile>> {
        let path = dir.join(segment_file_name(class_id, seq));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open segment {}", path.display()))?;
        let capacity = file.metadata()?.len();
        // Safety: see struct note.
        let map = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mmap segment {}", path.display()))?;
        Ok(Arc::new(SegmentFile {
            file_id,
            class_id,
            seq,
            path,
            capacity,
            map: UnsafeCell::new(map),
        }))
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy `data` into the slot at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.capacity {
            bail!("segment write out of bounds: {}+{} > {}", offset, data.len(), self.capacity);
        }
        // Safety: bounds checked above; slots are disjoint while live.
        unsafe {
            let map = &mut *self.map.get();
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                map.as_mut_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Run `f` over the mutable slot bytes (in-place publish path).
    pub fn with_mut<R>(&self, offset: u64, len: u32, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        if offset + len as u64 > self.capacity {
            bail!("segment range out of bounds: {}+{} > {}", offset, len, self.capacity);
        }
        // Safety: bounds checked; the slot is exclusively owned by the
        // writer until its tag is published.
        let slice = unsafe {
            let map = &mut *self.map.get();
            std::slice::from_raw_parts_mut(map.as_mut_ptr().add(offset as usize), len as usize)
        };
        Ok(f(slice))
    }

    #[inline]
    fn bytes(&self, offset: u64, len: u32) -> Result<&[u8]> {
        if offset + len as u64 > self.capacity {
            bail!("segment read out of bounds: {}+{} > {}", offset, len, self.capacity);
        }
        // Safety: bounds checked; validated readers only touch slots whose
        // contents were published before the tag store they synchronized on.
        Ok(unsafe {
            let map = &*self.map.get();
            std::slice::from_raw_parts(map.as_ptr().add(offset as usize), len as usize)
        })
    }

    pub fn sync(&self) -> Result<()> {
        // Safety: flush only reads the mapping metadata.
        unsafe { (*self.map.get()).flush() }
            .with_context(|| format!("flush segment {}", self.path.display()))
    }
}

/// Scoped acquisition of a mapping: the bytes stay valid for the life of
/// the pin even if the allocator retires the segment meanwhile.
pub struct SegmentPin {
    file: Arc<SegmentFile>,
}

impl SegmentPin {
    #[inline]
    pub fn bytes(&self, offset: u64, len: u32) -> Result<&[u8]> {
        self.file.bytes(offset, len)
    }

    #[inline]
    pub fn file_id(&self) -> u32 {
        self.file.file_id
    }
}

// ---------------- Per-class allocation state ----------------

struct ClassSegment {
    file: Arc<SegmentFile>,
    /// bit = 1 means the slot is free for reuse.
    free_bits: Vec<u64>,
    free_count: u64,
    /// Bump watermark: slots below it have been handed out at least once.
    watermark: u64,
    dead_bytes: u64,
}

struct ClassState {
    segments: Vec<ClassSegment>,
    /// (segment index, word index) reuse cursor.
    cursor: (usize, usize),
    next_seq: u32,
    live_bytes: u64,
}

impl ClassState {
    fn new() -> ClassState {
        ClassState { segments: Vec::new(), cursor: (0, 0), next_seq: 0, live_bytes: 0 }
    }
}

// ---------------- Allocator ----------------

pub struct SegmentAllocator {
    dir: PathBuf,
    segment_bytes: u64,
    classes: Vec<Mutex<ClassState>>,
    files: RwLock<HashMap<u32, Arc<SegmentFile>>>,
    new_files: Mutex<Vec<NewSegmentFile>>,
}

fn segment_file_name(class_id: u8, seq: u32) -> String {
    format!("data.c{:02}.{:06}.seg", class_id, seq)
}

/// File ids are derived from `(class, seq)` so addresses persisted in the
/// WAL and checkpoints stay valid across restarts.
#[inline]
pub fn file_id_for(class_id: u8, seq: u32) -> u32 {
    ((class_id as u32) << 24) | (seq & 0x00FF_FFFF)
}

impl SegmentAllocator {
    pub fn new(dir: &Path, segment_bytes: u64) -> Result<SegmentAllocator> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create data dir {}", dir.display()))?;
        let classes = (0..NUM_CLASSES).map(|_| Mutex::new(ClassState::new())).collect();
        Ok(SegmentAllocator {
            dir: dir.to_path_buf(),
            segment_bytes,
            classes,
            files: RwLock::new(HashMap::new()),
            new_files: Mutex::new(Vec::new()),
        })
    }

    fn slots_per_segment(&self, class_id: u8) -> u64 {
        (self.segment_bytes / class_slot_bytes(class_id) as u64).max(1)
    }

    /// Carve a slot big enough for `len` bytes. `length` in the returned
    /// allocation is the caller's requested length; the slot capacity is
    /// `class_slot_bytes(class_id)`.
    pub fn allocate(&self, len: u32) -> Result<Allocation> {
        let class_id = class_for_len(len)
            .ok_or_else(|| anyhow!("allocation of {} bytes exceeds largest size class", len))?;
        let slot = class_slot_bytes(class_id);
        let mut st = self.classes[class_id as usize].lock();

        // Reuse path: advance the word cursor over free bits.
        if let Some((seg_idx, slot_idx)) = self.scan_free_locked(&mut st) {
            let seg = &mut st.segments[seg_idx];
            let word = slot_idx / 64;
            seg.free_bits[word] &= !(1u64 << (slot_idx % 64));
            seg.free_count -= 1;
            seg.dead_bytes = seg.dead_bytes.saturating_sub(slot as u64);
            let (file_id, segment_id) = (seg.file.file_id, seg.file.seq);
            st.live_bytes += slot as u64;
            return Ok(Allocation {
                file_id,
                segment_id,
                offset: slot_idx as u64 * slot as u64,
                length: len,
                class_id,
            });
        }

        // Bump path: current segment is the last one.
        let slots = self.slots_per_segment(class_id);
        let need_new = match st.segments.last() {
            Some(seg) => seg.watermark >= slots,
            None => true,
        };
        if need_new {
            self.add_segment_locked(class_id, &mut st)?;
        }
        let seg = st.segments.last_mut().expect("segment just ensured");
        let slot_idx = seg.watermark;
        seg.watermark += 1;
        st.live_bytes += slot as u64;
        let (file_id, segment_id) = {
            let seg = st.segments.last().unwrap();
            (seg.file.file_id, seg.file.seq)
        };
        Ok(Allocation {
            file_id,
            segment_id,
            offset: slot_idx * slot as u64,
            length: len,
            class_id,
        })
    }

    fn scan_free_locked(&self, st: &mut ClassState) -> Option<(usize, usize)> {
        if st.segments.is_empty() {
            return None;
        }
        let nsegs = st.segments.len();
        let (mut si, mut wi) = st.cursor;
        if si >= nsegs {
            si = 0;
            wi = 0;
        }
        let mut visited_segments = 0;
        while visited_segments <= nsegs {
            let seg = &st.segments[si];
            if seg.free_count == 0 {
                si = (si + 1) % nsegs;
                wi = 0;
                visited_segments += 1;
                continue;
            }
            let nwords = seg.free_bits.len();
            for step in 0..nwords {
                let w = (wi + step) % nwords;
                let bits = seg.free_bits[w];
                if bits != 0 {
                    let bit = bits.trailing_zeros() as usize;
                    st.cursor = (si, w);
                    return Some((si, w * 64 + bit));
                }
            }
            si = (si + 1) % nsegs;
            wi = 0;
            visited_segments += 1;
        }
        None
    }

    fn add_segment_locked(&self, class_id: u8, st: &mut ClassState) -> Result<()> {
        let seq = st.next_seq;
        st.next_seq += 1;
        let file_id = file_id_for(class_id, seq);
        let slots = self.slots_per_segment(class_id);
        let capacity = slots * class_slot_bytes(class_id) as u64;
        let file = SegmentFile::create(&self.dir, file_id, class_id, seq, capacity)?;
        tracing::debug!(
            target: "xtstore::segment",
            "new segment class={} seq={} file_id={} capacity={}",
            class_id, seq, file_id, capacity
        );
        self.files.write().insert(file_id, Arc::clone(&file));
        self.new_files.lock().push(NewSegmentFile {
            class_id,
            seq,
            file_name: segment_file_name(class_id, seq),
            bytes: capacity,
        });
        st.segments.push(ClassSegment {
            file,
            free_bits: vec![0u64; slots.div_ceil(64) as usize],
            free_count: 0,
            watermark: 0,
            dead_bytes: 0,
        });
        Ok(())
    }

    /// Return a slot to the free bitmap. Idempotent per slot until reuse.
    pub fn free(&self, alloc: &Allocation) -> Result<()> {
        let slot = class_slot_bytes(alloc.class_id);
        let mut st = self.classes[alloc.class_id as usize].lock();
        let seg = st
            .segments
            .iter_mut()
            .find(|s| s.file.file_id == alloc.file_id)
            .ok_or_else(|| anyhow!("free of unknown segment file {}", alloc.file_id))?;
        let slot_idx = (alloc.offset / slot as u64) as usize;
        let word = slot_idx / 64;
        let mask = 1u64 << (slot_idx % 64);
        if seg.free_bits[word] & mask == 0 {
            seg.free_bits[word] |= mask;
            seg.free_count += 1;
            seg.dead_bytes += slot as u64;
            st.live_bytes = st.live_bytes.saturating_sub(slot as u64);
        }
        Ok(())
    }

    /// Free straight from an OT address (reclaim path).
    pub fn free_addr(&self, addr: &OtAddr, class_id: u8) -> Result<()> {
        self.free(&Allocation {
            file_id: addr.file_id,
            segment_id: addr.segment_id,
            offset: addr.offset,
            length: addr.length,
            class_id,
        })
    }

    /// Pin the mapping holding `file_id`.
    pub fn pin(&self, file_id: u32) -> Option<SegmentPin> {
        self.files
            .read()
            .get(&file_id)
            .map(|f| SegmentPin { file: Arc::clone(f) })
    }

    /// Copy payload bytes into a slot.
    pub fn write_payload(&self, addr: &OtAddr, data: &[u8]) -> Result<()> {
        let pin = self
            .pin(addr.file_id)
            .ok_or_else(|| anyhow!("write to unknown segment file {}", addr.file_id))?;
        if data.len() as u64 > addr.length as u64 {
            bail!("payload {} exceeds slot length {}", data.len(), addr.length);
        }
        pin.file.write(addr.offset, data)
    }

    /// Mutable access to a slot for the in-place publish path.
    pub fn with_slot_mut<R>(&self, addr: &OtAddr, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let pin = self
            .pin(addr.file_id)
            .ok_or_else(|| anyhow!("mutate of unknown segment file {}", addr.file_id))?;
        pin.file.with_mut(addr.offset, addr.length, f)
    }

    /// Flush every mapped segment (EVENTUAL-mode batched durability and
    /// pre-checkpoint barrier).
    pub fn sync_all(&self) -> Result<()> {
        for f in self.files.read().values() {
            f.sync()?;
        }
        Ok(())
    }

    /// Drain segment files created since the last call (manifest update).
    pub fn take_new_files(&self) -> Vec<NewSegmentFile> {
        std::mem::take(&mut *self.new_files.lock())
    }

    pub fn class_stats(&self, class_id: u8) -> ClassStats {
        let st = self.classes[class_id as usize].lock();
        let mut dead = 0u64;
        let mut free = 0u64;
        for seg in &st.segments {
            dead += seg.dead_bytes;
            free += seg.free_count;
        }
        ClassStats {
            class_id,
            slot_bytes: class_slot_bytes(class_id),
            segments: st.segments.len(),
            live_bytes: st.live_bytes,
            dead_bytes: dead,
            free_slots: free,
        }
    }

    pub fn all_stats(&self) -> Vec<ClassStats> {
        (0..NUM_CLASSES as u8).map(|c| self.class_stats(c)).collect()
    }

    /// Segments whose dead/total ratio exceeds `threshold`. The compactor
    /// driving this is external; rewriting is optional and does not affect
    /// correctness.
    pub fn compaction_candidates(&self, threshold: f64) -> Vec<CompactionCandidate> {
        let mut out = Vec::new();
        for class_id in 0..NUM_CLASSES as u8 {
            let st = self.classes[class_id as usize].lock();
            let slots = self.slots_per_segment(class_id);
            let total = slots * class_slot_bytes(class_id) as u64;
            for seg in &st.segments {
                if total == 0 {
                    continue;
                }
                let ratio = seg.dead_bytes as f64 / total as f64;
                if ratio > threshold {
                    out.push(CompactionCandidate { file_id: seg.file.file_id, class_id, dead_ratio: ratio });
                }
            }
        }
        out
    }

    /// Copy the given live ranges of `file_id` into fresh slots of the same
    /// class. Returns `(old, new)` pairs; the caller rebinds handles and
    /// retires the drained segment afterwards.
    pub fn rewrite_live_ranges(
        &self,
        file_id: u32,
        live: &[Allocation],
    ) -> Result<Vec<(Allocation, Allocation)>> {
        let src = self
            .pin(file_id)
            .ok_or_else(|| anyhow!("rewrite of unknown segment file {}", file_id))?;
        let mut moves = Vec::with_capacity(live.len());
        for old in live {
            if old.file_id != file_id {
                bail!("live range {:?} does not belong to segment {}", old, file_id);
            }
            let new_alloc = self.allocate(old.length)?;
            let bytes = src.bytes(old.offset, old.length)?.to_vec();
            self.write_payload(&new_alloc.addr(), &bytes)?;
            self.free(old)?;
            moves.push((*old, new_alloc));
        }
        Ok(moves)
    }

    /// Register a pre-existing segment file during recovery. All slots
    /// start free; `note_in_use` re-marks the live ones as the object
    /// table is rebuilt.
    pub fn restore_segment(&self, class_id: u8, seq: u32) -> Result<u32> {
        let file_id = file_id_for(class_id, seq);
        let file = SegmentFile::open(&self.dir, file_id, class_id, seq)?;
        let slots = self.slots_per_segment(class_id);
        let mut free_bits = vec![u64::MAX; slots.div_ceil(64) as usize];
        // Clear the padding bits past the last slot.
        let tail = (slots % 64) as u32;
        if tail != 0 {
            *free_bits.last_mut().unwrap() = (1u64 << tail) - 1;
        }
        self.files.write().insert(file_id, Arc::clone(&file));
        let mut st = self.classes[class_id as usize].lock();
        st.next_seq = st.next_seq.max(seq + 1);
        st.segments.push(ClassSegment {
            file,
            free_bits,
            free_count: slots,
            watermark: slots,
            dead_bytes: 0,
        });
        Ok(file_id)
    }

    /// Mark a recovered address as occupied. Returns the live `file_id`
    /// for the `(class, segment)` pair so OT addresses can be rebound.
    pub fn note_in_use(&self, class_id: u8, segment_id: u32, offset: u64) -> Result<u32> {
        let slot = class_slot_bytes(class_id);
        let mut st = self.classes[class_id as usize].lock();
        let seg = st
            .segments
            .iter_mut()
            .find(|s| s.file.seq == segment_id)
            .ok_or_else(|| anyhow!("recovered address names unknown segment c{} s{}", class_id, segment_id))?;
        let slot_idx = (offset / slot as u64) as usize;
        let word = slot_idx / 64;
        let mask = 1u64 << (slot_idx % 64);
        let file_id = seg.file.file_id;
        if seg.free_bits[word] & mask != 0 {
            seg.free_bits[word] &= !mask;
            seg.free_count -= 1;
            st.live_bytes += slot as u64;
        }
        Ok(file_id)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
#[path = "segment_tests.rs"]
mod segment_tests;
