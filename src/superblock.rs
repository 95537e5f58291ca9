//! Superblock
//! ----------
//! A single crash-safe record naming the committed `(root, epoch)` pair.
//! The 320-byte cell is mmap'd and published through a seqlock: the writer
//! bumps the sequence to odd, stores the fields, recomputes the header CRC
//! (with the CRC field zeroed), bumps the sequence to even, then flushes
//! the mapping and fsyncs the containing directory. Readers loop until
//! they observe an even, unchanged sequence and a valid CRC, so a torn
//! read can never surface.
//!
//! A superblock that fails magic or CRC is treated as absent; cold start
//! then falls back to the manifest root catalog.

use anyhow::{Context, Result};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{StoreError, StoreResult};
use crate::fsio;
use crate::node_id::NodeId;

pub const SUPERBLOCK_MAGIC: u64 = 0x5854_5245_4542_4C4B; // "XTREEBLK"
pub const SUPERBLOCK_VERSION: u32 = 1;
pub const SUPERBLOCK_SIZE: usize = 320;
const HEADER_SIZE: u32 = 64;

// Stable on-disk offsets. The whole header is CRC'd, so any layout drift
// shows up as corruption rather than silent misreads.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_HEADER_SIZE: usize = 12;
const OFF_SEQ: usize = 16;
const OFF_ROOT_ID: usize = 24;
const OFF_COMMIT_EPOCH: usize = 32;
const OFF_GENERATION: usize = 40;
const OFF_CREATED_UNIX: usize = 48;
const OFF_HEADER_CRC: usize = 56;

const _: () = assert!(OFF_HEADER_CRC + 4 <= HEADER_SIZE as usize);
const _: () = assert!(SUPERBLOCK_SIZE >= HEADER_SIZE as usize);

/// The committed pair readers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperSnapshot {
    pub root: NodeId,
    pub epoch: u64,
    pub generation: u64,
}

pub struct Superblock {
    path: PathBuf,
    map: MmapMut,
    write_mu: Mutex<()>,
}

impl Superblock {
    /// Open (or create) the superblock file at `path`. A fresh file is
    /// initialized to a valid empty cell: invalid root, epoch 0.
    pub fn open(path: &Path) -> Result<Superblock> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let fresh = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open superblock {}", path.display()))?;
        if file.metadata()?.len() < SUPERBLOCK_SIZE as u64 {
            file.set_len(SUPERBLOCK_SIZE as u64)?;
        }
        // Safety: the mapping is private to this process; concurrent access
        // goes through the atomic views below, never through plain slices.
        let map = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mmap superblock {}", path.display()))?;
        let sb = Superblock { path: path.to_path_buf(), map, write_mu: Mutex::new(()) };
        if fresh {
            sb.initialize()?;
        }
        Ok(sb)
    }

    fn initialize(&self) -> Result<()> {
        let _guard = self.write_mu.lock();
        self.u64_at(OFF_MAGIC).store(SUPERBLOCK_MAGIC, Ordering::Relaxed);
        self.u32_at(OFF_VERSION).store(SUPERBLOCK_VERSION, Ordering::Relaxed);
        self.u32_at(OFF_HEADER_SIZE).store(HEADER_SIZE, Ordering::Relaxed);
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.u64_at(OFF_CREATED_UNIX).store(created, Ordering::Relaxed);
        self.u64_at(OFF_ROOT_ID).store(NodeId::INVALID_RAW, Ordering::Relaxed);
        self.u64_at(OFF_COMMIT_EPOCH).store(0, Ordering::Relaxed);
        self.u64_at(OFF_GENERATION).store(0, Ordering::Relaxed);
        let crc = self.compute_crc(0, NodeId::INVALID_RAW, 0, 0, created);
        self.u32_at(OFF_HEADER_CRC).store(crc, Ordering::Relaxed);
        self.u32_at(OFF_SEQ).store(0, Ordering::Release);
        self.map.flush().context("flush superblock init")?;
        if let Some(dir) = self.path.parent() {
            fsio::fsync_dir(dir)?;
        }
        Ok(())
    }

    /// Publish a new `(root, epoch)` pair. Rejects epoch regression; an
    /// equal epoch is allowed for idempotent root-only republish.
    pub fn publish(&self, new_root: NodeId, new_epoch: u64) -> StoreResult<()> {
        let _guard = self.write_mu.lock();
        let cur_epoch = self.u64_at(OFF_COMMIT_EPOCH).load(Ordering::Relaxed);
        let generation = self.u64_at(OFF_GENERATION).load(Ordering::Relaxed);
        if generation > 0 && new_epoch < cur_epoch {
            return Err(StoreError::EpochRegression { current: cur_epoch, proposed: new_epoch });
        }
        let created = self.u64_at(OFF_CREATED_UNIX).load(Ordering::Relaxed);
        let seq0 = self.u32_at(OFF_SEQ).load(Ordering::Relaxed);

        // Odd: readers back off until we land the even store below.
        self.u32_at(OFF_SEQ).store(seq0 | 1, Ordering::Release);
        self.u64_at(OFF_ROOT_ID).store(new_root.raw(), Ordering::Relaxed);
        self.u64_at(OFF_COMMIT_EPOCH).store(new_epoch, Ordering::Relaxed);
        self.u64_at(OFF_GENERATION).store(generation + 1, Ordering::Relaxed);
        let seq_final = (seq0 | 1).wrapping_add(1);
        let crc = self.compute_crc(seq_final, new_root.raw(), new_epoch, generation + 1, created);
        self.u32_at(OFF_HEADER_CRC).store(crc, Ordering::Relaxed);
        self.u32_at(OFF_SEQ).store(seq_final, Ordering::Release);

        self.map.flush().map_err(StoreError::Io)?;
        if let Some(dir) = self.path.parent() {
            fsio::fsync_dir(dir).map_err(StoreError::Other)?;
        }
        Ok(())
    }

    /// Seqlock read. `None` when the cell is absent or corrupt.
    pub fn load(&self) -> Option<SuperSnapshot> {
        for _ in 0..1024 {
            let s1 = self.u32_at(OFF_SEQ).load(Ordering::Acquire);
            if s1 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let magic = self.u64_at(OFF_MAGIC).load(Ordering::Relaxed);
            let root_raw = self.u64_at(OFF_ROOT_ID).load(Ordering::Relaxed);
            let epoch = self.u64_at(OFF_COMMIT_EPOCH).load(Ordering::Relaxed);
            let generation = self.u64_at(OFF_GENERATION).load(Ordering::Relaxed);
            let created = self.u64_at(OFF_CREATED_UNIX).load(Ordering::Relaxed);
            let crc = self.u32_at(OFF_HEADER_CRC).load(Ordering::Relaxed);
            let s2 = self.u32_at(OFF_SEQ).load(Ordering::Acquire);
            if s1 != s2 {
                continue;
            }
            if magic != SUPERBLOCK_MAGIC {
                return None;
            }
            if self.compute_crc(s1, root_raw, epoch, generation, created) != crc {
                return None;
            }
            return Some(SuperSnapshot { root: NodeId::from_raw(root_raw), epoch, generation });
        }
        None
    }

    pub fn valid(&self) -> bool {
        self.load().is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// CRC over the 64-byte header image with the CRC field zeroed.
    fn compute_crc(&self, seq: u32, root_raw: u64, epoch: u64, generation: u64, created: u64) -> u32 {
        let mut hdr = [0u8; HEADER_SIZE as usize];
        hdr[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        hdr[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
        hdr[OFF_HEADER_SIZE..OFF_HEADER_SIZE + 4].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        hdr[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_le_bytes());
        hdr[OFF_ROOT_ID..OFF_ROOT_ID + 8].copy_from_slice(&root_raw.to_le_bytes());
        hdr[OFF_COMMIT_EPOCH..OFF_COMMIT_EPOCH + 8].copy_from_slice(&epoch.to_le_bytes());
        hdr[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&generation.to_le_bytes());
        hdr[OFF_CREATED_UNIX..OFF_CREATED_UNIX + 8].copy_from_slice(&created.to_le_bytes());
        // CRC field stays zero in the image.
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&hdr);
        hasher.finalize()
    }

    #[inline]
    fn u32_at(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off % 4 == 0 && off + 4 <= SUPERBLOCK_SIZE);
        // Safety: the mapping is page-aligned and outlives `self`; offsets
        // are 4-byte aligned constants within the mapped region.
        unsafe { &*(self.map.as_ptr().add(off) as *const AtomicU32) }
    }

    #[inline]
    fn u64_at(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off % 8 == 0 && off + 8 <= SUPERBLOCK_SIZE);
        // Safety: as above; offsets are 8-byte aligned constants.
        unsafe { &*(self.map.as_ptr().add(off) as *const AtomicU64) }
    }
}

#[cfg(test)]
#[path = "superblock_tests.rs"]
mod superblock_tests;
