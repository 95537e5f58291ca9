//! Checkpoint
//! ----------
//! A flat, self-contained snapshot of all LIVE object-table entries at one
//! epoch. The file is a 40-byte header (magic, version, epoch, entry
//! count, payload CRC, header CRC) followed by a packed array of 52-byte
//! records in the delta-log wire layout. Written temp → fsync → rename so
//! a crash never leaves a half-checkpoint under the published name; old
//! checkpoints are deleted only after the manifest points at the new one.
//!
//! On recovery the file is mmap'd read-only and entries are restored into
//! the object table at their exact handle indices.

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::delta_log::{OtDeltaRec, WIRE_REC_SIZE};
use crate::fsio;

/// Checkpoint entries share the delta wire layout; `handle_idx` is global.
pub type PersistentEntry = OtDeltaRec;

pub const CHECKPOINT_MAGIC: u64 = 0x5854_4348_4B50_5431; // "XTCHKPT1"
pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_HEADER_SIZE: usize = 40;

/// Identity of a written checkpoint, destined for the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub file_name: String,
    pub epoch: u64,
    pub size: u64,
    pub entries: u64,
    pub crc: u32,
}

pub fn checkpoint_file_name(epoch: u64) -> String {
    format!("checkpoint_{:012}.ckpt", epoch)
}

/// Serialize `entries` into `<dir>/checkpoint_<epoch>.ckpt` atomically.
pub fn write_checkpoint(dir: &Path, epoch: u64, entries: &[PersistentEntry]) -> Result<CheckpointSummary> {
    let mut payload = Vec::with_capacity(entries.len() * WIRE_REC_SIZE);
    for e in entries {
        e.encode_into(&mut payload);
    }
    let mut h = crc32fast::Hasher::new();
    h.update(&payload);
    let payload_crc = h.finalize();

    let mut buf = Vec::with_capacity(CHECKPOINT_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&CHECKPOINT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // pad
    buf.extend_from_slice(&epoch.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    buf.extend_from_slice(&payload_crc.to_le_bytes());
    let mut hh = crc32fast::Hasher::new();
    hh.update(&buf);
    let header_crc = hh.finalize();
    buf.extend_from_slice(&header_crc.to_le_bytes());
    debug_assert_eq!(buf.len(), CHECKPOINT_HEADER_SIZE);
    buf.extend_from_slice(&payload);

    let file_name = checkpoint_file_name(epoch);
    let path = dir.join(&file_name);
    fsio::atomic_publish(&path, &buf)
        .with_context(|| format!("publish checkpoint {}", path.display()))?;
    tracing::info!(
        target: "xtstore::checkpoint",
        "wrote checkpoint epoch={} entries={} bytes={}",
        epoch, entries.len(), buf.len()
    );
    Ok(CheckpointSummary {
        file_name,
        epoch,
        size: buf.len() as u64,
        entries: entries.len() as u64,
        crc: payload_crc,
    })
}

/// Read-only mmap'd view of a checkpoint file.
pub struct CheckpointReader {
    path: PathBuf,
    map: Mmap,
    epoch: u64,
    entries: u64,
}

impl CheckpointReader {
    pub fn open(path: &Path) -> Result<CheckpointReader> {
        let file = File::open(path)
            .with_context(|| format!("open checkpoint {}", path.display()))?;
        // Safety: checkpoint files are immutable once published.
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap checkpoint {}", path.display()))?;
        if map.len() < CHECKPOINT_HEADER_SIZE {
            bail!("checkpoint too small: {}", path.display());
        }
        let magic = u64::from_le_bytes(map[0..8].try_into().unwrap());
        if magic != CHECKPOINT_MAGIC {
            bail!("invalid checkpoint magic in {}", path.display());
        }
        let version = u32::from_le_bytes(map[8..12].try_into().unwrap());
        if version != CHECKPOINT_VERSION {
            bail!("unsupported checkpoint version {} in {}", version, path.display());
        }
        let epoch = u64::from_le_bytes(map[16..24].try_into().unwrap());
        let entries = u64::from_le_bytes(map[24..32].try_into().unwrap());
        let payload_crc = u32::from_le_bytes(map[32..36].try_into().unwrap());
        let header_crc = u32::from_le_bytes(map[36..40].try_into().unwrap());

        let mut hh = crc32fast::Hasher::new();
        hh.update(&map[0..CHECKPOINT_HEADER_SIZE - 4]);
        if hh.finalize() != header_crc {
            bail!("checkpoint header crc mismatch in {}", path.display());
        }
        let body_len = entries as usize * WIRE_REC_SIZE;
        if CHECKPOINT_HEADER_SIZE + body_len > map.len() {
            bail!("checkpoint body out of bounds in {}", path.display());
        }
        let mut h = crc32fast::Hasher::new();
        h.update(&map[CHECKPOINT_HEADER_SIZE..CHECKPOINT_HEADER_SIZE + body_len]);
        if h.finalize() != payload_crc {
            bail!("checkpoint payload crc mismatch in {}", path.display());
        }
        Ok(CheckpointReader { path: path.to_path_buf(), map, epoch, entries })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> impl Iterator<Item = PersistentEntry> + '_ {
        (0..self.entries as usize).map(move |i| {
            let off = CHECKPOINT_HEADER_SIZE + i * WIRE_REC_SIZE;
            OtDeltaRec::decode(&self.map[off..off + WIRE_REC_SIZE])
        })
    }
}

#[cfg(test)]
#[path = "checkpoint_tests.rs"]
mod checkpoint_tests;
