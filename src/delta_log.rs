//! Delta log (write-ahead log)
//! ---------------------------
//! Append-only file of framed object-table deltas. Appends are lock-free:
//! a writer claims its extent with one fetch-add on the end offset, then
//! lands the frame with a positional write, so concurrent writers never
//! serialize on a file cursor. Files are preallocated in large chunks to
//! amortize metadata writes.
//!
//! Frame layout: a 16-byte header (`frame_type, payload_size, payload_crc,
//! header_crc`) followed by the fixed 52-byte delta record and, for
//! payload frames, the inline node bytes. The header CRC covers the first
//! 12 header bytes plus the record, so a torn record fails validation and
//! replay stops at the last fully-verified frame. Inline payloads let
//! EVENTUAL-mode recovery rehydrate small nodes whose segment writes were
//! never flushed.
//!
//! Rotation is owned by the checkpoint coordinator: `prepare_close` gates
//! new appends, in-flight appends are drained through a condition
//! variable, then `close` truncates the preallocated tail and releases
//! the file.

use anyhow::{bail, Context, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::entry::{EntryView, RETIRE_LIVE};
use crate::fsio;

/// Fixed wire size of one delta record. Never `size_of::<OtDeltaRec>()`.
pub const WIRE_REC_SIZE: usize = 52;
pub const FRAME_HEADER_SIZE: usize = 16;
pub const FRAME_TYPE_DELTA_ONLY: u32 = 0;
pub const FRAME_TYPE_DELTA_WITH_PAYLOAD: u32 = 1;
/// Upper bound accepted at replay; anything larger is treated as garbage.
const MAX_REPLAY_PAYLOAD: u32 = 64 * 1024 * 1024;

/// One object-table mutation on the wire.
///
/// Layout (little-endian): `handle_idx(8) tag(2) class_id(1) kind(1)
/// file_id(4) segment_id(4) offset(8) length(4) data_crc(4)
/// birth_epoch(8) retire_epoch(8)` = 52 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtDeltaRec {
    pub handle_idx: u64,
    pub tag: u16,
    pub class_id: u8,
    pub kind: u8,
    pub file_id: u32,
    pub segment_id: u32,
    pub offset: u64,
    pub length: u32,
    pub data_crc: u32,
    pub birth_epoch: u64,
    pub retire_epoch: u64,
}

impl OtDeltaRec {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.handle_idx.to_le_bytes());
        buf.extend_from_slice(&self.tag.to_le_bytes());
        buf.push(self.class_id);
        buf.push(self.kind);
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.extend_from_slice(&self.segment_id.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.data_crc.to_le_bytes());
        buf.extend_from_slice(&self.birth_epoch.to_le_bytes());
        buf.extend_from_slice(&self.retire_epoch.to_le_bytes());
    }

    pub fn decode(b: &[u8]) -> OtDeltaRec {
        debug_assert!(b.len() >= WIRE_REC_SIZE);
        OtDeltaRec {
            handle_idx: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            tag: u16::from_le_bytes(b[8..10].try_into().unwrap()),
            class_id: b[10],
            kind: b[11],
            file_id: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            segment_id: u32::from_le_bytes(b[16..20].try_into().unwrap()),
            offset: u64::from_le_bytes(b[20..28].try_into().unwrap()),
            length: u32::from_le_bytes(b[28..32].try_into().unwrap()),
            data_crc: u32::from_le_bytes(b[32..36].try_into().unwrap()),
            birth_epoch: u64::from_le_bytes(b[36..44].try_into().unwrap()),
            retire_epoch: u64::from_le_bytes(b[44..52].try_into().unwrap()),
        }
    }

    /// Highest epoch this record mentions (for the log's epoch watermark).
    pub fn max_epoch(&self) -> u64 {
        let retire = if self.retire_epoch == RETIRE_LIVE { 0 } else { self.retire_epoch };
        self.birth_epoch.max(retire)
    }

    /// Pack a record from an entry snapshot and its global handle.
    pub fn from_view(handle_idx: u64, view: &EntryView) -> OtDeltaRec {
        OtDeltaRec {
            handle_idx,
            tag: view.tag,
            class_id: view.class_id,
            kind: view.kind as u8,
            file_id: view.addr.file_id,
            segment_id: view.addr.segment_id,
            offset: view.addr.offset,
            length: view.addr.length,
            data_crc: view.data_crc,
            birth_epoch: view.birth_epoch,
            retire_epoch: view.retire_epoch,
        }
    }
}

/// Outcome of a replay pass over one log file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayResult {
    /// Byte offset just past the last frame that verified cleanly.
    pub last_good_offset: u64,
    pub frames: u64,
    pub max_epoch: u64,
    /// True when the scan stopped before the end of the file.
    pub truncated_tail: bool,
}

pub struct OtDeltaLog {
    path: PathBuf,
    sequence: u64,
    prealloc_chunk: u64,
    file: RwLock<Option<Arc<File>>>,
    end_offset: AtomicU64,
    prealloc_end: AtomicU64,
    prealloc_mu: Mutex<()>,
    closing: AtomicBool,
    in_flight: AtomicU32,
    drain_mu: Mutex<()>,
    drain_cv: Condvar,
    max_epoch: AtomicU64,
    created: Mutex<Option<Instant>>,
    dir_synced: AtomicBool,
}

pub const DEFAULT_PREALLOC_CHUNK: u64 = 64 * 1024 * 1024;

struct InFlightGuard<'a>(&'a OtDeltaLog);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _g = self.0.drain_mu.lock();
            self.0.drain_cv.notify_all();
        }
    }
}

impl OtDeltaLog {
    pub fn new(path: &Path, prealloc_chunk: u64, sequence: u64) -> OtDeltaLog {
        OtDeltaLog {
            path: path.to_path_buf(),
            sequence,
            prealloc_chunk: prealloc_chunk.max(4096),
            file: RwLock::new(None),
            end_offset: AtomicU64::new(0),
            prealloc_end: AtomicU64::new(0),
            prealloc_mu: Mutex::new(()),
            closing: AtomicBool::new(false),
            in_flight: AtomicU32::new(0),
            drain_mu: Mutex::new(()),
            drain_cv: Condvar::new(),
            max_epoch: AtomicU64::new(0),
            created: Mutex::new(None),
            dir_synced: AtomicBool::new(false),
        }
    }

    /// Open (creating if needed) and position the append offset at the
    /// current file end. Recovery truncates torn tails before reopening,
    /// so the file length is authoritative here.
    pub fn open_for_append(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("open delta log for append: {}", self.path.display()))?;
        let len = file.metadata()?.len();
        self.end_offset.store(len, Ordering::Release);
        self.prealloc_end.store(len, Ordering::Release);
        *self.file.write() = Some(Arc::new(file));
        *self.created.lock() = Some(Instant::now());
        self.closing.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.read().is_some()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset.load(Ordering::Acquire)
    }

    /// Highest epoch written to this log.
    pub fn max_epoch(&self) -> u64 {
        self.max_epoch.load(Ordering::Acquire)
    }

    /// Raise the epoch watermark for a reopened file whose existing
    /// frames were written in a previous session.
    pub fn seed_max_epoch(&self, epoch: u64) {
        self.max_epoch.fetch_max(epoch, Ordering::AcqRel);
    }

    pub fn age(&self) -> Duration {
        self.created.lock().as_ref().map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Append a batch of delta-only frames.
    pub fn append(&self, batch: &[OtDeltaRec]) -> Result<()> {
        let framed: Vec<(OtDeltaRec, Option<&[u8]>)> =
            batch.iter().map(|r| (*r, None)).collect();
        self.append_with_payloads(&framed)
    }

    pub fn append_single(&self, rec: &OtDeltaRec) -> Result<()> {
        self.append_with_payloads(&[(*rec, None)])
    }

    pub fn append_with_payload(&self, rec: &OtDeltaRec, payload: &[u8]) -> Result<()> {
        self.append_with_payloads(&[(*rec, Some(payload))])
    }

    /// Append frames, inlining payload bytes where given. One contiguous
    /// extent is claimed for the whole batch.
    pub fn append_with_payloads(&self, batch: &[(OtDeltaRec, Option<&[u8]>)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.closing.load(Ordering::Acquire) {
            bail!("delta log {} is closing", self.path.display());
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlightGuard(self);
        // Re-check after announcing ourselves so prepare_close cannot miss us.
        if self.closing.load(Ordering::Acquire) {
            bail!("delta log {} is closing", self.path.display());
        }

        let file = {
            let g = self.file.read();
            match g.as_ref() {
                Some(f) => Arc::clone(f),
                None => bail!("delta log {} is not open", self.path.display()),
            }
        };

        let mut buf = Vec::with_capacity(
            batch.len() * (FRAME_HEADER_SIZE + WIRE_REC_SIZE)
                + batch.iter().map(|(_, p)| p.map_or(0, |p| p.len())).sum::<usize>(),
        );
        let mut batch_epoch = 0u64;
        for (rec, payload) in batch {
            encode_frame(&mut buf, rec, *payload);
            batch_epoch = batch_epoch.max(rec.max_epoch());
        }

        let total = buf.len() as u64;
        let offset = self.end_offset.fetch_add(total, Ordering::AcqRel);
        self.ensure_preallocated(&file, offset + total)?;
        fsio::pwrite_all(&file, &buf, offset)?;
        self.max_epoch.fetch_max(batch_epoch, Ordering::AcqRel);
        Ok(())
    }

    fn ensure_preallocated(&self, file: &File, needed: u64) -> Result<()> {
        if self.prealloc_end.load(Ordering::Acquire) >= needed {
            return Ok(());
        }
        let _g = self.prealloc_mu.lock();
        let cur = self.prealloc_end.load(Ordering::Acquire);
        if cur >= needed {
            return Ok(());
        }
        let target = needed.div_ceil(self.prealloc_chunk) * self.prealloc_chunk;
        fsio::preallocate(file, target)?;
        self.prealloc_end.store(target, Ordering::Release);
        Ok(())
    }

    /// Durability point: fsync the file, plus the directory the first time
    /// so a freshly rotated file itself survives a crash.
    pub fn sync(&self) -> Result<()> {
        let file = {
            let g = self.file.read();
            match g.as_ref() {
                Some(f) => Arc::clone(f),
                None => return Ok(()),
            }
        };
        file.sync_data().context("fsync delta log")?;
        if !self.dir_synced.swap(true, Ordering::AcqRel) {
            if let Some(dir) = self.path.parent() {
                fsio::fsync_dir(dir)?;
            }
        }
        Ok(())
    }

    /// Gate new appends and wait for in-flight appends to drain. Must be
    /// called before `close`.
    pub fn prepare_close(&self) {
        self.closing.store(true, Ordering::Release);
        let mut g = self.drain_mu.lock();
        while self.in_flight.load(Ordering::Acquire) > 0 {
            self.drain_cv.wait_for(&mut g, Duration::from_millis(50));
        }
    }

    /// Close the file: final sync, shed the preallocated tail, release the
    /// handle. Appends after this fail until `open_for_append`.
    pub fn close(&self) -> Result<()> {
        let file = self.file.write().take();
        if let Some(file) = file {
            file.sync_data().context("fsync delta log at close")?;
            fsio::truncate(&file, self.end_offset.load(Ordering::Acquire))?;
            file.sync_data().ok();
        }
        Ok(())
    }

    /// Sequential scan of `path`, invoking `apply` for each verified frame.
    /// A torn or corrupt frame stops the scan; the result reports the
    /// offset of the last fully-validated byte so recovery can truncate.
    /// Only failure to open the file is an error.
    pub fn replay(
        path: &Path,
        mut apply: impl FnMut(&OtDeltaRec, Option<&[u8]>),
    ) -> Result<ReplayResult> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("open delta log for replay: {}", path.display()))?;
        let file_len = file.metadata()?.len();
        let mut res = ReplayResult::default();
        let mut off = 0u64;
        let mut head = [0u8; FRAME_HEADER_SIZE + WIRE_REC_SIZE];
        loop {
            if off + head.len() as u64 > file_len {
                res.truncated_tail = off < file_len;
                break;
            }
            if fsio::pread_exact(&file, &mut head, off).is_err() {
                res.truncated_tail = true;
                break;
            }
            let frame_type = u32::from_le_bytes(head[0..4].try_into().unwrap());
            let payload_size = u32::from_le_bytes(head[4..8].try_into().unwrap());
            let payload_crc = u32::from_le_bytes(head[8..12].try_into().unwrap());
            let header_crc = u32::from_le_bytes(head[12..16].try_into().unwrap());
            if frame_type != FRAME_TYPE_DELTA_ONLY && frame_type != FRAME_TYPE_DELTA_WITH_PAYLOAD {
                res.truncated_tail = true;
                break;
            }
            if payload_size > MAX_REPLAY_PAYLOAD {
                res.truncated_tail = true;
                break;
            }
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&head[0..12]);
            hasher.update(&head[FRAME_HEADER_SIZE..]);
            if hasher.finalize() != header_crc {
                res.truncated_tail = true;
                break;
            }
            let rec = OtDeltaRec::decode(&head[FRAME_HEADER_SIZE..]);
            let mut payload_buf = None;
            if frame_type == FRAME_TYPE_DELTA_WITH_PAYLOAD && payload_size > 0 {
                let p_off = off + head.len() as u64;
                if p_off + payload_size as u64 > file_len {
                    res.truncated_tail = true;
                    break;
                }
                let mut p = vec![0u8; payload_size as usize];
                if fsio::pread_exact(&file, &mut p, p_off).is_err() {
                    res.truncated_tail = true;
                    break;
                }
                let mut h = crc32fast::Hasher::new();
                h.update(&p);
                if h.finalize() != payload_crc {
                    res.truncated_tail = true;
                    break;
                }
                payload_buf = Some(p);
            }
            apply(&rec, payload_buf.as_deref());
            res.frames += 1;
            res.max_epoch = res.max_epoch.max(rec.max_epoch());
            off += head.len() as u64
                + if frame_type == FRAME_TYPE_DELTA_WITH_PAYLOAD { payload_size as u64 } else { 0 };
            res.last_good_offset = off;
        }
        if res.truncated_tail {
            tracing::warn!(
                target: "xtstore::wal",
                "replay of {} stopped at offset {} ({} of {} bytes verified)",
                path.display(), res.last_good_offset, res.last_good_offset, file_len
            );
        }
        Ok(res)
    }

    /// Truncate a log to the last good offset reported by `replay`, making
    /// a subsequent replay clean.
    pub fn truncate_to(path: &Path, offset: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("open delta log for truncate: {}", path.display()))?;
        fsio::truncate(&file, offset)?;
        file.sync_data().ok();
        Ok(())
    }
}

fn encode_frame(buf: &mut Vec<u8>, rec: &OtDeltaRec, payload: Option<&[u8]>) {
    let frame_type = match payload {
        Some(_) => FRAME_TYPE_DELTA_WITH_PAYLOAD,
        None => FRAME_TYPE_DELTA_ONLY,
    };
    let payload_size = payload.map_or(0, |p| p.len() as u32);
    let payload_crc = payload.map_or(0, |p| {
        let mut h = crc32fast::Hasher::new();
        h.update(p);
        h.finalize()
    });
    let mut rec_bytes = Vec::with_capacity(WIRE_REC_SIZE);
    rec.encode_into(&mut rec_bytes);
    debug_assert_eq!(rec_bytes.len(), WIRE_REC_SIZE);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame_type.to_le_bytes());
    hasher.update(&payload_size.to_le_bytes());
    hasher.update(&payload_crc.to_le_bytes());
    hasher.update(&rec_bytes);
    let header_crc = hasher.finalize();

    buf.extend_from_slice(&frame_type.to_le_bytes());
    buf.extend_from_slice(&payload_size.to_le_bytes());
    buf.extend_from_slice(&payload_crc.to_le_bytes());
    buf.extend_from_slice(&header_crc.to_le_bytes());
    buf.extend_from_slice(&rec_bytes);
    if let Some(p) = payload {
        buf.extend_from_slice(p);
    }
}

#[cfg(test)]
#[path = "delta_log_tests.rs"]
mod delta_log_tests;
