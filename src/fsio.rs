//! Platform filesystem helpers
//! ---------------------------
//! Positional reads/writes, durable file + directory syncs, preallocation,
//! and the temp-write → fsync → rename → dir-fsync publish idiom used by
//! the manifest, checkpoints and the superblock. On Windows directory
//! fsync is a no-op and rename-over is emulated by remove + rename.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Write the whole buffer at an absolute offset, independent of the file
/// cursor. Safe for concurrent writers at disjoint offsets.
pub fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    #[cfg(unix)]
    {
        file.write_all_at(buf, offset).context("pwrite")
    }
    #[cfg(windows)]
    {
        let mut buf = buf;
        let mut offset = offset;
        while !buf.is_empty() {
            let n = file.seek_write(buf, offset).context("seek_write")?;
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

/// Read exactly `buf.len()` bytes at an absolute offset.
pub fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    #[cfg(unix)]
    {
        file.read_exact_at(buf, offset).context("pread")
    }
    #[cfg(windows)]
    {
        let mut buf = buf;
        let mut offset = offset;
        while !buf.is_empty() {
            let n = file.seek_read(buf, offset).context("seek_read")?;
            if n == 0 {
                anyhow::bail!("unexpected eof at offset {}", offset);
            }
            let (_, rest) = std::mem::take(&mut buf).split_at_mut(n);
            buf = rest;
            offset += n as u64;
        }
        Ok(())
    }
}

/// Fsync a directory so a rename or file creation inside it is durable.
/// Not all platforms expose a stable dir fsync; attempt to open and sync.
pub fn fsync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let f = File::open(dir).with_context(|| format!("open dir {}", dir.display()))?;
        f.sync_all()
            .with_context(|| format!("fsync dir {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Write `bytes` to `final_path` atomically: temp file in the same
/// directory, fsync, rename over, fsync the directory. The rename is the
/// linearization point.
pub fn atomic_publish(final_path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = final_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    std::fs::create_dir_all(&dir).ok();
    let tmp_path = final_path.with_extension("next");
    {
        let mut f = File::create(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;
        f.write_all(bytes)?;
        f.flush()?;
        f.sync_all()
            .with_context(|| format!("fsync {}", tmp_path.display()))?;
    }
    // On Windows, no atomic rename-overwrite. Emulate by removing old then renaming.
    #[cfg(windows)]
    if final_path.exists() {
        let _ = std::fs::remove_file(final_path);
    }
    std::fs::rename(&tmp_path, final_path).with_context(|| {
        format!("rename {} -> {}", tmp_path.display(), final_path.display())
    })?;
    fsync_dir(&dir)?;
    Ok(())
}

/// Extend a file to `len` bytes (zero-filled) to amortize metadata writes.
/// No-op if the file is already at least that long.
pub fn preallocate(file: &File, len: u64) -> Result<()> {
    let cur = file.metadata().context("stat for preallocate")?.len();
    if cur < len {
        file.set_len(len).context("set_len for preallocate")?;
    }
    Ok(())
}

/// Truncate a file to exactly `len` bytes. Used by recovery to drop a torn
/// tail and by close to shed the preallocated region.
pub fn truncate(file: &File, len: u64) -> Result<()> {
    file.set_len(len).context("truncate")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_io_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("pio.bin");
        let f = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&p)
            .unwrap();
        preallocate(&f, 64).unwrap();
        pwrite_all(&f, b"hello", 10).unwrap();
        pwrite_all(&f, b"world", 40).unwrap();
        let mut buf = [0u8; 5];
        pread_exact(&f, &mut buf, 40).unwrap();
        assert_eq!(&buf, b"world");
        pread_exact(&f, &mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn atomic_publish_replaces_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("meta").join("manifest.json");
        atomic_publish(&p, b"{\"v\":1}").unwrap();
        assert_eq!(std::fs::read(&p).unwrap(), b"{\"v\":1}");
        atomic_publish(&p, b"{\"v\":2}").unwrap();
        assert_eq!(std::fs::read(&p).unwrap(), b"{\"v\":2}");
        // No temp residue
        assert!(!p.with_extension("next").exists());
    }

    #[test]
    fn truncate_drops_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("t.bin");
        let f = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&p)
            .unwrap();
        pwrite_all(&f, &[0xAAu8; 100], 0).unwrap();
        truncate(&f, 30).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 30);
    }
}
