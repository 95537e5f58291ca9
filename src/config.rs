//! Store configuration and durability policy
//! ------------------------------------------
//! Collects the tunables the checkpoint coordinator and the store honor:
//! checkpoint triggers, rotation thresholds, durability mode, and the
//! environment overrides (`XTREE_INGEST_MODE`, `XTREE_OT_SLAB_KB`).

use std::time::Duration;

/// How `commit()` and `try_publish()` trade latency for durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Every commit fsyncs the WAL and superblock before returning.
    Strict,
    /// Commits coalesce within the group-commit window; one fsync per batch.
    Balanced,
    /// Fsync is skipped on commit; small payloads ride in the WAL so a
    /// crash can rehydrate them, and checkpoints run eagerly.
    Eventual,
}

/// Heavy ingest escalates every threshold so steady bulk loads are not
/// interrupted by premature checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Normal,
    Heavy,
}

impl IngestMode {
    pub fn from_env() -> IngestMode {
        match std::env::var("XTREE_INGEST_MODE").ok().as_deref() {
            Some("HEAVY") | Some("heavy") => IngestMode::Heavy,
            _ => IngestMode::Normal,
        }
    }
}

/// Checkpoint / rotation policy for the coordinator.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    /// Checkpoint when WAL bytes since the last checkpoint exceed this (burst bound).
    pub max_replay_bytes: u64,
    /// Same bound under steady load.
    pub steady_replay_bytes: u64,
    /// Time-based trigger.
    pub max_age: Duration,
    /// Shorter time trigger while no writes are arriving.
    pub query_only_age: Duration,
    /// Minimum gap between two checkpoints.
    pub min_interval: Duration,
    /// Rotate the active delta log past this size.
    pub rotate_bytes: u64,
    /// Rotate the active delta log past this age.
    pub rotate_age: Duration,
    /// Payloads up to this size are inlined into WAL frames in EVENTUAL mode.
    pub max_payload_in_wal: u32,
    pub durability_mode: DurabilityMode,
    /// Coalescing window for group commit.
    pub group_commit_interval: Duration,
    pub ingest_mode: IngestMode,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy {
            max_replay_bytes: 256 * 1024 * 1024,
            steady_replay_bytes: 64 * 1024 * 1024,
            max_age: Duration::from_secs(300),
            query_only_age: Duration::from_secs(60),
            min_interval: Duration::from_secs(5),
            rotate_bytes: 128 * 1024 * 1024,
            rotate_age: Duration::from_secs(600),
            max_payload_in_wal: 4096,
            durability_mode: DurabilityMode::Balanced,
            group_commit_interval: Duration::from_millis(3),
            ingest_mode: IngestMode::Normal,
        }
    }
}

impl CheckpointPolicy {
    /// Apply `XTREE_INGEST_MODE` from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        self.ingest_mode = IngestMode::from_env();
        if self.ingest_mode == IngestMode::Heavy {
            self = self.escalated_for_heavy_ingest();
        }
        self
    }

    /// Heavy ingest: 4x every byte/age threshold, wider commit window.
    pub fn escalated_for_heavy_ingest(mut self) -> Self {
        self.max_replay_bytes = self.max_replay_bytes.saturating_mul(4);
        self.steady_replay_bytes = self.steady_replay_bytes.saturating_mul(4);
        self.rotate_bytes = self.rotate_bytes.saturating_mul(4);
        self.max_age = self.max_age.saturating_mul(4);
        self.rotate_age = self.rotate_age.saturating_mul(4);
        self.group_commit_interval = self.group_commit_interval.saturating_mul(2);
        self
    }
}

/// Object-table slab geometry. The slab byte target accepts an environment
/// override in KB, clamped and rounded down to a power of two.
pub mod object_table {
    pub const SLAB_SIZE_ENV_VAR: &str = "XTREE_OT_SLAB_KB";
    pub const SLAB_TARGET_BYTES: usize = 512 * 1024;
    pub const MIN_SLAB_KB: usize = 64;
    pub const MAX_SLAB_KB: usize = 4096;
    /// Fixed outer table: slabs are published into a preallocated slot
    /// array that never resizes.
    pub const MAX_SLABS: usize = 16 * 1024;
    /// Free-handle cache refill batch.
    pub const FREE_CACHE_BATCH: usize = 256;

    pub fn slab_target_bytes_from_env() -> usize {
        let kb = std::env::var(SLAB_SIZE_ENV_VAR)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|kb| (MIN_SLAB_KB..=MAX_SLAB_KB).contains(kb))
            .unwrap_or(SLAB_TARGET_BYTES / 1024);
        kb * 1024
    }
}

/// Top-level store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub policy: CheckpointPolicy,
    /// Number of object-table shards (power of two, ≤ 64).
    pub num_shards: usize,
    /// Capacity of each per-class segment file.
    pub segment_bytes: u64,
    /// WAL preallocation chunk.
    pub wal_prealloc_chunk: u64,
    /// Dead/total ratio above which a segment is a compaction candidate.
    pub compaction_threshold: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            policy: CheckpointPolicy::default(),
            num_shards: 8,
            segment_bytes: 4 * 1024 * 1024,
            wal_prealloc_chunk: 64 * 1024 * 1024,
            compaction_threshold: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heavy_ingest_escalates_thresholds() {
        let base = CheckpointPolicy::default();
        let heavy = base.clone().escalated_for_heavy_ingest();
        assert_eq!(heavy.max_replay_bytes, base.max_replay_bytes * 4);
        assert_eq!(heavy.steady_replay_bytes, base.steady_replay_bytes * 4);
        assert_eq!(heavy.rotate_bytes, base.rotate_bytes * 4);
        assert_eq!(heavy.max_age, base.max_age * 4);
        assert_eq!(heavy.group_commit_interval, base.group_commit_interval * 2);
    }

    // One test owns the env var end to end; parallel tests mutating the
    // same process environment would race.
    #[test]
    fn slab_env_override_is_bounded() {
        std::env::remove_var(object_table::SLAB_SIZE_ENV_VAR);
        assert_eq!(
            object_table::slab_target_bytes_from_env(),
            object_table::SLAB_TARGET_BYTES
        );
        // Below the floor: ignored.
        std::env::set_var(object_table::SLAB_SIZE_ENV_VAR, "16");
        assert_eq!(
            object_table::slab_target_bytes_from_env(),
            object_table::SLAB_TARGET_BYTES
        );
        // In range: honored.
        std::env::set_var(object_table::SLAB_SIZE_ENV_VAR, "1024");
        assert_eq!(object_table::slab_target_bytes_from_env(), 1024 * 1024);
        std::env::remove_var(object_table::SLAB_SIZE_ENV_VAR);
    }
}
