//! Shuffle Engine: runs on a worker ahead of a non-source stage's user
//! code. Pre-merges sorted partition files produced by predecessor-stage
//! units into a bounded number of "piles" (to keep the final merge's
//! fan-in small regardless of predecessor unit count), then k-way merges
//! the piles, restricted to one partition's key range, into the ordered
//! stream the user-code wrapper consumes.

use crate::codec::sort_file::{SortFileReader, SortFileWriter};
use crate::config::CoreConfig;
use crate::dfs::Dfs;
use crate::error::{CoreError, Result};
use crate::merge::{KWayMerge, Record, SourceIter};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Hand-off mode to the external user-code wrapper. The engine itself is
/// agnostic to which is selected; this only threads the choice through to
/// `OutputSink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeliveryMode {
    Streaming,
    Bistream,
}

/// Abstracts the boundary to the external user-code subprocess: streaming
/// records out (newline-delimited or length-prefixed, per `DeliveryMode`)
/// is a deployment detail the core does not own.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn deliver(&self, mode: DeliveryMode, record: Record) -> Result<()>;
    async fn finish(&self) -> Result<()>;
}

/// `min(ceil(sqrt(total)), cap)`, floored at `floor`.
pub fn pile_scale(total_units: u64, cap: u64, floor: u64) -> u64 {
    let raw = (total_units as f64).sqrt().ceil() as u64;
    raw.min(cap).max(floor)
}

pub fn pile_count(total_units: u64, scale: u64) -> u64 {
    if total_units == 0 {
        return 0;
    }
    (total_units + scale - 1) / scale
}

/// `[cur * scale, min((cur+1) * scale - 1, total-1)]` over upstream unit
/// numbering.
pub fn pile_range(cur: u64, scale: u64, total_units: u64) -> (u64, u64) {
    let start = cur * scale;
    let end = ((cur + 1) * scale).saturating_sub(1).min(total_units.saturating_sub(1));
    (start, end)
}

fn partition_prefix(partition: u32) -> Vec<u8> {
    format!("partition-{partition:05}:").into_bytes()
}

fn strip_partition_prefix(key: Vec<u8>, partition: u32) -> Vec<u8> {
    let prefix = partition_prefix(partition);
    if key.starts_with(&prefix) {
        key[prefix.len()..].to_vec()
    } else {
        key
    }
}

/// Opens `path` as a sorted file and returns a source restricted to keys
/// carrying `partition`'s prefix, for merging.
fn open_partition_source(path: &Path, partition: u32) -> Result<SourceIter> {
    let reader = SortFileReader::open(path)?;
    let prefix = partition_prefix(partition);
    let records = reader.scan_all()?;
    let filtered: Vec<Record> = records.into_iter().filter(|(k, _)| k.starts_with(&prefix)).collect();
    Ok(Box::new(filtered.into_iter().map(Ok)))
}

/// Merges the predecessor stage's per-unit sorted output for one
/// partition into the ordered stream the next stage's user code consumes.
pub struct ShuffleEngine {
    dfs: Arc<dyn Dfs>,
    local_root: PathBuf,
    work_dir: String,
    partition: u32,
    total_units: u64,
    pile_scale_cap: u64,
    pile_scale_floor: u64,
    poll_interval: Duration,
    merge_init_parallelism: usize,
}

impl ShuffleEngine {
    pub fn new(
        dfs: Arc<dyn Dfs>,
        local_root: impl Into<PathBuf>,
        work_dir: impl Into<String>,
        partition: u32,
        total_units: u64,
        config: &CoreConfig,
    ) -> Self {
        Self {
            dfs,
            local_root: local_root.into(),
            work_dir: work_dir.into(),
            partition,
            total_units,
            pile_scale_cap: config.shuffle_pile_scale_cap,
            pile_scale_floor: config.shuffle_pile_scale_floor,
            poll_interval: config.shuffle_poll_interval,
            merge_init_parallelism: config.merge_init_parallelism,
        }
    }

    fn local_path(&self, rel: &str) -> PathBuf {
        self.local_root.join(rel.trim_start_matches('/'))
    }

    fn unit_file(&self, unit: u64) -> String {
        format!("{}/unit-{unit}.sort", self.work_dir)
    }

    fn pile_file(&self, pile: u64) -> String {
        format!("{}/{pile}.pile", self.work_dir)
    }

    /// Runs the pre-merge/publish loop followed by the final merge,
    /// delivering every record in `mode` to `sink`.
    pub async fn run(&self, mode: DeliveryMode, sink: &dyn OutputSink) -> Result<()> {
        let scale = pile_scale(self.total_units, self.pile_scale_cap, self.pile_scale_floor);
        let pile_num = pile_count(self.total_units, scale);

        let mut pending: Vec<u64> = (0..pile_num).collect();
        pending.shuffle(&mut rand::thread_rng());

        loop {
            let mut still_pending = Vec::new();
            for pile in pending {
                if self.dfs.exists(&self.pile_file(pile)).await? {
                    continue;
                }
                if !self.try_publish_pile(pile, scale).await? {
                    still_pending.push(pile);
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        self.final_merge(pile_num, mode, sink).await
    }

    /// Attempts to assemble and publish one pile. Returns `Ok(false)` if
    /// some unit in the pile's range has not produced output yet (not a
    /// failure, since upstream may simply be late); the caller retries.
    async fn try_publish_pile(&self, pile: u64, scale: u64) -> Result<bool> {
        let (start, end) = pile_range(pile, scale, self.total_units);
        let mut rels = Vec::new();
        for unit in start..=end {
            let rel = self.unit_file(unit);
            if !self.dfs.exists(&rel).await? {
                return Ok(false);
            }
            rels.push(rel);
        }

        let sources: Result<Vec<SourceIter>> = rels
            .iter()
            .map(|rel| open_partition_source(&self.local_path(rel), self.partition))
            .collect();
        let merged = KWayMerge::new(sources?, self.merge_init_parallelism)?;

        let tmp_rel = format!(
            "{}/pile_{}_{}/{}.pile",
            self.work_dir,
            self.partition,
            uuid::Uuid::new_v4(),
            self.partition
        );
        let tmp_local = self.local_path(&tmp_rel);
        if let Some(parent) = tmp_local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = SortFileWriter::create(&tmp_local, 64 * 1024, 10_000)?;
        for record in merged {
            let (key, value) = record?;
            writer.append(key, value)?;
        }
        writer.finish()?;

        let final_rel = self.pile_file(pile);
        if self.dfs.exists(&final_rel).await? {
            self.dfs.remove(&tmp_rel).await.ok();
            return Ok(true);
        }
        self.dfs.rename(&tmp_rel, &final_rel).await?;
        Ok(true)
    }

    async fn final_merge(&self, pile_num: u64, mode: DeliveryMode, sink: &dyn OutputSink) -> Result<()> {
        let mut sources = Vec::with_capacity(pile_num as usize);
        for pile in 0..pile_num {
            let local = self.local_path(&self.pile_file(pile));
            sources.push(open_partition_source(&local, self.partition)?);
        }
        let merged = KWayMerge::new(sources, self.merge_init_parallelism)?;
        for record in merged {
            let (key, value) = record.map_err(|e| CoreError::codec(format!("final merge: {e}")))?;
            sink.deliver(mode, (strip_partition_prefix(key, self.partition), value)).await?;
        }
        sink.finish().await
    }
}
