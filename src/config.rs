//! Typed configuration for every tunable, loaded from a TOML file with
//! environment overrides (`SHUTTLE_` prefix). Every field has a sane
//! runtime-derived default so nothing requires explicit configuration.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Target split size in bytes for the Block resource manager.
    pub block_split_size: u64,
    /// Target lines per unit for the N-line resource manager.
    pub lines_per_unit: u64,
    /// Default per-unit duplicate-attempt cap during end-game.
    pub duplicate_cap: u32,
    /// Default per-unit retry budget before a stage is failed.
    pub retry_budget: u32,
    /// Fraction of total units, expressed as a percent (0-100), used to
    /// derive `end_game_begin = max(total - 10, total - total * pct / 100)`.
    pub end_game_pct: u32,
    /// Fraction of total units (0-100) that must be done before the
    /// "nearly finished" callback fires.
    pub nearly_finished_pct: u32,
    /// Outbound RPC timeout.
    pub rpc_timeout: Duration,
    /// Outbound RPC retry count.
    pub rpc_retries: u32,
    /// Liveness-monitor bootstrap sleep when no attempt has completed yet.
    pub monitor_bootstrap_interval: Duration,
    /// Liveness-monitor tick interval.
    pub monitor_tick_interval: Duration,
    /// Upper bound on piles in the Shuffle Engine's pile-scale computation.
    pub shuffle_pile_scale_cap: u64,
    /// Floor on piles in the Shuffle Engine's pile-scale computation.
    pub shuffle_pile_scale_floor: u64,
    /// Backoff between Shuffle Engine pile-readiness polls.
    pub shuffle_poll_interval: Duration,
    /// Bounded parallelism for k-way merge iterator initialization.
    pub merge_init_parallelism: usize,
    /// Sorted-file target uncompressed block size, in bytes.
    pub sort_file_block_size: u64,
    /// Sorted-file index sparsification threshold.
    pub sort_file_max_index_entries: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            block_split_size: 64 * 1024 * 1024,
            lines_per_unit: 100_000,
            duplicate_cap: 5,
            retry_budget: 3,
            end_game_pct: 10,
            nearly_finished_pct: 90,
            rpc_timeout: Duration::from_secs(5),
            rpc_retries: 1,
            monitor_bootstrap_interval: Duration::from_secs(30),
            monitor_tick_interval: Duration::from_secs(5),
            shuffle_pile_scale_cap: 300,
            shuffle_pile_scale_floor: 10,
            shuffle_poll_interval: Duration::from_secs(5),
            merge_init_parallelism: num_cpus::get().min(12),
            sort_file_block_size: 64 * 1024,
            sort_file_max_index_entries: 10_000,
        }
    }
}

impl CoreConfig {
    /// `end_game_begin = max(total - 10, total - total * pct / 100)`.
    pub fn end_game_begin(&self, total: u64) -> u64 {
        let a = total.saturating_sub(10);
        let b = total.saturating_sub(total * self.end_game_pct as u64 / 100);
        a.max(b)
    }

    /// Completion threshold for the "nearly finished" callback.
    pub fn nearly_finished_threshold(&self, total: u64) -> u64 {
        total * self.nearly_finished_pct as u64 / 100
    }

    /// Load from a TOML file, falling back to defaults for any field the
    /// file omits and allowing `SHUTTLE_*` environment variables to
    /// override individual keys.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("SHUTTLE").separator("__"))
            .build()
            .map_err(CoreError::config)?;

        match settings.try_deserialize::<PartialConfig>() {
            Ok(partial) => Ok(partial.into_full()),
            Err(e) => Err(CoreError::config(e)),
        }
    }
}

/// Mirrors `CoreConfig` with every field optional so a config file can
/// override a subset of keys; merged onto `CoreConfig::default()`.
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    block_split_size: Option<u64>,
    lines_per_unit: Option<u64>,
    duplicate_cap: Option<u32>,
    retry_budget: Option<u32>,
    end_game_pct: Option<u32>,
    nearly_finished_pct: Option<u32>,
    rpc_timeout_secs: Option<u64>,
    rpc_retries: Option<u32>,
    monitor_bootstrap_interval_secs: Option<u64>,
    monitor_tick_interval_secs: Option<u64>,
    shuffle_pile_scale_cap: Option<u64>,
    shuffle_pile_scale_floor: Option<u64>,
    shuffle_poll_interval_secs: Option<u64>,
    merge_init_parallelism: Option<usize>,
    sort_file_block_size: Option<u64>,
    sort_file_max_index_entries: Option<usize>,
}

impl PartialConfig {
    fn into_full(self) -> CoreConfig {
        let d = CoreConfig::default();
        CoreConfig {
            block_split_size: self.block_split_size.unwrap_or(d.block_split_size),
            lines_per_unit: self.lines_per_unit.unwrap_or(d.lines_per_unit),
            duplicate_cap: self.duplicate_cap.unwrap_or(d.duplicate_cap),
            retry_budget: self.retry_budget.unwrap_or(d.retry_budget),
            end_game_pct: self.end_game_pct.unwrap_or(d.end_game_pct),
            nearly_finished_pct: self.nearly_finished_pct.unwrap_or(d.nearly_finished_pct),
            rpc_timeout: self.rpc_timeout_secs.map(Duration::from_secs).unwrap_or(d.rpc_timeout),
            rpc_retries: self.rpc_retries.unwrap_or(d.rpc_retries),
            monitor_bootstrap_interval: self
                .monitor_bootstrap_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(d.monitor_bootstrap_interval),
            monitor_tick_interval: self
                .monitor_tick_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(d.monitor_tick_interval),
            shuffle_pile_scale_cap: self.shuffle_pile_scale_cap.unwrap_or(d.shuffle_pile_scale_cap),
            shuffle_pile_scale_floor: self.shuffle_pile_scale_floor.unwrap_or(d.shuffle_pile_scale_floor),
            shuffle_poll_interval: self
                .shuffle_poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(d.shuffle_poll_interval),
            merge_init_parallelism: self.merge_init_parallelism.unwrap_or(d.merge_init_parallelism),
            sort_file_block_size: self.sort_file_block_size.unwrap_or(d.sort_file_block_size),
            sort_file_max_index_entries: self
                .sort_file_max_index_entries
                .unwrap_or(d.sort_file_max_index_entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_game_begin_matches_floor_and_pct_formula() {
        let cfg = CoreConfig::default();
        // total=100: max(90, 100 - 10) = 90
        assert_eq!(cfg.end_game_begin(100), 90);
        // total=12: max(2, 12 - 1) = 11 -> matches scenario 5's "10 of 12 completed"
        // once end_game_pct is tuned per-job; default pct=10 gives max(2, 11)=11.
        assert_eq!(cfg.end_game_begin(12), 11);
    }

    #[test]
    fn default_config_has_sane_shuffle_bounds() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.shuffle_pile_scale_floor, 10);
        assert_eq!(cfg.shuffle_pile_scale_cap, 300);
    }
}
