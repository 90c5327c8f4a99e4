//! Coordinator-fatal resume path: persists one snapshot per
//! job after every stage transition (`Start`, completion, failure, kill)
//! and lets a freshly-elected leader rebuild Job/DAG Scheduler/Stage
//! Controller state from the latest snapshot, rather than replaying RPC
//! history. Backed by `sqlx::SqlitePool`.

use crate::dag::DagScheduler;
use crate::error::{CoreError, Result};
use crate::job::Job;
use crate::resource::ResourceManager;
use crate::stage::StageConfig;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

/// Per-node state captured at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: usize,
    pub resource: ResourceManager,
    pub config: StageConfig,
}

/// Everything the Job Tracker needs to resume a job without replaying RPC
/// history: the job's coarse state, the DAG's edge-independent successor
/// lists plus its in-degree/started vectors, and every stage's Resource
/// Manager and config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: Job,
    pub successors: Vec<Vec<usize>>,
    pub dag_in_degree: Vec<i64>,
    pub dag_started: Vec<bool>,
    pub nodes: Vec<NodeSnapshot>,
}

impl JobSnapshot {
    /// Rebuilds a `DagScheduler` from the recorded edges and progress.
    pub fn restore_dag(&self) -> Result<DagScheduler> {
        DagScheduler::restore(self.successors.clone(), self.dag_in_degree.clone(), self.dag_started.clone())
    }

    /// Resource Managers with every in-flight (`Allocated`) unit reset to
    /// `Pending` — attempts are never resumed in-flight across a
    /// coordinator restart.
    pub fn restored_resources(&self) -> Vec<(usize, ResourceManager, StageConfig)> {
        self.nodes
            .iter()
            .map(|n| {
                let mut resource = n.resource.clone();
                resource.reset_in_flight();
                (n.node, resource, n.config.clone())
            })
            .collect()
    }
}

pub struct CheckpointManager {
    pool: SqlitePool,
}

impl CheckpointManager {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let mgr = Self { pool };
        mgr.migrate().await?;
        Ok(mgr)
    }

    /// In-memory pool, for tests and single-shot local runs.
    pub async fn new_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_snapshots (
                job_id TEXT PRIMARY KEY,
                snapshot BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrites the job's snapshot. Called after every stage transition;
    /// the primary-key upsert means only the latest state is ever kept.
    pub async fn save_snapshot(&self, job_id: Uuid, snapshot: &JobSnapshot) -> Result<()> {
        let encoded = bincode::serialize(snapshot)?;
        sqlx::query(
            "INSERT INTO job_snapshots (job_id, snapshot, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(job_id) DO UPDATE SET snapshot = excluded.snapshot, updated_at = excluded.updated_at",
        )
        .bind(job_id.to_string())
        .bind(encoded)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_snapshot(&self, job_id: Uuid) -> Result<Option<JobSnapshot>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT snapshot FROM job_snapshots WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((bytes,)) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All job ids with a live snapshot, for the newly-elected leader to
    /// resume at startup.
    pub async fn active_job_ids(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT job_id FROM job_snapshots")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(s,)| Uuid::parse_str(&s).map_err(|e| CoreError::PersistedStateCorrupted(e.to_string())))
            .collect()
    }

    pub async fn delete_snapshot(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM job_snapshots WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
