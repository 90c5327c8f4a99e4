//! Coordinator: the active-jobs table and the concrete `CoordinatorApi`
//! implementation. Mutated only on submit/kill; reads (listing, task
//! routing) go through `dashmap`'s per-shard locking rather than a single
//! coarse lock, since the control-plane RPC handlers run one task per
//! inbound request.

use crate::checkpoint::{CheckpointManager, JobSnapshot};
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::job::Job;
use crate::resource::ResourceManager;
use crate::rpc::{AssignStatus, AttemptState, CoordinatorApi, JobSummary, WorkerApi};
use crate::stage::{AssignOutcome, ClusterRuntime, StageConfig};
use crate::tracker::{JobTracker, NodeSpec};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Wire shape of `SubmitJob`'s descriptor argument: node list, each node's
/// successors, and per-node resource/stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    pub nodes: Vec<NodeDescriptor>,
    pub successors: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeDescriptor {
    pub input: InputDescriptor,
    pub capacity: u32,
    #[serde(default)]
    pub retry_budget: Option<u32>,
    #[serde(default)]
    pub duplicates_enabled: bool,
    #[serde(default)]
    pub duplicate_cap: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputDescriptor {
    Id { count: u64 },
    Block { files: Vec<(String, u64)>, split_size: u64 },
    NLine { files: Vec<(String, u64)>, lines_per_unit: u64 },
    Sequence { files: Vec<(String, u64)>, records_per_unit: u64 },
}

pub struct Coordinator {
    core_config: Arc<CoreConfig>,
    cluster: Arc<dyn ClusterRuntime>,
    worker_api: Arc<dyn WorkerApi>,
    checkpoint: Arc<CheckpointManager>,
    jobs: DashMap<Uuid, JobTracker>,
}

impl Coordinator {
    pub fn new(
        core_config: Arc<CoreConfig>,
        cluster: Arc<dyn ClusterRuntime>,
        worker_api: Arc<dyn WorkerApi>,
        checkpoint: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            core_config,
            cluster,
            worker_api,
            checkpoint,
            jobs: DashMap::new(),
        }
    }

    fn build_node_spec(&self, node: &NodeDescriptor) -> Result<NodeSpec> {
        let resource = match &node.input {
            InputDescriptor::Id { count } => ResourceManager::new_id(*count),
            InputDescriptor::Block { files, split_size } => ResourceManager::new_block(files, *split_size)?,
            InputDescriptor::NLine { files, lines_per_unit } => ResourceManager::new_n_line(files, *lines_per_unit)?,
            InputDescriptor::Sequence { files, records_per_unit } => {
                ResourceManager::new_sequence(files, *records_per_unit)?
            }
        };
        Ok(NodeSpec {
            resource,
            config: StageConfig {
                capacity: node.capacity,
                retry_budget: node.retry_budget.unwrap_or(self.core_config.retry_budget),
                duplicates_enabled: node.duplicates_enabled,
                duplicate_cap: node.duplicate_cap.unwrap_or(self.core_config.duplicate_cap),
            },
        })
    }

    /// Rebuilds a `JobTracker` from a checkpointed snapshot and registers it,
    /// for the startup resume path (a fresh coordinator process taking over
    /// jobs that were active when the previous one died).
    pub fn resume_job(&self, snapshot: JobSnapshot) -> Result<Uuid> {
        let job_id = snapshot.job.id;
        let tracker = JobTracker::resume(
            snapshot,
            self.core_config.clone(),
            self.cluster.clone(),
            self.worker_api.clone(),
            self.checkpoint.clone(),
        )?;
        self.jobs.insert(job_id, tracker);
        Ok(job_id)
    }

    /// Drops jobs that reached a terminal state before `now`, mirroring the
    /// dead-table TTL on `Job::expired`. Called periodically by whatever
    /// polls the active-jobs table; not wired to a timer here since the
    /// timer itself is deployment-specific.
    pub fn evict_expired(&self, now: chrono::DateTime<chrono::Utc>) {
        self.jobs.retain(|_, tracker| !tracker.job().expired(now));
    }
}

#[async_trait]
impl CoordinatorApi for Coordinator {
    async fn submit_job(&self, descriptor_json: String) -> Result<Uuid> {
        let descriptor: JobDescriptor =
            serde_json::from_str(&descriptor_json).map_err(|e| CoreError::InvalidDescriptor(e.to_string()))?;
        if descriptor.nodes.len() != descriptor.successors.len() {
            return Err(CoreError::InvalidDescriptor(format!(
                "{} node descriptors for {} successor lists",
                descriptor.nodes.len(),
                descriptor.successors.len()
            )));
        }
        let node_specs = descriptor
            .nodes
            .iter()
            .map(|n| self.build_node_spec(n))
            .collect::<Result<Vec<_>>>()?;

        let job = Job::new_pending(descriptor.name, descriptor.priority);
        let job_id = job.id;
        let tracker = JobTracker::new(
            job,
            descriptor.successors,
            node_specs,
            self.core_config.clone(),
            self.cluster.clone(),
            self.worker_api.clone(),
            self.checkpoint.clone(),
        )?;
        tracker.start();
        self.jobs.insert(job_id, tracker);
        tracing::info!(%job_id, "job submitted");
        Ok(job_id)
    }

    async fn update_job(&self, job_id: Uuid, priority: Option<i32>, capacities: Vec<(usize, u32)>) -> Result<()> {
        let tracker = self.jobs.get(&job_id).ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;
        tracker.update(priority, &capacities);
        Ok(())
    }

    async fn kill_job(&self, job_id: Uuid) -> Result<()> {
        let tracker = self.jobs.get(&job_id).ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;
        tracker.kill("operator requested".to_string());
        Ok(())
    }

    async fn list_jobs(&self, include_dead: bool) -> Result<Vec<JobSummary>> {
        Ok(self
            .jobs
            .iter()
            .map(|entry| entry.value().job())
            .filter(|job| include_dead || !job.state.is_terminal())
            .map(|job| JobSummary {
                job_id: job.id,
                name: job.name,
                state_name: job.state.state_name(),
            })
            .collect())
    }

    async fn assign_task(&self, job_id: Uuid, node: usize, endpoint: String) -> Result<AssignStatus> {
        let tracker = match self.jobs.get(&job_id) {
            Some(t) => t,
            None => return Ok(AssignStatus::NoSuchJob),
        };
        match tracker.assign(node, &endpoint)? {
            AssignOutcome::Unit {
                unit_no,
                attempt_no,
                input,
                ..
            } => Ok(AssignStatus::Ok {
                node,
                unit_no,
                attempt_no,
                input,
            }),
            AssignOutcome::NoMore => Ok(AssignStatus::NoMore),
            AssignOutcome::Wait => Ok(AssignStatus::Suspend),
        }
    }

    async fn finish_task(
        &self,
        job_id: Uuid,
        node: usize,
        unit_no: u64,
        attempt_no: u32,
        state: AttemptState,
        endpoint: String,
    ) -> Result<()> {
        let tracker = self.jobs.get(&job_id).ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;
        tracker.finish(node, unit_no, attempt_no, &endpoint, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LoggingWorkerApi;
    use crate::stage::LoggingClusterRuntime;

    async fn coordinator() -> Coordinator {
        let checkpoint = Arc::new(CheckpointManager::new_in_memory().await.unwrap());
        Coordinator::new(
            Arc::new(CoreConfig::default()),
            Arc::new(LoggingClusterRuntime),
            Arc::new(LoggingWorkerApi),
            checkpoint,
        )
    }

    fn descriptor_json() -> String {
        serde_json::json!({
            "name": "word-count",
            "priority": 0,
            "nodes": [
                {"input": {"kind": "id", "count": 3}, "capacity": 2},
                {"input": {"kind": "id", "count": 1}, "capacity": 2},
            ],
            "successors": [[1], []],
        })
        .to_string()
    }

    #[tokio::test]
    async fn submit_then_list_shows_running_job() {
        let coord = coordinator().await;
        let job_id = coord.submit_job(descriptor_json()).await.unwrap();
        let jobs = coord.list_jobs(false).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, job_id);
        assert_eq!(jobs[0].state_name, "running");
    }

    #[tokio::test]
    async fn submit_rejects_cyclic_dag() {
        let coord = coordinator().await;
        let bad = serde_json::json!({
            "name": "cyclic",
            "nodes": [
                {"input": {"kind": "id", "count": 1}, "capacity": 1},
                {"input": {"kind": "id", "count": 1}, "capacity": 1},
            ],
            "successors": [[1], [0]],
        })
        .to_string();
        assert!(coord.submit_job(bad).await.is_err());
    }

    #[tokio::test]
    async fn assign_task_routes_to_the_right_node() {
        let coord = coordinator().await;
        let job_id = coord.submit_job(descriptor_json()).await.unwrap();
        match coord.assign_task(job_id, 0, "w1".to_string()).await.unwrap() {
            AssignStatus::Ok { node, .. } => assert_eq!(node, 0),
            other => panic!("expected Ok, got {other:?}"),
        }
        match coord.assign_task(job_id, 1, "w1".to_string()).await.unwrap() {
            AssignStatus::Suspend => {}
            other => panic!("expected Suspend (node 1 depends on node 0), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn assign_task_on_unknown_job_reports_no_such_job() {
        let coord = coordinator().await;
        let outcome = coord.assign_task(Uuid::new_v4(), 0, "w1".to_string()).await.unwrap();
        assert!(matches!(outcome, AssignStatus::NoSuchJob));
    }

    #[tokio::test]
    async fn submit_job_with_sequence_file_input_splits_into_record_ranges() {
        let coord = coordinator().await;
        let descriptor = serde_json::json!({
            "name": "sequence-source",
            "nodes": [
                {"input": {"kind": "sequence", "files": [["in.seq", 25]], "records_per_unit": 10}, "capacity": 2},
            ],
            "successors": [[]],
        })
        .to_string();
        let job_id = coord.submit_job(descriptor).await.unwrap();

        let mut units = Vec::new();
        loop {
            match coord.assign_task(job_id, 0, "w1".to_string()).await.unwrap() {
                AssignStatus::Ok { unit_no, input, .. } => units.push((unit_no, input)),
                AssignStatus::NoMore => break,
                other => panic!("expected Ok or NoMore, got {other:?}"),
            }
        }
        assert_eq!(units.len(), 3);
    }

    #[tokio::test]
    async fn kill_job_transitions_it_to_killed() {
        let coord = coordinator().await;
        let job_id = coord.submit_job(descriptor_json()).await.unwrap();
        coord.kill_job(job_id).await.unwrap();
        let jobs = coord.list_jobs(true).await.unwrap();
        assert_eq!(jobs[0].state_name, "killed");
    }
}
