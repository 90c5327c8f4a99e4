//! Job Tracker: owns one Stage Controller per DAG node for a
//! single job, routes `Assign`/`Finish` to the right controller, and
//! drives the DAG Scheduler forward via the nearly-finished/finished
//! callbacks wired into each Stage Controller at construction time.
//! One entry point per job (`JobTracker::start`), fanning out over an
//! arbitrary DAG rather than a fixed stage count.

use crate::checkpoint::{CheckpointManager, JobSnapshot, NodeSnapshot};
use crate::config::CoreConfig;
use crate::dag::DagScheduler;
use crate::error::{CoreError, ErrorCategory, Result};
use crate::job::{Job, JobStateMachine};
use crate::resource::ResourceManager;
use crate::rpc::{AttemptState, WorkerApi};
use crate::stage::{AssignOutcome, ClusterRuntime, StageConfig, StageController, StageOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Per-node construction input: the Resource Manager already reflects
/// that node's partitioned input, independent of the DAG
/// edges supplied separately.
pub struct NodeSpec {
    pub resource: ResourceManager,
    pub config: StageConfig,
}

struct TrackerState {
    job: Job,
    dag: DagScheduler,
}

/// Shared, self-referential core. Stage Controller callbacks close over a
/// `Weak<Inner>` rather than an `Arc`, so `controllers` (held by `Inner`)
/// holding closures that reference `Inner` does not form a reference
/// cycle that would leak the job forever.
struct Inner {
    job_id: Uuid,
    core_config: Arc<CoreConfig>,
    cluster: Arc<dyn ClusterRuntime>,
    worker_api: Arc<dyn WorkerApi>,
    checkpoint: Arc<CheckpointManager>,
    state: Mutex<TrackerState>,
    controllers: Mutex<HashMap<usize, Arc<StageController>>>,
}

impl Inner {
    fn controller(&self, node: usize) -> Result<Arc<StageController>> {
        self.controllers
            .lock()
            .unwrap()
            .get(&node)
            .cloned()
            .ok_or(CoreError::StageNotFound(node))
    }

    /// Marks `node` started in the DAG bookkeeping (idempotent: a node
    /// already marked is left alone), requests worker provisioning, and
    /// spawns that stage's liveness monitor.
    fn start_node(self: &Arc<Self>, node: usize) {
        {
            let mut state = self.state.lock().unwrap();
            if state.dag.is_started(node) {
                return;
            }
            let _ = state.dag.mark_started(node);
        }
        if let Ok(ctrl) = self.controller(node) {
            ctrl.start();
            tokio::spawn(ctrl.run_monitor());
        }
        self.persist();
    }

    /// *nearly-finished*: speculatively start every direct successor whose
    /// only unfinished predecessor is the node that just fired.
    fn on_nearly_finished(self: &Arc<Self>, node: usize) {
        let candidates: Vec<usize> = {
            let state = self.state.lock().unwrap();
            state
                .dag
                .next_nodes(Some(node))
                .into_iter()
                .filter(|&succ| state.dag.in_degree(succ) == Some(1))
                .collect()
        };
        for succ in candidates {
            self.start_node(succ);
        }
    }

    /// *finished(completed|failed|killed)*: cascade through the DAG or
    /// tear the job down
    fn on_finished(self: &Arc<Self>, node: usize, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Completed => {
                let newly_available = {
                    let mut state = self.state.lock().unwrap();
                    state.dag.remove_finished_node(node).unwrap_or_default()
                };
                for succ in &newly_available {
                    self.start_node(*succ);
                }
                let done = {
                    let state = self.state.lock().unwrap();
                    state.dag.unfinished_nodes() == 0
                };
                if done {
                    self.transition(|sm| sm.complete());
                    self.persist();
                    self.retire();
                } else {
                    self.persist();
                }
            }
            StageOutcome::Failed => {
                self.kill_other_stages(node);
                self.transition(|sm| {
                    sm.fail("stage retry budget exhausted".to_string(), ErrorCategory::StageFailure, node)
                });
                self.persist();
                self.retire();
            }
            StageOutcome::Killed => {
                self.kill_other_stages(node);
                self.transition(|sm| sm.kill(format!("stage {node} killed")));
                self.persist();
                self.retire();
            }
        }
    }

    fn kill_other_stages(&self, except: usize) {
        let controllers = self.controllers.lock().unwrap();
        for (&node, ctrl) in controllers.iter() {
            if node != except && !ctrl.state().is_terminal() {
                ctrl.kill();
            }
        }
    }

    /// Applies a `JobStateMachine` transition to the tracked `Job`,
    /// logging but not propagating a transition that is no longer legal
    /// (e.g. two sibling stages both reporting a terminal outcome).
    fn transition<F>(&self, f: F)
    where
        F: FnOnce(&mut JobStateMachine) -> Result<()>,
    {
        let mut state = self.state.lock().unwrap();
        let mut sm = JobStateMachine::new(state.job.clone());
        match f(&mut sm) {
            Ok(()) => state.job = sm.into_job(),
            Err(e) => tracing::warn!(job_id = %self.job_id, error = %e, "job state transition rejected"),
        }
    }

    fn retire(&self) {
        let checkpoint = self.checkpoint.clone();
        let job_id = self.job_id;
        tokio::spawn(async move {
            if let Err(e) = checkpoint.delete_snapshot(job_id).await {
                tracing::warn!(%job_id, error = %e, "failed to delete checkpoint for retired job");
            }
        });
    }

    /// Persists a fresh snapshot. Fire-and-forget: a missed checkpoint
    /// only costs the next coordinator restart some replayed progress, it
    /// never corrupts in-memory state.
    fn persist(self: &Arc<Self>) {
        let snapshot = self.snapshot();
        let checkpoint = self.checkpoint.clone();
        let job_id = self.job_id;
        tokio::spawn(async move {
            if let Err(e) = checkpoint.save_snapshot(job_id, &snapshot).await {
                tracing::warn!(%job_id, error = %e, "failed to persist job checkpoint");
            }
        });
    }

    fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock().unwrap();
        let (dag_in_degree, dag_started) = state.dag.snapshot();
        let controllers = self.controllers.lock().unwrap();
        let mut nodes: Vec<NodeSnapshot> = controllers
            .iter()
            .map(|(&node, ctrl)| NodeSnapshot {
                node,
                resource: ctrl.resource_snapshot(),
                config: ctrl.stage_config(),
            })
            .collect();
        nodes.sort_by_key(|n| n.node);
        JobSnapshot {
            job: state.job.clone(),
            successors: successors_from_dag(&state.dag),
            dag_in_degree,
            dag_started,
            nodes,
        }
    }
}

/// Recovers the original successor adjacency list from the live scheduler
/// so it can be embedded in a snapshot (the scheduler does not keep the
/// caller's original `Vec<Vec<usize>>` around verbatim).
fn successors_from_dag(dag: &DagScheduler) -> Vec<Vec<usize>> {
    (0..dag.node_count()).map(|n| dag.next_nodes(Some(n))).collect()
}

pub struct JobTracker {
    inner: Arc<Inner>,
}

impl JobTracker {
    /// Builds a tracker for a freshly-submitted job: validates the DAG
    /// (rejecting cycles), instantiates one Stage Controller per node, and
    /// wires each controller's callbacks back into this tracker without
    /// creating an `Arc` reference cycle.
    pub fn new(
        job: Job,
        successors: Vec<Vec<usize>>,
        node_specs: Vec<NodeSpec>,
        core_config: Arc<CoreConfig>,
        cluster: Arc<dyn ClusterRuntime>,
        worker_api: Arc<dyn WorkerApi>,
        checkpoint: Arc<CheckpointManager>,
    ) -> Result<Self> {
        if node_specs.len() != successors.len() {
            return Err(CoreError::InvalidDescriptor(format!(
                "{} node specs for {} dag nodes",
                node_specs.len(),
                successors.len()
            )));
        }
        let dag = DagScheduler::new(successors)?;
        let job_id = job.id;

        let inner = Arc::new(Inner {
            job_id,
            core_config: core_config.clone(),
            cluster: cluster.clone(),
            worker_api: worker_api.clone(),
            checkpoint,
            state: Mutex::new(TrackerState { job, dag }),
            controllers: Mutex::new(HashMap::new()),
        });

        let mut controllers = HashMap::with_capacity(node_specs.len());
        for (node, spec) in node_specs.into_iter().enumerate() {
            let weak = Arc::downgrade(&inner);
            let weak2 = weak.clone();
            let ctrl = StageController::new(
                job_id,
                node,
                spec.resource,
                spec.config,
                core_config.clone(),
                cluster.clone(),
                worker_api.clone(),
                Arc::new(move |n| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_nearly_finished(n);
                    }
                }),
                Arc::new(move |n, outcome| {
                    if let Some(inner) = weak2.upgrade() {
                        inner.on_finished(n, outcome);
                    }
                }),
            );
            controllers.insert(node, ctrl);
        }
        *inner.controllers.lock().unwrap() = controllers;

        Ok(Self { inner })
    }

    /// Rebuilds a tracker from the latest checkpoint after a coordinator
    /// restart: in-flight attempts are not resumed, only the completed
    /// and pending fractions of each Resource Manager survive. Stages that
    /// were already running when the snapshot was taken have their
    /// liveness monitor respawned immediately.
    pub fn resume(
        snapshot: JobSnapshot,
        core_config: Arc<CoreConfig>,
        cluster: Arc<dyn ClusterRuntime>,
        worker_api: Arc<dyn WorkerApi>,
        checkpoint: Arc<CheckpointManager>,
    ) -> Result<Self> {
        let dag = snapshot.restore_dag()?;
        let job_id = snapshot.job.id;
        let started_nodes: Vec<usize> = snapshot
            .dag_started
            .iter()
            .enumerate()
            .filter(|&(_, &started)| started)
            .map(|(node, _)| node)
            .collect();
        let restored = snapshot.restored_resources();

        let inner = Arc::new(Inner {
            job_id,
            core_config: core_config.clone(),
            cluster: cluster.clone(),
            worker_api: worker_api.clone(),
            checkpoint,
            state: Mutex::new(TrackerState { job: snapshot.job, dag }),
            controllers: Mutex::new(HashMap::new()),
        });

        let mut controllers = HashMap::with_capacity(restored.len());
        for (node, resource, config) in restored {
            let weak = Arc::downgrade(&inner);
            let weak2 = weak.clone();
            let ctrl = StageController::new(
                job_id,
                node,
                resource,
                config,
                core_config.clone(),
                cluster.clone(),
                worker_api.clone(),
                Arc::new(move |n| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_nearly_finished(n);
                    }
                }),
                Arc::new(move |n, outcome| {
                    if let Some(inner) = weak2.upgrade() {
                        inner.on_finished(n, outcome);
                    }
                }),
            );
            controllers.insert(node, ctrl);
        }
        *inner.controllers.lock().unwrap() = controllers;

        {
            let controllers = inner.controllers.lock().unwrap();
            for node in started_nodes {
                if let Some(ctrl) = controllers.get(&node) {
                    tokio::spawn(ctrl.clone().run_monitor());
                }
            }
        }

        Ok(Self { inner })
    }

    pub fn job_id(&self) -> Uuid {
        self.inner.job_id
    }

    pub fn job(&self) -> Job {
        self.inner.state.lock().unwrap().job.clone()
    }

    /// `Start()`: call `Start()` on every source stage and transition the
    /// job pending -> running.
    pub fn start(&self) {
        self.inner.transition(|sm| sm.start());
        let sources = self.inner.state.lock().unwrap().dag.sources();
        for node in sources {
            self.inner.start_node(node);
        }
        self.inner.persist();
    }

    pub fn assign(&self, node: usize, endpoint: &str) -> Result<AssignOutcome> {
        self.inner.controller(node)?.assign(endpoint)
    }

    pub fn stage_state(&self, node: usize) -> Result<crate::stage::StageState> {
        Ok(self.inner.controller(node)?.state())
    }

    pub fn finish(&self, node: usize, unit_no: u64, attempt_no: u32, endpoint: &str, state: AttemptState) -> Result<()> {
        self.inner.controller(node)?.finish(unit_no, attempt_no, endpoint, state)
    }

    /// `Update(priority, per_node_capacity[])`.
    pub fn update(&self, priority: Option<i32>, capacities: &[(usize, u32)]) {
        if let Some(p) = priority {
            for ctrl in self.inner.controllers.lock().unwrap().values() {
                ctrl.set_priority(p);
            }
        }
        for &(node, cap) in capacities {
            if let Ok(ctrl) = self.inner.controller(node) {
                ctrl.set_capacity(cap);
            }
        }
        self.inner.persist();
    }

    /// `Kill()`: tear down every non-terminal stage and transition the job.
    pub fn kill(&self, reason: String) {
        {
            let controllers = self.inner.controllers.lock().unwrap();
            for ctrl in controllers.values() {
                if !ctrl.state().is_terminal() {
                    ctrl.kill();
                }
            }
        }
        self.inner.transition(|sm| sm.kill(reason));
        self.inner.persist();
        self.inner.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceManager;
    use crate::rpc::LoggingWorkerApi;
    use crate::stage::LoggingClusterRuntime;
    use std::time::Duration;

    async fn tracker_for(successors: Vec<Vec<usize>>, totals: Vec<u64>) -> JobTracker {
        let job = Job::new_pending("word-count".to_string(), 0);
        let node_specs = totals
            .into_iter()
            .map(|total| NodeSpec {
                resource: ResourceManager::new_id(total),
                config: StageConfig {
                    capacity: 2,
                    retry_budget: 3,
                    duplicates_enabled: false,
                    duplicate_cap: 1,
                },
            })
            .collect();
        let checkpoint = Arc::new(CheckpointManager::new_in_memory().await.unwrap());
        JobTracker::new(
            job,
            successors,
            node_specs,
            Arc::new(CoreConfig::default()),
            Arc::new(LoggingClusterRuntime),
            Arc::new(LoggingWorkerApi),
            checkpoint,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_marks_only_sources_available() {
        let tracker = tracker_for(vec![vec![1], vec![]], vec![1, 1]).await;
        tracker.start();
        assert!(matches!(tracker.assign(0, "w1").unwrap(), AssignOutcome::Unit { .. }));
        assert!(matches!(tracker.assign(1, "w1").unwrap(), AssignOutcome::Wait));
    }

    #[tokio::test]
    async fn completing_source_unlocks_successor() {
        let tracker = tracker_for(vec![vec![1], vec![]], vec![1, 1]).await;
        tracker.start();
        let (unit_no, attempt_no) = match tracker.assign(0, "w1").unwrap() {
            AssignOutcome::Unit { unit_no, attempt_no, .. } => (unit_no, attempt_no),
            _ => panic!("expected unit"),
        };
        tracker.finish(0, unit_no, attempt_no, "w1", AttemptState::Completed).unwrap();
        // The cascade to node 1 runs synchronously inside `finish`; only
        // the checkpoint write itself is a fire-and-forget background task.
        assert!(matches!(tracker.assign(1, "w1").unwrap(), AssignOutcome::Unit { .. }));
    }

    #[tokio::test]
    async fn job_completes_when_every_node_finishes() {
        let tracker = tracker_for(vec![vec![1], vec![]], vec![1, 1]).await;
        tracker.start();
        for node in [0usize, 1] {
            loop {
                match tracker.assign(node, "w1").unwrap() {
                    AssignOutcome::Unit { unit_no, attempt_no, .. } => {
                        tracker.finish(node, unit_no, attempt_no, "w1", AttemptState::Completed).unwrap();
                        break;
                    }
                    AssignOutcome::Wait => tokio::time::sleep(Duration::from_millis(1)).await,
                    AssignOutcome::NoMore => break,
                }
            }
        }
        assert!(matches!(tracker.job().state, crate::job::JobState::Completed { .. }));
    }

    #[tokio::test]
    async fn stage_failure_kills_sibling_and_fails_job() {
        // 0 and 1 are independent sources; 0 exhausts its retry budget.
        let tracker = tracker_for(vec![vec![], vec![]], vec![1, 1]).await;
        tracker.start();
        for _ in 0..3 {
            let (unit_no, attempt_no) = match tracker.assign(0, "w1").unwrap() {
                AssignOutcome::Unit { unit_no, attempt_no, .. } => (unit_no, attempt_no),
                _ => panic!("expected unit"),
            };
            tracker.finish(0, unit_no, attempt_no, "w1", AttemptState::Failed).unwrap();
        }
        assert!(matches!(tracker.job().state, crate::job::JobState::Failed { .. }));
        assert_eq!(tracker.stage_state(1).unwrap(), crate::stage::StageState::Killed);
    }

    #[tokio::test]
    async fn kill_tears_down_every_stage() {
        let tracker = tracker_for(vec![vec![1], vec![]], vec![1, 1]).await;
        tracker.start();
        tracker.kill("operator requested".to_string());
        assert!(matches!(tracker.job().state, crate::job::JobState::Killed { .. }));
        assert_eq!(tracker.stage_state(0).unwrap(), crate::stage::StageState::Killed);
        assert_eq!(tracker.stage_state(1).unwrap(), crate::stage::StageState::Killed);
    }
}
