//! Stage Controller: drives one DAG node to completion. Owns the node's
//! Resource Manager and attempt table, implements end-game duplicate
//! execution and the liveness monitor.

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::resource::{Acquisition, ResourceCounters, ResourceManager, UnitInput};
use crate::rpc::{AttemptState, WorkerApi};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cluster-runtime requests a Stage Controller makes to provision,
/// resize, reprioritize, or tear down its worker pool. The cluster
/// container runtime itself is out of scope; this trait is the
/// Stage Controller's only view of it.
pub trait ClusterRuntime: Send + Sync {
    fn provision(&self, node: usize, capacity: u32);
    fn set_capacity(&self, node: usize, capacity: u32);
    fn set_priority(&self, node: usize, priority: i32);
    fn terminate(&self, node: usize);
}

/// A `ClusterRuntime` that only logs; useful for tests and for
/// single-machine deployments where the worker pool is managed out of
/// band.
#[derive(Default)]
pub struct LoggingClusterRuntime;

impl ClusterRuntime for LoggingClusterRuntime {
    fn provision(&self, node: usize, capacity: u32) {
        tracing::info!(node, capacity, "provisioning stage workers");
    }
    fn set_capacity(&self, node: usize, capacity: u32) {
        tracing::info!(node, capacity, "resizing stage worker pool");
    }
    fn set_priority(&self, node: usize, priority: i32) {
        tracing::info!(node, priority, "changing stage priority");
    }
    fn terminate(&self, node: usize) {
        tracing::info!(node, "terminating stage workers");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    Killed,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Completed | StageState::Failed | StageState::Killed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed,
    Killed,
}

pub type NearlyFinishedCallback = Arc<dyn Fn(usize) + Send + Sync>;
pub type FinishedCallback = Arc<dyn Fn(usize, StageOutcome) + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StageConfig {
    pub capacity: u32,
    pub retry_budget: u32,
    pub duplicates_enabled: bool,
    pub duplicate_cap: u32,
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    endpoint: String,
    state: AttemptState,
    alloc_time: Instant,
    duration: Option<Duration>,
}

/// Outcome of an `Assign()` call: a fresh or duplicate unit, no more work
/// to hand out, or nothing ready yet.
#[derive(Debug, Clone)]
pub enum AssignOutcome {
    Unit {
        unit_no: u64,
        attempt_no: u32,
        input: UnitInput,
        /// True when this is an end-game duplicate of an already-allocated
        /// unit rather than a fresh one.
        duplicate: bool,
    },
    NoMore,
    Wait,
}

/// `meta`: state and the bookkeeping the Job Tracker reads via callbacks.
/// Never held at the same time as `alloc`.
struct Meta {
    state: StageState,
    nearly_finished_fired: bool,
}

/// `alloc`: attempt table, slug queue, and the per-unit failure counters
/// that drive retry-budget escalation.
struct Alloc {
    resource: ResourceManager,
    attempts: HashMap<(u64, u32), AttemptRecord>,
    live_by_unit: HashMap<u64, Vec<u32>>,
    slug_queue: VecDeque<u64>,
    completed_durations: Vec<Duration>,
    failure_counts: HashMap<u64, u32>,
}

/// Side effects that must run after a lock is released: callback
/// invocations and fire-and-forget cancellation RPCs to losing duplicate
/// attempts.
#[derive(Default)]
struct PostActions {
    fire_nearly_finished: bool,
    fire_finished: Option<StageOutcome>,
    cancel: Vec<(String, u64, u32)>, // (endpoint, unit_no, attempt_no)
}

pub struct StageController {
    pub job_id: Uuid,
    pub node: usize,
    config: StageConfig,
    core_config: Arc<CoreConfig>,
    cluster: Arc<dyn ClusterRuntime>,
    worker_api: Arc<dyn WorkerApi>,
    meta: Mutex<Meta>,
    alloc: Mutex<Alloc>,
    nearly_finished_cb: NearlyFinishedCallback,
    finished_cb: FinishedCallback,
}

impl StageController {
    pub fn new(
        job_id: Uuid,
        node: usize,
        resource: ResourceManager,
        config: StageConfig,
        core_config: Arc<CoreConfig>,
        cluster: Arc<dyn ClusterRuntime>,
        worker_api: Arc<dyn WorkerApi>,
        nearly_finished_cb: NearlyFinishedCallback,
        finished_cb: FinishedCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            node,
            config,
            core_config,
            cluster,
            worker_api,
            meta: Mutex::new(Meta {
                state: StageState::Pending,
                nearly_finished_fired: false,
            }),
            alloc: Mutex::new(Alloc {
                resource,
                attempts: HashMap::new(),
                live_by_unit: HashMap::new(),
                slug_queue: VecDeque::new(),
                completed_durations: Vec::new(),
                failure_counts: HashMap::new(),
            }),
            nearly_finished_cb,
            finished_cb,
        })
    }

    pub fn state(&self) -> StageState {
        self.meta.lock().unwrap().state
    }

    pub fn counters(&self) -> ResourceCounters {
        self.alloc.lock().unwrap().resource.counters()
    }

    /// Clone of the Resource Manager's current state, for checkpointing.
    /// Cheap relative to checkpoint frequency; the manager holds no large
    /// payloads itself, only unit metadata.
    pub fn resource_snapshot(&self) -> ResourceManager {
        self.alloc.lock().unwrap().resource.clone()
    }

    pub fn stage_config(&self) -> StageConfig {
        self.config.clone()
    }

    /// Requests worker provisioning. The pending->running transition
    /// itself happens lazily, on the first successful `assign`.
    pub fn start(&self) {
        self.cluster.provision(self.node, self.config.capacity);
    }

    pub fn set_capacity(&self, n: u32) {
        self.cluster.set_capacity(self.node, n);
    }

    pub fn set_priority(&self, p: i32) {
        self.cluster.set_priority(self.node, p);
    }

    /// Best-effort terminate: idempotent, non-blocking. Flips every live
    /// attempt to killed locally and requests cluster-runtime teardown;
    /// does not itself fire the finished-callback (the Job Tracker is the
    /// one driving a cascading `Kill()` and already knows the outcome).
    pub fn kill(&self) {
        {
            let mut meta = self.meta.lock().unwrap();
            if meta.state.is_terminal() {
                return;
            }
            meta.state = StageState::Killed;
        }
        {
            let mut alloc = self.alloc.lock().unwrap();
            for record in alloc.attempts.values_mut() {
                if record.state == AttemptState::Running {
                    record.state = AttemptState::Killed;
                }
            }
        }
        self.cluster.terminate(self.node);
    }

    /// Delegates to the Resource Manager, wrapped with the end-game
    /// strategy, and records a fresh Attempt.
    pub fn assign(&self, endpoint: &str) -> Result<AssignOutcome> {
        {
            let mut meta = self.meta.lock().unwrap();
            if meta.state == StageState::Pending {
                meta.state = StageState::Running;
            }
        }

        let mut alloc = self.alloc.lock().unwrap();
        match alloc.resource.acquire() {
            Acquisition::Unit {
                unit_no,
                attempt_no,
                input,
            } => {
                record_attempt(&mut alloc, endpoint, unit_no, attempt_no);
                Ok(AssignOutcome::Unit {
                    unit_no,
                    attempt_no,
                    input,
                    duplicate: false,
                })
            }
            Acquisition::NoMore => Ok(AssignOutcome::NoMore),
            Acquisition::Wait => {
                let total = alloc.resource.counters().total;
                let completed = alloc.resource.counters().done;
                if !self.config.duplicates_enabled || completed < self.core_config.end_game_begin(total) {
                    return Ok(AssignOutcome::Wait);
                }
                match self.next_slug(&mut alloc) {
                    Some(unit_no) => {
                        let acquisition = alloc.resource.acquire_specific(unit_no)?;
                        match acquisition {
                            Acquisition::Unit {
                                unit_no,
                                attempt_no,
                                input,
                            } => {
                                record_attempt(&mut alloc, endpoint, unit_no, attempt_no);
                                Ok(AssignOutcome::Unit {
                                    unit_no,
                                    attempt_no,
                                    input,
                                    duplicate: true,
                                })
                            }
                            _ => Ok(AssignOutcome::Wait),
                        }
                    }
                    None => Ok(AssignOutcome::Wait),
                }
            }
        }
    }

    /// Picks the next unit eligible for duplicate execution: prefer the
    /// slug queue (populated by the liveness monitor), falling back to any
    /// currently-allocated unit that hasn't hit the duplicate cap.
    fn next_slug(&self, alloc: &mut Alloc) -> Option<u64> {
        while let Some(unit_no) = alloc.slug_queue.pop_front() {
            if self.under_duplicate_cap(alloc, unit_no) {
                return Some(unit_no);
            }
        }
        alloc
            .resource
            .allocated_units()
            .into_iter()
            .find(|&u| self.under_duplicate_cap(alloc, u))
    }

    fn under_duplicate_cap(&self, alloc: &Alloc, unit_no: u64) -> bool {
        alloc.live_by_unit.get(&unit_no).map(|v| v.len() as u32).unwrap_or(0) < self.config.duplicate_cap
    }

    /// Processes a completion report.
    pub fn finish(&self, unit_no: u64, attempt_no: u32, endpoint: &str, state: AttemptState) -> Result<()> {
        let post = {
            let mut alloc = self.alloc.lock().unwrap();
            self.apply_finish(&mut alloc, unit_no, attempt_no, endpoint, state)?
        };
        self.run_post_actions(post);
        Ok(())
    }

    fn apply_finish(
        &self,
        alloc: &mut Alloc,
        unit_no: u64,
        attempt_no: u32,
        endpoint: &str,
        state: AttemptState,
    ) -> Result<PostActions> {
        let key = (unit_no, attempt_no);
        let now = Instant::now();
        let duration = alloc.attempts.get(&key).map(|r| now.duration_since(r.alloc_time));

        let effective_state = if state == AttemptState::MoveOutputFailed {
            if alloc.resource.is_done(unit_no) {
                AttemptState::Canceled
            } else {
                AttemptState::Failed
            }
        } else {
            state
        };

        let mut post = PostActions::default();

        match effective_state {
            AttemptState::Completed => {
                let won = alloc.resource.complete(unit_no)?;
                if won {
                    if let Some(d) = duration {
                        alloc.completed_durations.push(d);
                    }
                    if self.config.duplicates_enabled {
                        if let Some(live) = alloc.live_by_unit.get(&unit_no) {
                            for &other_attempt in live {
                                if other_attempt != attempt_no {
                                    if let Some(record) = alloc.attempts.get(&(unit_no, other_attempt)) {
                                        post.cancel.push((record.endpoint.clone(), unit_no, other_attempt));
                                    }
                                }
                            }
                        }
                    }
                    set_attempt_state(alloc, key, AttemptState::Completed, duration);
                } else {
                    set_attempt_state(alloc, key, AttemptState::Canceled, duration);
                }
            }
            AttemptState::Failed => {
                alloc.resource.return_unit(unit_no)?;
                let count = alloc.failure_counts.entry(unit_no).or_insert(0);
                *count += 1;
                set_attempt_state(alloc, key, AttemptState::Failed, duration);
                if *count >= self.config.retry_budget {
                    post.fire_finished = Some(StageOutcome::Failed);
                }
            }
            AttemptState::Killed => {
                alloc.resource.return_unit(unit_no)?;
                set_attempt_state(alloc, key, AttemptState::Killed, duration);
            }
            AttemptState::Canceled => {
                set_attempt_state(alloc, key, AttemptState::Canceled, duration);
            }
            AttemptState::MoveOutputFailed => unreachable!("normalized above"),
        }

        untrack_live(alloc, unit_no, attempt_no);

        let counters = alloc.resource.counters();
        if post.fire_finished.is_none() {
            if counters.done == counters.total {
                post.fire_finished = Some(StageOutcome::Completed);
            } else if !alloc_meta_nearly_finished_fired(self)
                && counters.done >= self.core_config.nearly_finished_threshold(counters.total)
            {
                post.fire_nearly_finished = true;
            }
        }
        let _ = endpoint; // recorded at allocation time; kept for signature symmetry with finish_task

        Ok(post)
    }

    fn run_post_actions(&self, post: PostActions) {
        for (endpoint, unit_no, attempt_no) in post.cancel {
            let worker_api = self.worker_api.clone();
            let job_id = self.job_id;
            let node = self.node;
            tokio::spawn(async move {
                if let Err(e) = worker_api.cancel_task(&endpoint, job_id, node, unit_no, attempt_no).await {
                    tracing::warn!(node, unit_no, attempt_no, endpoint, error = %e, "failed to cancel losing duplicate attempt");
                }
            });
        }
        if post.fire_nearly_finished {
            let mut meta = self.meta.lock().unwrap();
            if !meta.nearly_finished_fired {
                meta.nearly_finished_fired = true;
                drop(meta);
                (self.nearly_finished_cb)(self.node);
            }
        }
        if let Some(outcome) = post.fire_finished {
            {
                let mut meta = self.meta.lock().unwrap();
                meta.state = match outcome {
                    StageOutcome::Completed => StageState::Completed,
                    StageOutcome::Failed => StageState::Failed,
                    StageOutcome::Killed => StageState::Killed,
                };
            }
            (self.finished_cb)(self.node, outcome);
        }
    }

    /// Per-stage liveness monitor: releases `alloc` before
    /// each outbound RPC and re-acquires before mutating the attempt
    /// table, the only externally-observable yield in the hot path.
    pub async fn run_monitor(self: Arc<Self>) {
        loop {
            if self.state().is_terminal() {
                return;
            }
            let timeout = self.adaptive_timeout();
            tokio::time::sleep(self.core_config.monitor_tick_interval).await;

            let stale: Vec<(u64, u32, String)> = {
                let alloc = self.alloc.lock().unwrap();
                let now = Instant::now();
                alloc
                    .attempts
                    .iter()
                    .filter(|(_, r)| r.state == AttemptState::Running && now.duration_since(r.alloc_time) >= timeout)
                    .map(|(&(unit_no, attempt_no), r)| (unit_no, attempt_no, r.endpoint.clone()))
                    .collect()
            };

            for (unit_no, attempt_no, endpoint) in stale {
                let alive = self
                    .worker_api
                    .query(&endpoint)
                    .await
                    .map(|resp| {
                        resp.job_id == self.job_id
                            && resp.node == self.node
                            && resp.unit_no == unit_no
                            && resp.attempt_no == attempt_no
                    })
                    .unwrap_or(false);

                if !alive {
                    if let Err(e) = self.finish(unit_no, attempt_no, &endpoint, AttemptState::Killed) {
                        tracing::warn!(node = self.node, unit_no, error = %e, "failed to reclassify stuck attempt");
                        continue;
                    }
                    if self.config.duplicates_enabled {
                        let mut alloc = self.alloc.lock().unwrap();
                        let counters = alloc.resource.counters();
                        if counters.done >= self.core_config.end_game_begin(counters.total) {
                            alloc.slug_queue.push_back(unit_no);
                        }
                    }
                }
            }
        }
    }

    /// `1.2 x median(completed attempt durations)`, or the configured
    /// bootstrap interval if nothing has completed yet.
    fn adaptive_timeout(&self) -> Duration {
        let alloc = self.alloc.lock().unwrap();
        if alloc.completed_durations.is_empty() {
            return self.core_config.monitor_bootstrap_interval;
        }
        let mut durations = alloc.completed_durations.clone();
        durations.sort();
        let median = durations[durations.len() / 2];
        median.mul_f64(1.2)
    }
}

fn record_attempt(alloc: &mut Alloc, endpoint: &str, unit_no: u64, attempt_no: u32) {
    alloc.attempts.insert(
        (unit_no, attempt_no),
        AttemptRecord {
            endpoint: endpoint.to_string(),
            state: AttemptState::Running,
            alloc_time: Instant::now(),
            duration: None,
        },
    );
    alloc.live_by_unit.entry(unit_no).or_default().push(attempt_no);
}

fn set_attempt_state(alloc: &mut Alloc, key: (u64, u32), state: AttemptState, duration: Option<Duration>) {
    if let Some(record) = alloc.attempts.get_mut(&key) {
        record.state = state;
        record.duration = duration;
    }
}

fn untrack_live(alloc: &mut Alloc, unit_no: u64, attempt_no: u32) {
    if let Some(live) = alloc.live_by_unit.get_mut(&unit_no) {
        live.retain(|&a| a != attempt_no);
    }
}

fn alloc_meta_nearly_finished_fired(controller: &StageController) -> bool {
    controller.meta.lock().unwrap().nearly_finished_fired
}
