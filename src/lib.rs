/*
 * shuttlecore - MapReduce-style distributed batch processing core
 *
 * Coordinator: Job Tracker (one per live job) driving a DAG Scheduler and
 * one Stage Controller per node, each owning a Resource Manager.
 * Worker: pull-loop against the coordinator, Shuffle Engine, sorted-file
 * codec, external user-code wrapper.
 *
 * RPC transport, the cluster container runtime, and the name-service lock
 * are modeled as trait boundaries only; concrete implementations are
 * deployment-specific and out of scope here.
 */

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod dfs;
pub mod error;
pub mod job;
pub mod merge;
pub mod partition;
pub mod resource;
pub mod rpc;
pub mod shuffle;
pub mod stage;
pub mod tracker;

pub use checkpoint::{CheckpointManager, JobSnapshot, NodeSnapshot};
pub use config::CoreConfig;
pub use coordinator::{Coordinator, InputDescriptor, JobDescriptor, NodeDescriptor};
pub use dag::DagScheduler;
pub use error::{CoreError, ErrorCategory, Result};
pub use job::{Job, JobState, JobStateMachine};
pub use resource::{Acquisition, ManagerKind, ResourceCounters, ResourceManager, ResourceStatus, UnitInput, WorkUnit};
pub use rpc::{AssignStatus, AttemptState, CoordinatorApi, JobSummary, LoggingWorkerApi, QueryResponse, WorkerApi};
pub use shuffle::{DeliveryMode, OutputSink, ShuffleEngine};
pub use stage::{
    AssignOutcome, ClusterRuntime, LoggingClusterRuntime, StageConfig, StageController, StageOutcome, StageState,
};
pub use tracker::{JobTracker, NodeSpec};
