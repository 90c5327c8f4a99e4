//! Transport-agnostic RPC contracts. The wire format and
//! transport (gRPc, a hand-rolled codec, or an in-process mock for tests)
//! are explicitly out of scope; only these trait boundaries are
//! specified so the core can be programmed against without depending on a
//! concrete transport crate.

use crate::error::{CoreError, Result};
use crate::resource::UnitInput;
use async_trait::async_trait;
use uuid::Uuid;

/// Status returned by `AssignTask`, mirroring the Resource Manager's
/// `Acquisition` but over the wire.
#[derive(Debug, Clone)]
pub enum AssignStatus {
    Ok {
        node: usize,
        unit_no: u64,
        attempt_no: u32,
        input: UnitInput,
    },
    NoMore,
    Suspend,
    NoSuchJob,
}

/// Attempt outcome reported by a worker via `FinishTask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Running,
    Completed,
    Failed,
    Killed,
    Canceled,
    MoveOutputFailed,
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub name: String,
    pub state_name: &'static str,
}

/// Control-plane RPC surface implemented by the coordinator.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn submit_job(&self, descriptor_json: String) -> Result<Uuid>;
    async fn update_job(&self, job_id: Uuid, priority: Option<i32>, capacities: Vec<(usize, u32)>) -> Result<()>;
    async fn kill_job(&self, job_id: Uuid) -> Result<()>;
    async fn list_jobs(&self, include_dead: bool) -> Result<Vec<JobSummary>>;
    async fn assign_task(&self, job_id: Uuid, node: usize, endpoint: String) -> Result<AssignStatus>;
    async fn finish_task(
        &self,
        job_id: Uuid,
        node: usize,
        unit_no: u64,
        attempt_no: u32,
        state: AttemptState,
        endpoint: String,
    ) -> Result<()>;
}

/// Response to the coordinator's liveness-monitor `Query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub job_id: Uuid,
    pub node: usize,
    pub unit_no: u64,
    pub attempt_no: u32,
    pub state: AttemptState,
}

/// RPC surface implemented by workers, called by the coordinator's
/// liveness monitor and end-game cancellation path.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn query(&self, endpoint: &str) -> Result<QueryResponse>;
    async fn cancel_task(&self, endpoint: &str, job_id: Uuid, node: usize, unit_no: u64, attempt_no: u32) -> Result<()>;
}

/// A `WorkerApi` that only logs; a placeholder until a concrete transport
/// is wired in. `query` always reports the endpoint unreachable, so the
/// liveness monitor falls back to killing attempts on their adaptive
/// timeout rather than ever confirming liveness.
#[derive(Default)]
pub struct LoggingWorkerApi;

#[async_trait]
impl WorkerApi for LoggingWorkerApi {
    async fn query(&self, endpoint: &str) -> Result<QueryResponse> {
        Err(CoreError::RpcTimeout {
            endpoint: endpoint.to_string(),
            retries_remaining: 0,
        })
    }

    async fn cancel_task(&self, endpoint: &str, job_id: Uuid, node: usize, unit_no: u64, attempt_no: u32) -> Result<()> {
        tracing::info!(endpoint, %job_id, node, unit_no, attempt_no, "canceling task");
        Ok(())
    }
}
