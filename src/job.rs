use crate::error::{CoreError, ErrorCategory, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long a terminal job stays in the dead-table before it is fully
/// evicted. Queries via `ShowJob`/`ListJobs(include_dead=true)` can still
/// see it during this window.
pub const DEAD_TABLE_TTL_SECS: i64 = 24 * 60 * 60;

/// Coarse job state. Once a job reaches Completed, Failed,
/// or Killed it never leaves that state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    Pending {
        submitted_at: DateTime<Utc>,
        priority: i32,
    },
    Running {
        started_at: DateTime<Utc>,
        priority: i32,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    },
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        reason: String,
        category: ErrorCategory,
        failed_node: Option<usize>,
    },
    Killed {
        started_at: Option<DateTime<Utc>>,
        killed_at: DateTime<Utc>,
        reason: String,
    },
}

impl JobState {
    pub fn state_name(&self) -> &'static str {
        match self {
            JobState::Pending { .. } => "pending",
            JobState::Running { .. } => "running",
            JobState::Completed { .. } => "completed",
            JobState::Failed { .. } => "failed",
            JobState::Killed { .. } => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Killed { .. }
        )
    }
}

/// A job as submitted: immutable except priority and per-node capacity.
/// Per-node configuration lives on the DAG/stage side; this struct only
/// carries the coarse envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the job leaves the active table; query handlers use this
    /// to decide eviction from the dead-table.
    pub retired_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new_pending(name: String, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            state: JobState::Pending {
                submitted_at: now,
                priority,
            },
            created_at: now,
            updated_at: now,
            retired_at: None,
        }
    }

    /// True once the job's dead-table TTL has elapsed, as of `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        match self.retired_at {
            Some(retired_at) => (now - retired_at).num_seconds() >= DEAD_TABLE_TTL_SECS,
            None => false,
        }
    }
}

/// Drives a `Job` through its state transitions. Owned exclusively by the
/// Job Tracker for that job.
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Transition: Pending -> Running. Fired by the Job Tracker's `Start()`
    /// on the first stage assignment.
    pub fn start(&mut self) -> Result<()> {
        match &self.job.state {
            JobState::Pending { priority, .. } => {
                let now = Utc::now();
                self.job.state = JobState::Running {
                    started_at: now,
                    priority: *priority,
                };
                self.job.updated_at = now;
                Ok(())
            }
            _ => Err(CoreError::InvalidStateTransition {
                from: self.job.state.state_name().to_string(),
                to: "running".to_string(),
            }),
        }
    }

    /// Transition: Running -> Completed. Fired when the DAG Scheduler
    /// reports `UnfinishedNodes() == 0`.
    pub fn complete(&mut self) -> Result<()> {
        match &self.job.state {
            JobState::Running { started_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;
                self.job.state = JobState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                    duration_ms,
                };
                self.job.updated_at = now;
                self.retire(now);
                Ok(())
            }
            _ => Err(CoreError::InvalidStateTransition {
                from: self.job.state.state_name().to_string(),
                to: "completed".to_string(),
            }),
        }
    }

    /// Transition: Running -> Failed. Fired when a stage's finished-callback
    /// reports failure.
    pub fn fail(&mut self, reason: String, category: ErrorCategory, failed_node: usize) -> Result<()> {
        match &self.job.state {
            JobState::Running { started_at, .. } => {
                let now = Utc::now();
                self.job.state = JobState::Failed {
                    started_at: *started_at,
                    failed_at: now,
                    reason,
                    category,
                    failed_node: Some(failed_node),
                };
                self.job.updated_at = now;
                self.retire(now);
                Ok(())
            }
            _ => Err(CoreError::InvalidStateTransition {
                from: self.job.state.state_name().to_string(),
                to: "failed".to_string(),
            }),
        }
    }

    /// Transition: * (non-terminal) -> Killed. Fired by `KillJob` or by a
    /// cascading stage failure propagating `Kill()` to sibling stages.
    pub fn kill(&mut self, reason: String) -> Result<()> {
        if self.job.state.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.job.state.state_name().to_string(),
                to: "killed".to_string(),
            });
        }
        let started_at = match &self.job.state {
            JobState::Running { started_at, .. } => Some(*started_at),
            _ => None,
        };
        let now = Utc::now();
        self.job.state = JobState::Killed {
            started_at,
            killed_at: now,
            reason,
        };
        self.job.updated_at = now;
        self.retire(now);
        Ok(())
    }

    fn retire(&mut self, now: DateTime<Utc>) {
        self.job.retired_at = Some(now);
    }
}
