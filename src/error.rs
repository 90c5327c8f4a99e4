use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Single error type for every fallible boundary in the core: DAG
/// validation, resource manager faults, stage-controller faults, codec
/// faults, checkpoint persistence, and DFS-adaptor faults.
#[derive(Error, Debug)]
pub enum CoreError {
    // --- validation: synchronous, never retried ---
    #[error("job descriptor invalid: {0}")]
    InvalidDescriptor(String),

    #[error("DAG has a cycle")]
    DagCycle,

    #[error("stage {0} has no input sources")]
    EmptyInputSet(usize),

    #[error("missing required config: {0}")]
    MissingConfig(String),

    // --- transient RPC / DFS, bounded retry ---
    #[error("RPC to {endpoint} timed out ({retries_remaining} retries left)")]
    RpcTimeout {
        endpoint: String,
        retries_remaining: u32,
    },

    #[error("DFS operation {op} failed on {path}: {source}")]
    DfsTransient {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    // --- task failures ---
    #[error("unit {unit} attempt {attempt} failed: {reason}")]
    TaskFailure {
        unit: u64,
        attempt: u32,
        reason: String,
    },

    #[error("move-output failed for unit {unit}: {reason}")]
    MoveOutputFailed { unit: u64, reason: String },

    // --- stage failures ---
    #[error("stage {stage} failed: retry budget exhausted on unit {unit}")]
    StageFailed { stage: usize, unit: u64 },

    // --- coordinator-fatal ---
    #[error("lost name-service session, process must exit")]
    NameServiceSessionLost,

    #[error("persisted state corrupted: {0}")]
    PersistedStateCorrupted(String),

    // --- programming / bookkeeping faults that never crash the manager ---
    #[error("unknown unit: {0}")]
    UnknownUnit(u64),

    #[error("invalid stage state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("stage not found: {0}")]
    StageNotFound(usize),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    // --- wrapped external errors ---
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn codec<E: std::fmt::Display>(e: E) -> Self {
        Self::Codec(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }
}

/// Semantic category, independent of the concrete variant.
/// Drives retry-vs-escalate decisions in the Stage Controller and Job
/// Tracker without matching on every error variant at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    Validation,
    Transient,
    TaskFailure,
    StageFailure,
    CoordinatorFatal,
}

impl ErrorCategory {
    pub fn of(err: &CoreError) -> Self {
        use CoreError::*;
        match err {
            InvalidDescriptor(_) | DagCycle | EmptyInputSet(_) | MissingConfig(_) => {
                ErrorCategory::Validation
            }
            RpcTimeout { .. } | DfsTransient { .. } => ErrorCategory::Transient,
            TaskFailure { .. } | MoveOutputFailed { .. } => ErrorCategory::TaskFailure,
            StageFailed { .. } => ErrorCategory::StageFailure,
            NameServiceSessionLost | PersistedStateCorrupted(_) => ErrorCategory::CoordinatorFatal,
            // bookkeeping / wrapped errors default to whichever category the
            // caller already expects from context; treat as transient so a
            // bounded retry loop is the safe default rather than silent drop.
            _ => ErrorCategory::Transient,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Transient => "transient",
            ErrorCategory::TaskFailure => "task_failure",
            ErrorCategory::StageFailure => "stage_failure",
            ErrorCategory::CoordinatorFatal => "coordinator_fatal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_never_retried() {
        assert_eq!(ErrorCategory::of(&CoreError::DagCycle), ErrorCategory::Validation);
        assert_eq!(
            ErrorCategory::of(&CoreError::EmptyInputSet(3)),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn transient_errors_carry_retry_budget() {
        let err = CoreError::RpcTimeout {
            endpoint: "worker-1:9000".into(),
            retries_remaining: 2,
        };
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::Transient);
    }

    #[test]
    fn stage_failure_category() {
        let err = CoreError::StageFailed { stage: 1, unit: 7 };
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::StageFailure);
    }

    #[test]
    fn display_category_as_str() {
        assert_eq!(ErrorCategory::CoordinatorFatal.to_string(), "coordinator_fatal");
    }
}
