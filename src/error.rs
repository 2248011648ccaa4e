use thiserror::Error;

use crate::state_machine::{JobId, ObjectKey};

/// Tag prefixed to "could not contact" failures so callers can tell an
/// unreachable agent apart from an agent that refused the request.
pub const COULD_NOT_CONTACT_TAG: &str = "Could not contact server";

/// Top-level error for the scheduler service and the binary.
#[derive(Debug, Error)]
pub enum JobPlanError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Command not found: {0}")]
    CommandNotFound(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Worker panicked: {0}")]
    WorkerPanic(String),
}

/// A request that is inconsistent with the state graph. Raised synchronously
/// from planning; no rows are created when it is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("{state} not legal state for {kind}, legal states are {legal:?}")]
    InvalidState {
        kind: String,
        state: String,
        legal: Vec<String>,
    },

    #[error("State '{state}' is invalid for {object}, must be one of {available:?}")]
    UnavailableState {
        object: ObjectKey,
        state: String,
        available: Vec<String>,
    },

    #[error("{from}->{to} not legal state transition for {kind}")]
    NoRoute {
        kind: String,
        from: String,
        to: String,
    },

    #[error(
        "A reverse dependency must provide a fix_state: {dependent} in state {dependent_state} \
         depends on {object} in state {acceptable:?}"
    )]
    MissingFixState {
        dependent: ObjectKey,
        dependent_state: String,
        object: ObjectKey,
        acceptable: Vec<String>,
    },

    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectKey),

    #[error("Unknown object type: {0}")]
    UnknownType(String),

    #[error("Unknown job class: {0}")]
    UnknownJobClass(String),

    #[error("Invalid arguments for {class}: {reason}")]
    InvalidArgs { class: String, reason: String },

    #[error("Job {index} depends on job {depends_on}, which is not earlier in the request")]
    InvalidJobRange { index: usize, depends_on: usize },

    #[error("Job {job} locks {item} in state {begin} but previous job {prior} leaves it in state {end}")]
    LockChain {
        job: JobId,
        item: ObjectKey,
        begin: String,
        prior: JobId,
        end: String,
    },

    #[error("Dependency cycle through {0}")]
    DependencyCycle(String),

    #[error("No jobs requested")]
    EmptyRequest,

    #[error("Schema error: {0}")]
    Schema(String),
}

/// Failure of a single step. Everything except `Cancelled` errors the job.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step failed: {0:#}")]
    Failed(#[from] anyhow::Error),

    #[error("agent error on {fqdn} running {action}: {backtrace}")]
    Agent {
        fqdn: String,
        action: String,
        backtrace: String,
        subprocesses: Vec<crate::agent_rpc::Subprocess>,
    },

    #[error("{COULD_NOT_CONTACT_TAG} {fqdn}: {reason}")]
    NoSession { fqdn: String, reason: String },

    #[error("agent request {action} on {fqdn} timed out after {secs}s")]
    Timeout {
        fqdn: String,
        action: String,
        secs: u64,
    },

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// The text recorded in the `backtrace` column of the failed `StepResult`.
    pub fn backtrace(&self) -> String {
        match self {
            StepError::Failed(e) => format!("{e:?}"),
            StepError::Agent { backtrace, .. } => backtrace.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("integrity conflict: {0} was modified or removed concurrently")]
    IntegrityConflict(ObjectKey),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_session_carries_contact_tag() {
        let err = StepError::NoSession {
            fqdn: "oss1".into(),
            reason: "no session after 30 seconds".into(),
        };
        assert!(err.to_string().starts_with(COULD_NOT_CONTACT_TAG));
    }

    #[test]
    fn agent_backtrace_is_remote_text() {
        let err = StepError::Agent {
            fqdn: "mds1".into(),
            action: "mount_target".into(),
            backtrace: "Traceback: boom".into(),
            subprocesses: vec![],
        };
        assert_eq!(err.backtrace(), "Traceback: boom");
        assert!(!err.is_cancellation());
        assert!(StepError::Cancelled.is_cancellation());
    }

    #[test]
    fn scheduling_error_display() {
        let err = SchedulingError::NoRoute {
            kind: "target".into(),
            from: "mounted".into(),
            to: "formatted".into(),
        };
        assert_eq!(
            err.to_string(),
            "mounted->formatted not legal state transition for target"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<JobPlanError>();
        assert_send_sync::<StepError>();
    }
}
