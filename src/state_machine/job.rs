use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dependency::Dependable;
use super::state::{ObjectKey, StatefulObject};
use super::step::StepSpec;
use crate::lock_cache::{LockRequest, StateLock};
use crate::store::Store;

pub type JobId = u64;
pub type JobArgs = serde_json::Map<String, serde_json::Value>;

/// Lifecycle of a job row: pending → tasked → complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Tasked,
    Complete,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Tasked => write!(f, "tasked"),
            JobState::Complete => write!(f, "complete"),
        }
    }
}

/// How a tasked job finished running its steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Errored(String),
    Cancelled,
}

/// `(Class, from_state | [from_states], to_state)` of a state-change job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Root type of the objects this job transitions.
    pub class: String,
    pub old_states: Vec<String>,
    pub new_state: String,
}

impl StateTransition {
    pub fn new(class: impl Into<String>, old_states: &[&str], new_state: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            old_states: old_states.iter().map(|s| s.to_string()).collect(),
            new_state: new_state.into(),
        }
    }
}

/// A UI verb offered on objects regardless of their state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Object types the job may run on.
    pub classes: Vec<String>,
    pub verb: String,
    /// If true, one invocation operates on N objects.
    #[serde(default)]
    pub plural: bool,
}

/// What it takes to construct a job: everything except its id, locks and
/// wait-for edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub class_name: String,
    #[serde(default)]
    pub args: JobArgs,
    /// For state-change jobs: the object being transitioned.
    #[serde(default)]
    pub stateful_object: Option<ObjectKey>,
    /// For state-change jobs: the state captured at construction.
    #[serde(default)]
    pub old_state: Option<String>,
}

impl JobSpec {
    pub fn new(class_name: impl Into<String>, args: JobArgs) -> Self {
        Self {
            class_name: class_name.into(),
            args,
            stateful_object: None,
            old_state: None,
        }
    }

    pub fn state_change(
        class_name: impl Into<String>,
        object: ObjectKey,
        old_state: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            args: JobArgs::new(),
            stateful_object: Some(object),
            old_state: Some(old_state.into()),
        }
    }

    /// An object key passed as a `{kind, id}` argument.
    pub fn object_arg(&self, name: &str) -> Option<ObjectKey> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn objects_arg(&self, name: &str) -> Vec<ObjectKey> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Identity used to memoize dependency lookups within one planning pass.
    pub(crate) fn cache_key(&self) -> String {
        format!(
            "{}|{:?}|{:?}|{}",
            self.class_name,
            self.stateful_object,
            self.old_state,
            serde_json::Value::Object(self.args.clone())
        )
    }
}

/// A scheduler-level unit of work, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub spec: JobSpec,
    pub state: JobState,
    #[serde(default)]
    pub errored: bool,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Jobs that must complete successfully before this one may start.
    #[serde(default)]
    pub wait_for: Vec<JobId>,
    #[serde(default)]
    pub locks: Vec<StateLock>,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            state: JobState::Pending,
            errored: false,
            cancelled: false,
            created_at: now,
            modified_at: now,
            wait_for: Vec::new(),
            locks: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == JobState::Complete
    }

    /// Complete without error or cancellation.
    pub fn succeeded(&self) -> bool {
        self.is_complete() && !self.errored && !self.cancelled
    }

    pub fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.modified_at = Utc::now();
    }
}

/// Behaviour of one kind of job. Implementations are registered once and
/// looked up by `name()`; job rows only carry the name and arguments.
pub trait JobClass: Send + Sync {
    fn name(&self) -> &str;

    fn state_transition(&self) -> Option<&StateTransition> {
        None
    }

    fn advertisement(&self) -> Option<&Advertisement> {
        None
    }

    /// Whether a tasked job may be interrupted.
    fn cancellable(&self) -> bool {
        true
    }

    fn description(&self, job: &JobSpec) -> String;

    fn requires_confirmation(&self, _job: &JobSpec) -> bool {
        false
    }

    fn confirmation_prompt(&self, _job: &JobSpec) -> Option<String> {
        None
    }

    /// UI verb for the transition this job performs, e.g. "Start".
    fn state_verb(&self) -> Option<&str> {
        None
    }

    /// For advertised jobs: whether the verb applies to this object now.
    fn can_run(&self, _object: &StatefulObject) -> bool {
        true
    }

    /// Arguments for running this advertised job on `objects`.
    fn get_args(&self, objects: &[ObjectKey]) -> JobArgs {
        let mut args = JobArgs::new();
        let plural = self.advertisement().is_some_and(|a| a.plural);
        if plural {
            args.insert("objects".into(), serde_json::json!(objects));
        } else if let Some(first) = objects.first() {
            args.insert("object".into(), serde_json::json!(first));
        }
        args
    }

    /// Dynamic pre-conditions for running the job.
    fn get_deps(&self, _job: &JobSpec, _store: &dyn Store) -> Dependable {
        Dependable::none()
    }

    /// Locks beyond those derived from dependencies and the transition.
    fn create_locks(&self, _job: &JobSpec, _store: &dyn Store) -> Vec<LockRequest> {
        Vec::new()
    }

    fn get_steps(&self, job: &JobSpec, store: &dyn Store) -> anyhow::Result<Vec<StepSpec>>;

    fn on_success(&self, _job: &JobSpec, _store: &dyn Store) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the job errors. Must not fail.
    fn on_error(&self, _job: &JobSpec, _store: &dyn Store) {}
}

/// Backoff policy for retrying failed idempotent steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before the job errors.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}
