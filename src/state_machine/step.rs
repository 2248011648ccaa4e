use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::job::JobId;
use crate::agent_rpc::{AgentMessenger, Subprocess};
use crate::error::StepError;
use crate::store::Store;

pub type StepArgs = serde_json::Map<String, Value>;

/// Step arguments with this prefix reach the step but are never persisted.
pub const SENSITIVE_ARG_PREFIX: &str = "__";

/// Current version of the persisted step payload.
pub const STEP_PAYLOAD_VERSION: u32 = 1;

/// The smallest retriable unit of execution inside a job.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Safe to run again after a failure.
    fn idempotent(&self) -> bool {
        false
    }

    /// Runs on the connection-limited pool.
    fn database(&self) -> bool {
        false
    }

    fn describe(&self, _args: &StepArgs) -> String {
        self.name().to_string()
    }

    async fn run(&self, ctx: &StepContext, args: &StepArgs) -> Result<Value, StepError>;
}

/// A step instance as returned from `JobClass::get_steps`.
#[derive(Clone)]
pub struct StepSpec {
    pub step: Arc<dyn Step>,
    pub args: StepArgs,
}

impl StepSpec {
    pub fn new(step: Arc<dyn Step>, args: StepArgs) -> Self {
        Self { step, args }
    }
}

impl fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSpec")
            .field("step", &self.step.name())
            .field("args", &self.args)
            .finish()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub log: String,
    pub console: String,
}

/// Everything a running step may touch: logging channels, the cancel
/// event, the agent messenger and the store.
pub struct StepContext {
    pub job_id: JobId,
    pub step_index: usize,
    pub step_count: usize,
    /// Result of the step before this one, if any.
    pub prev_result: Option<Value>,
    cancel: CancellationToken,
    messenger: Arc<AgentMessenger>,
    store: Arc<dyn Store>,
    output: Mutex<StepOutput>,
}

impl StepContext {
    pub fn new(
        job_id: JobId,
        step_index: usize,
        step_count: usize,
        prev_result: Option<Value>,
        cancel: CancellationToken,
        messenger: Arc<AgentMessenger>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            job_id,
            step_index,
            step_count,
            prev_result,
            cancel,
            messenger,
            store,
            output: Mutex::new(StepOutput::default()),
        }
    }

    /// Append a line to the step's free-text log.
    pub fn log(&self, line: &str) {
        debug!(job_id = self.job_id, step = self.step_index, "{line}");
        if let Ok(mut out) = self.output.lock() {
            out.log.push_str(line);
            out.log.push('\n');
        }
    }

    /// Append subprocess output to the step's console log.
    pub fn console(&self, text: &str) {
        if let Ok(mut out) = self.output.lock() {
            out.console.push_str(text);
        }
    }

    pub fn is_final(&self) -> bool {
        self.step_index + 1 == self.step_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Run `action` on the agent of `fqdn`. Subprocess output lands in the
    /// console log whether or not the action succeeds.
    pub async fn invoke_agent(
        &self,
        fqdn: &str,
        action: &str,
        args: Value,
    ) -> Result<Value, StepError> {
        self.log(&format!("Running {action} on {fqdn}"));
        match self.messenger.call(fqdn, action, args, &self.cancel).await {
            Ok(reply) => {
                self.log_subprocesses(&reply.subprocesses);
                Ok(reply.result)
            }
            Err(err) => {
                if let StepError::Agent { subprocesses, .. } = &err {
                    self.log_subprocesses(subprocesses);
                }
                self.log(&format!("{action} on {fqdn} failed: {err}"));
                Err(err)
            }
        }
    }

    /// Wait for the agent on `fqdn` to reconnect with a new session, e.g.
    /// after a step deliberately rebooted the host.
    pub async fn await_restart(
        &self,
        fqdn: &str,
        old_session: Option<String>,
        timeout: Duration,
    ) -> Result<(), StepError> {
        self.messenger
            .await_restart(fqdn, old_session, timeout, &self.cancel)
            .await
    }

    pub fn session_id(&self, fqdn: &str) -> Option<String> {
        self.messenger.session_id(fqdn)
    }

    fn log_subprocesses(&self, subprocesses: &[Subprocess]) {
        for sp in subprocesses {
            self.console(&format!(
                "{}: {}\n{}{}",
                sp.args.join(" "),
                sp.rc,
                sp.stdout,
                sp.stderr
            ));
        }
    }

    pub fn take_output(&self) -> StepOutput {
        self.output
            .lock()
            .map(|mut out| std::mem::take(&mut *out))
            .unwrap_or_default()
    }
}

/// Tagged, versioned record of which step ran with which arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    pub step: String,
    pub version: u32,
    pub args: StepArgs,
}

impl StepPayload {
    /// Arguments prefixed with `__` are dropped.
    pub fn new(step: &str, args: &StepArgs) -> Self {
        let args = args
            .iter()
            .filter(|(k, _)| !k.starts_with(SENSITIVE_ARG_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            step: step.to_string(),
            version: STEP_PAYLOAD_VERSION,
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepResultState {
    Incomplete,
    Success,
    Failed,
}

/// One attempt at one step. Retries produce further rows with the same
/// `step_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub id: u64,
    pub job_id: JobId,
    pub payload: StepPayload,
    pub step_index: usize,
    pub step_count: usize,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub console: String,
    #[serde(default)]
    pub backtrace: String,
    pub state: StepResultState,
    #[serde(default)]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl StepResult {
    pub fn start(id: u64, job_id: JobId, payload: StepPayload, step_index: usize, step_count: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_id,
            payload,
            step_index,
            step_count,
            log: String::new(),
            console: String::new(),
            backtrace: String::new(),
            state: StepResultState::Incomplete,
            result: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn finish(&mut self, output: StepOutput, outcome: &Result<Value, StepError>) {
        self.log.push_str(&output.log);
        self.console.push_str(&output.console);
        match outcome {
            Ok(value) => {
                self.state = StepResultState::Success;
                self.result = Some(value.clone());
            }
            Err(err) => {
                self.state = StepResultState::Failed;
                self.backtrace = err.backtrace();
            }
        }
        self.modified_at = Utc::now();
    }
}
