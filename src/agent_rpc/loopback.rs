//! In-process stand-in for the host agents: drains the TX queue and answers
//! each ActionStart after a configurable delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ActionComplete, ActionMessage, AgentResult, AgentTxQueue, RxMessage, Subprocess, TxFrame};

/// How the simulated agent answers one action.
#[derive(Debug, Clone, Default)]
pub struct ActionBehaviour {
    pub delay: Duration,
    pub result: Value,
    /// Remote backtrace to fail with.
    pub fail: Option<String>,
    /// With `fail` set: fail only the first N calls. Zero fails every call.
    pub fail_first: u32,
    /// Reconnect with a fresh session after replying.
    pub restart: bool,
}

impl ActionBehaviour {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn failing(backtrace: impl Into<String>) -> Self {
        Self {
            fail: Some(backtrace.into()),
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn times(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn restarting(mut self) -> Self {
        self.restart = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    pub fqdn: String,
    pub action: String,
    pub args: Value,
}

#[derive(Default)]
struct Journal {
    calls: Vec<AgentCall>,
    cancels: Vec<String>,
    counts: HashMap<String, u32>,
}

/// Read side of what the loopback agent saw.
#[derive(Clone, Default)]
pub struct LoopbackHandle {
    journal: Arc<Mutex<Journal>>,
}

impl LoopbackHandle {
    pub fn calls(&self) -> Vec<AgentCall> {
        self.journal.lock().map(|j| j.calls.clone()).unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.action).collect()
    }

    pub fn cancels(&self) -> usize {
        self.journal.lock().map(|j| j.cancels.len()).unwrap_or_default()
    }
}

pub struct LoopbackAgent {
    hosts: Vec<String>,
    actions: HashMap<String, ActionBehaviour>,
    default: ActionBehaviour,
}

impl LoopbackAgent {
    pub fn new(hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
            actions: HashMap::new(),
            default: ActionBehaviour::ok(Value::Null),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>, behaviour: ActionBehaviour) -> Self {
        self.actions.insert(action.into(), behaviour);
        self
    }

    pub fn with_default(mut self, behaviour: ActionBehaviour) -> Self {
        self.default = behaviour;
        self
    }

    /// Open a session per host, then serve frames until `shutdown` fires
    /// or the queue closes.
    pub fn spawn(
        self,
        inbound: mpsc::Sender<RxMessage>,
        mut queue: AgentTxQueue,
        max_batch_bytes: usize,
        shutdown: CancellationToken,
    ) -> (LoopbackHandle, JoinHandle<()>) {
        let handle = LoopbackHandle::default();
        let journal = handle.journal.clone();
        let task = tokio::spawn(async move {
            for fqdn in &self.hosts {
                if inbound.send(new_session(fqdn)).await.is_err() {
                    return;
                }
            }
            let running: Arc<Mutex<HashMap<String, CancellationToken>>> = Arc::default();
            loop {
                let batch = tokio::select! {
                    batch = queue.next_batch(max_batch_bytes) => batch,
                    _ = shutdown.cancelled() => None,
                };
                let Some(batch) = batch else { break };
                for frame in batch {
                    self.serve(frame, &inbound, &journal, &running, &shutdown).await;
                }
            }
            debug!("loopback agent stopped");
        });
        (handle, task)
    }

    async fn serve(
        &self,
        frame: TxFrame,
        inbound: &mpsc::Sender<RxMessage>,
        journal: &Arc<Mutex<Journal>>,
        running: &Arc<Mutex<HashMap<String, CancellationToken>>>,
        shutdown: &CancellationToken,
    ) {
        match frame {
            TxFrame::Data {
                fqdn,
                session_id,
                body: ActionMessage::ActionStart { id, action, args },
            } => {
                let behaviour = self.actions.get(&action).cloned().unwrap_or_else(|| self.default.clone());
                let attempt = match journal.lock() {
                    Ok(mut j) => {
                        j.calls.push(AgentCall {
                            fqdn: fqdn.clone(),
                            action: action.clone(),
                            args,
                        });
                        let count = j.counts.entry(action.clone()).or_default();
                        *count += 1;
                        *count
                    }
                    Err(_) => 1,
                };
                let fails = behaviour.fail.is_some() && (behaviour.fail_first == 0 || attempt <= behaviour.fail_first);

                let token = shutdown.child_token();
                if let Ok(mut r) = running.lock() {
                    r.insert(id.clone(), token.clone());
                }
                let inbound = inbound.clone();
                let running = running.clone();
                tokio::spawn(async move {
                    let finished = tokio::select! {
                        _ = tokio::time::sleep(behaviour.delay) => true,
                        _ = token.cancelled() => false,
                    };
                    if let Ok(mut r) = running.lock() {
                        r.remove(&id);
                    }
                    if !finished {
                        debug!(request = %id, action = %action, "loopback action cancelled");
                        return;
                    }
                    let (result, rc) = match (&behaviour.fail, fails) {
                        (Some(backtrace), true) => (AgentResult::Error(backtrace.clone()), 1),
                        _ => (AgentResult::Ok(behaviour.result.clone()), 0),
                    };
                    let body = ActionComplete {
                        id,
                        result,
                        subprocesses: vec![Subprocess {
                            args: vec![action.clone()],
                            rc,
                            stdout: String::new(),
                            stderr: String::new(),
                        }],
                    };
                    let reply = RxMessage::Data {
                        fqdn: fqdn.clone(),
                        session_id,
                        body,
                    };
                    if inbound.send(reply).await.is_err() {
                        return;
                    }
                    if behaviour.restart {
                        info!(fqdn = %fqdn, "loopback host restarting");
                        let _ = inbound.send(new_session(&fqdn)).await;
                    }
                });
            }
            TxFrame::Data {
                body: ActionMessage::ActionCancel { id },
                ..
            } => {
                if let Ok(mut j) = journal.lock() {
                    j.cancels.push(id.clone());
                }
                let token = running.lock().ok().and_then(|mut r| r.remove(&id));
                if let Some(token) = token {
                    token.cancel();
                }
            }
            TxFrame::SessionTerminate { fqdn, session_id } => {
                debug!(fqdn = %fqdn, session_id = %session_id, "loopback session terminated, reconnecting");
                let _ = inbound.send(new_session(&fqdn)).await;
            }
        }
    }
}

fn new_session(fqdn: &str) -> RxMessage {
    RxMessage::SessionCreate {
        fqdn: fqdn.to_string(),
        session_id: Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_rpc::AgentMessenger;
    use crate::config::SchedulerConfig;
    use crate::error::StepError;
    use serde_json::json;

    #[tokio::test]
    async fn answers_and_fails_first_attempts() {
        let (messenger, queue) = AgentMessenger::new(&SchedulerConfig::default());
        let shutdown = CancellationToken::new();
        let (inbound, _rx) = messenger.spawn_rx(16, shutdown.clone());
        let (handle, task) = LoopbackAgent::new(["oss1".to_string()])
            .with_action("mount", ActionBehaviour::ok(json!({"mounted": true})))
            .with_action("flaky", ActionBehaviour::failing("Traceback: EIO").times(1))
            .spawn(inbound, queue, usize::MAX, shutdown.clone());

        let cancel = CancellationToken::new();
        let reply = messenger.call("oss1", "mount", json!({}), &cancel).await.unwrap();
        assert_eq!(reply.result, json!({"mounted": true}));
        assert_eq!(reply.subprocesses[0].rc, 0);

        let err = messenger.call("oss1", "flaky", json!({}), &cancel).await.unwrap_err();
        assert!(matches!(err, StepError::Agent { .. }));
        assert!(messenger.call("oss1", "flaky", json!({}), &cancel).await.is_ok());

        assert_eq!(handle.actions(), vec!["mount", "flaky", "flaky"]);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn restart_changes_session() {
        let (messenger, queue) = AgentMessenger::new(&SchedulerConfig::default());
        let shutdown = CancellationToken::new();
        let (inbound, _rx) = messenger.spawn_rx(16, shutdown.clone());
        let (_handle, _task) = LoopbackAgent::new(["oss1".to_string()])
            .with_action("reboot", ActionBehaviour::ok(Value::Null).restarting())
            .spawn(inbound, queue, usize::MAX, shutdown.clone());

        let cancel = CancellationToken::new();
        messenger.call("oss1", "noop", json!({}), &cancel).await.unwrap();
        let before = messenger.session_id("oss1");
        messenger.call("oss1", "reboot", json!({}), &cancel).await.unwrap();
        messenger
            .await_restart("oss1", before, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        shutdown.cancel();
    }
}
