//! Request/response RPC to host agents over session-addressed frames.
//!
//! Each fqdn has at most one live session. Requests are queued as DATA
//! frames on the bounded TX queue and resolved when the matching
//! ActionComplete arrives on the same session. A new session for an fqdn
//! re-issues its in-flight requests; a terminated one fails them.

pub mod frames;
pub mod loopback;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::StepError;

pub use frames::{ActionComplete, ActionMessage, AgentResult, AgentTx, AgentTxQueue, RxMessage, TxFrame};
pub use loopback::{ActionBehaviour, AgentCall, LoopbackAgent, LoopbackHandle};

/// One command an agent ran while serving a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subprocess {
    pub args: Vec<String>,
    pub rc: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub result: Value,
    pub subprocesses: Vec<Subprocess>,
}

type ReplyTx = oneshot::Sender<Result<AgentReply, StepError>>;

struct InFlight {
    fqdn: String,
    session_id: String,
    action: String,
    args: Value,
    reply: ReplyTx,
}

/// Request ids whose replies should be dropped quietly until they expire.
#[derive(Debug, Default)]
struct ExpiringSet {
    entries: HashMap<String, Instant>,
}

impl ExpiringSet {
    fn insert(&mut self, id: String, ttl: Duration) {
        self.purge();
        self.entries.insert(id, Instant::now() + ttl);
    }

    fn contains(&mut self, id: &str) -> bool {
        self.purge();
        self.entries.contains_key(id)
    }

    fn purge(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }
}

#[derive(Default)]
struct MessengerState {
    sessions: HashMap<String, String>,
    in_flight: HashMap<String, InFlight>,
    cancelled: ExpiringSet,
}

impl MessengerState {
    /// Fail every in-flight request matching `filter` with a
    /// communications error.
    fn fail_in_flight(&mut self, filter: impl Fn(&InFlight) -> bool, message: &str) -> usize {
        let ids: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, req)| filter(req))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(req) = self.in_flight.remove(id) {
                let err = anyhow!("Communications error with {} because {message}", req.fqdn);
                let _ = req.reply.send(Err(StepError::Failed(err)));
            }
        }
        ids.len()
    }
}

pub struct AgentMessenger {
    state: Mutex<MessengerState>,
    tx: AgentTx,
    sessions_changed: watch::Sender<u64>,
    session_wait: Duration,
    read_timeout: Duration,
    poll_interval: Duration,
    cancelled_ttl: Duration,
    max_request_bytes: usize,
}

impl AgentMessenger {
    /// Returns the messenger and the queue an agent transport drains.
    pub fn new(config: &SchedulerConfig) -> (Arc<Self>, AgentTxQueue) {
        let (tx, queue) = AgentTx::channel(config.tx_queue_capacity);
        let (sessions_changed, _) = watch::channel(0);
        let messenger = Self {
            state: Mutex::new(MessengerState::default()),
            tx,
            sessions_changed,
            session_wait: Duration::from_secs(config.session_wait_timeout_secs),
            read_timeout: Duration::from_secs(config.agent_read_timeout_secs),
            poll_interval: Duration::from_millis(config.cancel_poll_interval_ms.max(1)),
            cancelled_ttl: Duration::from_secs(config.cancelled_rpc_ttl_secs),
            max_request_bytes: config.max_request_bytes,
        };
        (Arc::new(messenger), queue)
    }

    fn lock(&self) -> MutexGuard<'_, MessengerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_sessions(&self) {
        self.sessions_changed.send_modify(|generation| *generation += 1);
    }

    pub fn session_id(&self, fqdn: &str) -> Option<String> {
        self.lock().sessions.get(fqdn).cloned()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Run `action` on the agent of `fqdn` and wait for its reply.
    pub async fn call(
        &self,
        fqdn: &str,
        action: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, StepError> {
        let session_id = self.await_session(fqdn, cancel).await?;
        let id = Uuid::new_v4().to_string();
        let frame = TxFrame::action_start(fqdn, &session_id, &id, action, args.clone());
        let size = frame.encoded_len();
        if size > self.max_request_bytes {
            return Err(StepError::Failed(anyhow!(
                "{action} request to {fqdn} is {size} bytes, over the {} byte limit",
                self.max_request_bytes
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.lock().in_flight.insert(
            id.clone(),
            InFlight {
                fqdn: fqdn.to_string(),
                session_id: session_id.clone(),
                action: action.to_string(),
                args,
                reply: reply_tx,
            },
        );
        debug!(fqdn, session_id = %session_id, request = %id, action, "sending agent request");
        if self.tx.send(frame).await.is_err() {
            self.lock().in_flight.remove(&id);
            return Err(StepError::NoSession {
                fqdn: fqdn.to_string(),
                reason: "agent channel closed".into(),
            });
        }

        tokio::select! {
            reply = reply_rx => reply.unwrap_or_else(|_| {
                Err(StepError::Failed(anyhow!("request {id} to {fqdn} was dropped")))
            }),
            _ = cancel.cancelled() => {
                self.cancel_request(&id).await;
                Err(StepError::Cancelled)
            }
            _ = tokio::time::sleep(self.read_timeout) => {
                self.cancel_request(&id).await;
                Err(StepError::Timeout {
                    fqdn: fqdn.to_string(),
                    action: action.to_string(),
                    secs: self.read_timeout.as_secs(),
                })
            }
        }
    }

    /// Forget an in-flight request, remember its id so a late reply is
    /// dropped, and tell the agent to stop.
    async fn cancel_request(&self, id: &str) {
        let frame = {
            let mut state = self.lock();
            let ttl = self.cancelled_ttl;
            state.cancelled.insert(id.to_string(), ttl);
            state
                .in_flight
                .remove(id)
                .map(|req| TxFrame::action_cancel(&req.fqdn, &req.session_id, id))
        };
        if let Some(frame) = frame {
            info!(request = id, fqdn = frame.fqdn(), "cancelling agent request");
            if self.tx.send(frame).await.is_err() {
                warn!(request = id, "agent channel closed before cancel was sent");
            }
        }
    }

    async fn await_session(&self, fqdn: &str, cancel: &CancellationToken) -> Result<String, StepError> {
        let mut changes = self.sessions_changed.subscribe();
        let deadline = Instant::now() + self.session_wait;
        loop {
            if let Some(session_id) = self.session_id(fqdn) {
                return Ok(session_id);
            }
            tokio::select! {
                changed = tokio::time::timeout_at(deadline, changes.changed()) => match changed {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        return Err(StepError::NoSession {
                            fqdn: fqdn.to_string(),
                            reason: format!("no session after {} seconds", self.session_wait.as_secs()),
                        });
                    }
                },
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }
    }

    /// Wait for `fqdn` to come back with a session other than
    /// `old_session`.
    pub async fn await_restart(
        &self,
        fqdn: &str,
        old_session: Option<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.session_id(fqdn);
            if current.is_some() && current != old_session {
                info!(fqdn, session_id = ?current, "agent restarted");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StepError::Timeout {
                    fqdn: fqdn.to_string(),
                    action: "await_restart".into(),
                    secs: timeout.as_secs(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }
    }

    /// Handle one inbound message, then send whatever frames it provoked.
    pub async fn on_rx(&self, message: RxMessage) {
        let outgoing = self.apply_rx(message);
        for frame in outgoing {
            if self.tx.send(frame).await.is_err() {
                warn!("agent channel closed, dropping outbound frames");
                break;
            }
        }
    }

    fn apply_rx(&self, message: RxMessage) -> Vec<TxFrame> {
        let mut outgoing = Vec::new();
        let mut sessions_changed = false;
        {
            let mut state = self.lock();
            match message {
                RxMessage::SessionCreate { fqdn, session_id } => {
                    let old = state.sessions.insert(fqdn.clone(), session_id.clone());
                    info!(fqdn = %fqdn, session_id = %session_id, "session created");
                    if let Some(old) = old
                        && old != session_id
                    {
                        info!(fqdn = %fqdn, old_session = %old, "aborting previous session");
                        for (id, req) in state.in_flight.iter_mut().filter(|(_, r)| r.fqdn == fqdn) {
                            req.session_id = session_id.clone();
                            outgoing.push(TxFrame::action_start(
                                &fqdn,
                                &session_id,
                                id,
                                &req.action,
                                req.args.clone(),
                            ));
                        }
                    }
                    sessions_changed = true;
                }
                RxMessage::SessionTerminate { fqdn, session_id } => {
                    if state.sessions.get(&fqdn) == Some(&session_id) {
                        state.sessions.remove(&fqdn);
                        sessions_changed = true;
                    }
                    let failed = state.fail_in_flight(
                        |r| r.fqdn == fqdn && r.session_id == session_id,
                        "session terminated",
                    );
                    info!(fqdn = %fqdn, session_id = %session_id, failed, "session terminated");
                }
                RxMessage::SessionTerminateAll => {
                    state.sessions.clear();
                    let failed = state.fail_in_flight(|_| true, "all sessions terminated");
                    info!(failed, "all sessions terminated");
                    sessions_changed = true;
                }
                RxMessage::Data {
                    fqdn,
                    session_id,
                    body,
                } => {
                    if state.cancelled.contains(&body.id) {
                        debug!(request = %body.id, "dropping reply to cancelled request");
                    } else {
                        match state.sessions.get(&fqdn).cloned() {
                            Some(current) if current == session_id => match state.in_flight.remove(&body.id) {
                                Some(req) => deliver(req, body),
                                None => warn!(fqdn = %fqdn, request = %body.id, "reply to unknown request"),
                            },
                            Some(current) => {
                                warn!(
                                    fqdn = %fqdn,
                                    session_id = %session_id,
                                    current = %current,
                                    "reply on stray session, resetting"
                                );
                                state.sessions.remove(&fqdn);
                                state.fail_in_flight(
                                    |r| r.fqdn == fqdn && r.session_id == current,
                                    "session reset",
                                );
                                outgoing.push(TxFrame::SessionTerminate { fqdn, session_id });
                                sessions_changed = true;
                            }
                            None => {
                                warn!(fqdn = %fqdn, session_id = %session_id, "reply on unknown session");
                                outgoing.push(TxFrame::SessionTerminate { fqdn, session_id });
                            }
                        }
                    }
                }
            }
        }
        if sessions_changed {
            self.bump_sessions();
        }
        outgoing
    }

    /// Fail every in-flight request; used at shutdown.
    pub fn complete_all(&self) {
        let mut state = self.lock();
        let pending: Vec<InFlight> = state.in_flight.drain().map(|(_, req)| req).collect();
        if !pending.is_empty() {
            info!(count = pending.len(), "Cancelled due to service shutdown");
        }
        for req in pending {
            let _ = req.reply.send(Err(StepError::Cancelled));
        }
    }

    /// Drop the session of a host that is no longer managed.
    pub fn remove(&self, fqdn: &str) {
        {
            let mut state = self.lock();
            state.sessions.remove(fqdn);
            state.fail_in_flight(|r| r.fqdn == fqdn, "host removed");
        }
        self.bump_sessions();
    }

    /// Spawn the RX loop. Agents deliver inbound messages through the
    /// returned sender.
    pub fn spawn_rx(
        self: &Arc<Self>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (mpsc::Sender<RxMessage>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.clone().run_rx(rx, shutdown));
        (tx, task)
    }

    /// Drain inbound messages until the channel closes or `shutdown` fires.
    pub async fn run_rx(self: Arc<Self>, mut rx: mpsc::Receiver<RxMessage>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.on_rx(message).await,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        self.complete_all();
        debug!("agent rx loop stopped");
    }
}

fn deliver(req: InFlight, body: ActionComplete) {
    let outcome = match body.result {
        AgentResult::Ok(result) => Ok(AgentReply {
            result,
            subprocesses: body.subprocesses,
        }),
        AgentResult::Error(backtrace) => Err(StepError::Agent {
            fqdn: req.fqdn.clone(),
            action: req.action.clone(),
            backtrace,
            subprocesses: body.subprocesses,
        }),
    };
    if req.reply.send(outcome).is_err() {
        debug!(fqdn = %req.fqdn, action = %req.action, "caller went away before reply");
    }
}
