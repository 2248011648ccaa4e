//! Wire frames exchanged with host agents and the bounded TX queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::Subprocess;

/// Body of a DATA frame sent to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionMessage {
    ActionStart {
        id: String,
        action: String,
        args: Value,
    },
    ActionCancel {
        id: String,
    },
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxFrame {
    Data {
        fqdn: String,
        session_id: String,
        body: ActionMessage,
    },
    SessionTerminate {
        fqdn: String,
        session_id: String,
    },
}

impl TxFrame {
    pub fn action_start(fqdn: &str, session_id: &str, id: &str, action: &str, args: Value) -> Self {
        TxFrame::Data {
            fqdn: fqdn.to_string(),
            session_id: session_id.to_string(),
            body: ActionMessage::ActionStart {
                id: id.to_string(),
                action: action.to_string(),
                args,
            },
        }
    }

    pub fn action_cancel(fqdn: &str, session_id: &str, id: &str) -> Self {
        TxFrame::Data {
            fqdn: fqdn.to_string(),
            session_id: session_id.to_string(),
            body: ActionMessage::ActionCancel { id: id.to_string() },
        }
    }

    pub fn fqdn(&self) -> &str {
        match self {
            TxFrame::Data { fqdn, .. } | TxFrame::SessionTerminate { fqdn, .. } => fqdn,
        }
    }

    /// Size of the frame once serialized.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// `{"ok": value}` or `{"error": backtrace}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentResult {
    Ok(Value),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionComplete {
    pub id: String,
    pub result: AgentResult,
    #[serde(default)]
    pub subprocesses: Vec<Subprocess>,
}

/// Inbound message from the agent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RxMessage {
    SessionCreate {
        fqdn: String,
        session_id: String,
    },
    SessionTerminate {
        fqdn: String,
        session_id: String,
    },
    SessionTerminateAll,
    Data {
        fqdn: String,
        session_id: String,
        body: ActionComplete,
    },
}

/// Sending half of the agent TX queue.
#[derive(Debug, Clone)]
pub struct AgentTx {
    tx: mpsc::Sender<TxFrame>,
}

impl AgentTx {
    pub fn channel(capacity: usize) -> (AgentTx, AgentTxQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            AgentTx { tx },
            AgentTxQueue {
                rx,
                carried: None,
            },
        )
    }

    /// Waits for room in the queue. Fails only once the queue is closed.
    pub async fn send(&self, frame: TxFrame) -> Result<(), TxFrame> {
        self.tx.send(frame).await.map_err(|e| e.0)
    }
}

/// Receiving half, drained by whatever delivers frames to agents.
#[derive(Debug)]
pub struct AgentTxQueue {
    rx: mpsc::Receiver<TxFrame>,
    carried: Option<TxFrame>,
}

impl AgentTxQueue {
    /// Next batch of frames whose encoded sizes sum to at most
    /// `max_batch_bytes`. The first frame of a batch is always included.
    /// Returns `None` once every sender is gone and the queue is drained.
    pub async fn next_batch(&mut self, max_batch_bytes: usize) -> Option<Vec<TxFrame>> {
        let first = match self.carried.take() {
            Some(frame) => frame,
            None => self.rx.recv().await?,
        };
        let mut total = first.encoded_len();
        let mut batch = vec![first];
        while let Ok(frame) = self.rx.try_recv() {
            let len = frame.encoded_len();
            if total.saturating_add(len) > max_batch_bytes {
                self.carried = Some(frame);
                break;
            }
            total += len;
            batch.push(frame);
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_wire_shape() {
        assert_eq!(
            serde_json::to_value(AgentResult::Ok(json!(3))).unwrap(),
            json!({"ok": 3})
        );
        let err: AgentResult = serde_json::from_value(json!({"error": "Traceback"})).unwrap();
        assert_eq!(err, AgentResult::Error("Traceback".into()));
    }

    #[test]
    fn frame_tags() {
        let frame = TxFrame::action_cancel("oss1", "s1", "r1");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "DATA");
        assert_eq!(value["body"]["type"], "ACTION_CANCEL");

        let msg: RxMessage = serde_json::from_value(json!({"type": "SESSION_TERMINATE_ALL"})).unwrap();
        assert_eq!(msg, RxMessage::SessionTerminateAll);
    }

    #[tokio::test]
    async fn batches_respect_byte_cap() {
        let (tx, mut queue) = AgentTx::channel(16);
        let frame = TxFrame::action_start("oss1", "s1", "r", "noop", json!({}));
        let len = frame.encoded_len();
        for _ in 0..5 {
            tx.send(frame.clone()).await.unwrap();
        }

        let batch = queue.next_batch(len * 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        let batch = queue.next_batch(len * 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        let batch = queue.next_batch(len * 2).await.unwrap();
        assert_eq!(batch.len(), 1);

        drop(tx);
        assert!(queue.next_batch(len).await.is_none());
    }

    #[tokio::test]
    async fn oversize_frame_still_goes_alone() {
        let (tx, mut queue) = AgentTx::channel(4);
        tx.send(TxFrame::action_cancel("oss1", "s1", "r1")).await.unwrap();
        let batch = queue.next_batch(1).await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
