//! Out-of-band attribute updates reported by agents.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{JobPlanError, StoreError};
use crate::lock_cache::LockCache;
use crate::state_machine::{AttrValue, FieldKind, ObjectKey, Registry, StatefulObject};
use crate::store::Store;

/// One update message. `instance_natural_key` is the object's type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub instance_natural_key: String,
    pub instance_id: u64,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub update_attrs: serde_json::Map<String, Value>,
    /// Apply only while the object is in one of these states. Empty: any.
    #[serde(default)]
    pub from_states: Vec<String>,
}

impl Notification {
    pub fn new(key: &ObjectKey, time: DateTime<Utc>) -> Self {
        Self {
            instance_natural_key: key.kind.clone(),
            instance_id: key.id,
            time,
            update_attrs: serde_json::Map::new(),
            from_states: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: Value) -> Self {
        self.update_attrs.insert(name.into(), value);
        self
    }

    pub fn from_states(mut self, states: &[&str]) -> Self {
        self.from_states = states.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.instance_natural_key.clone(), self.instance_id)
    }
}

/// Bounded queue that drops the oldest message on overflow.
pub struct NotificationQueue {
    items: Mutex<VecDeque<Notification>>,
    capacity: usize,
    ready: Notify,
    dropped: AtomicU64,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, notification: Notification) {
        {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            if items.len() >= self.capacity
                && let Some(oldest) = items.pop_front()
            {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(object = %oldest.key(), "notification queue full, dropping oldest");
            }
            items.push_back(notification);
        }
        self.ready.notify_one();
    }

    pub async fn pop(&self) -> Notification {
        loop {
            if let Some(n) = self.try_pop() {
                return n;
            }
            self.ready.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Notification> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|i| i.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Apply `notification` to its object. Returns the updated object if
/// anything changed.
///
/// A `state` update is skipped when it predates the last state change, or
/// when a queued writer will leave the object in a different state. Other
/// attributes still apply.
pub fn apply(
    notification: &Notification,
    registry: &Registry,
    store: &dyn Store,
    lock_cache: &LockCache,
) -> Result<Option<StatefulObject>, JobPlanError> {
    let key = notification.key();
    let Some(mut object) = store.get_object(&key) else {
        debug!(object = %key, "notification for unknown object");
        return Ok(None);
    };
    if !notification.from_states.is_empty() && !notification.from_states.contains(&object.state) {
        info!(
            object = %key,
            state = %object.state,
            from_states = ?notification.from_states,
            "notification ignored, object left the expected states"
        );
        return Ok(None);
    }
    let ty = registry.type_of(&key.kind)?;

    let mut changed = false;
    for (name, value) in &notification.update_attrs {
        if name == "state" {
            let Some(state) = value.as_str() else {
                warn!(object = %key, value = %value, "non-string state in notification");
                continue;
            };
            if !ty.has_state(state) {
                warn!(object = %key, state, "notification carries unknown state");
                continue;
            }
            if state == object.state {
                continue;
            }
            if notification.time <= object.state_modified_at {
                info!(object = %key, state, "stale state notification dropped");
                continue;
            }
            if let Some(lock) = lock_cache.get_latest_write(&key, None)
                && lock.end_state.as_deref() != Some(state)
            {
                info!(
                    object = %key,
                    state,
                    job_id = lock.job_id,
                    "state owned by a queued job, notification state dropped"
                );
                continue;
            }
            object.set_state(state);
            object.state_modified_at = notification.time;
            changed = true;
            continue;
        }

        let new_value = match (ty.field_kind(name), value) {
            (FieldKind::Timestamp, Value::String(text)) => match DateTime::parse_from_rfc3339(text) {
                Ok(t) => AttrValue::Timestamp(t.with_timezone(&Utc)),
                Err(e) => {
                    warn!(object = %key, attr = %name, error = %e, "bad timestamp in notification");
                    continue;
                }
            },
            _ => AttrValue::Value(value.clone()),
        };
        if object.attrs.get(name) != Some(&new_value) {
            object.attrs.insert(name.clone(), new_value);
            changed = true;
        }
    }

    if !changed {
        return Ok(None);
    }
    match store.update_object(object.clone()) {
        Ok(()) => {
            debug!(object = %key, "notification applied");
            Ok(Some(object))
        }
        Err(StoreError::IntegrityConflict(_)) => {
            warn!(object = %key, "object vanished while applying notification");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
