use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dependency::Dependable;
use crate::store::Store;

/// Identifies a stateful object: its type tag and its row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub id: u64,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, id: u64) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("expected <kind>/<id>, got '{s}'"))?;
        let id = id
            .parse::<u64>()
            .map_err(|e| format!("bad object id in '{s}': {e}"))?;
        if kind.is_empty() {
            return Err(format!("missing object kind in '{s}'"));
        }
        Ok(Self::new(kind, id))
    }
}

/// Declared type of an object attribute. Used to re-type notification
/// payloads, which carry datetimes as ISO strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Json,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Value(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Value(v) => v.as_str(),
            AttrValue::Timestamp(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::Value(v) => v.as_u64(),
            AttrValue::Timestamp(_) => None,
        }
    }
}

impl From<serde_json::Value> for AttrValue {
    fn from(v: serde_json::Value) -> Self {
        AttrValue::Value(v)
    }
}

/// A managed entity whose lifecycle is a finite state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatefulObject {
    pub key: ObjectKey,
    pub state: String,
    pub state_modified_at: DateTime<Utc>,
    /// Observed-only: the object may not be commanded.
    #[serde(default)]
    pub immutable_state: bool,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl StatefulObject {
    pub fn new(key: ObjectKey, state: impl Into<String>) -> Self {
        Self {
            key,
            state: state.into(),
            state_modified_at: Utc::now(),
            immutable_state: false,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = state.into();
        self.state_modified_at = Utc::now();
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(AttrValue::as_str)
    }

    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attrs.get(name).and_then(AttrValue::as_u64)
    }
}

pub type LookupFn = dyn Fn(&StatefulObject, &dyn Store) -> Vec<ObjectKey> + Send + Sync;

/// "When an object of `referenced_type` changes, these objects of the
/// declaring type may be affected."
#[derive(Clone)]
pub struct ReverseDep {
    pub referenced_type: String,
    pub lookup: Arc<LookupFn>,
}

impl fmt::Debug for ReverseDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseDep")
            .field("referenced_type", &self.referenced_type)
            .finish_non_exhaustive()
    }
}

/// Per-type declaration of a stateful object.
///
/// Types sharing a `root` share their transition tables, so that e.g. an
/// MDT, an OST and an MGS can all be driven by jobs declared against the
/// common target type.
pub trait StatefulType: Send + Sync {
    fn name(&self) -> &str;

    /// Nearest ancestor that declares its own tables. Defaults to self.
    fn root(&self) -> &str {
        self.name()
    }

    fn states(&self) -> &[String];

    fn initial_state(&self) -> &str;

    /// Static dependencies of an object while it is in `state`.
    fn get_deps(&self, _object: &StatefulObject, _state: &str, _store: &dyn Store) -> Dependable {
        Dependable::none()
    }

    fn reverse_deps(&self) -> Vec<ReverseDep> {
        Vec::new()
    }

    /// Targets advertised for an object with `immutable_state` set; usually
    /// only a terminal "forgotten"-style state.
    fn immutable_transitions(&self, _begin_state: &str) -> Vec<String> {
        Vec::new()
    }

    /// Terminal states after which the object row is deleted.
    fn deletable_states(&self) -> &[String] {
        &[]
    }

    fn field_kind(&self, _attr: &str) -> FieldKind {
        FieldKind::Json
    }

    fn has_state(&self, state: &str) -> bool {
        self.states().iter().any(|s| s == state)
    }

    fn not_states(&self, excluded: &[&str]) -> Vec<String> {
        self.states()
            .iter()
            .filter(|s| !excluded.contains(&s.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_display_and_parse() {
        let key = ObjectKey::new("target", 7);
        assert_eq!(key.to_string(), "target/7");
        assert_eq!("target/7".parse::<ObjectKey>().unwrap(), key);
        assert!("target".parse::<ObjectKey>().is_err());
        assert!("/3".parse::<ObjectKey>().is_err());
        assert!("host/x".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn set_state_bumps_modified_at() {
        let mut obj = StatefulObject::new(ObjectKey::new("host", 1), "lnet_down");
        let before = obj.state_modified_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        obj.set_state("lnet_up");
        assert_eq!(obj.state, "lnet_up");
        assert!(obj.state_modified_at > before);
    }

    #[test]
    fn attr_accessors() {
        let obj = StatefulObject::new(ObjectKey::new("target", 1), "unmounted")
            .with_attr("host", serde_json::json!(3))
            .with_attr("fqdn", serde_json::json!("oss1.local"));
        assert_eq!(obj.attr_u64("host"), Some(3));
        assert_eq!(obj.attr_str("fqdn"), Some("oss1.local"));
        assert_eq!(obj.attr_str("missing"), None);
    }

    #[test]
    fn object_serialization_roundtrip() {
        let obj = StatefulObject::new(ObjectKey::new("host", 2), "lnet_up")
            .with_attr("last_contact", AttrValue::Timestamp(Utc::now()));
        let json = serde_json::to_string(&obj).unwrap();
        let back: StatefulObject = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obj);
    }
}
