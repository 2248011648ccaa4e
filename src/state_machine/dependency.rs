//! Declarative pre-conditions on the state of other objects.
//!
//! A [`Dependable`] is a tree of [`DependOn`] leaves combined with
//! all-of / any-of nodes. Evaluation re-reads every target from the store
//! and never mutates anything.

use std::fmt;

use tracing::warn;

use super::state::ObjectKey;
use crate::store::Store;

/// How to move the *depender* out of the way when the dependency can no
/// longer be satisfied.
#[derive(Clone)]
pub enum FixState {
    State(String),
    /// Computed from the new state of the depended-on object. A plain
    /// function pointer: it cannot capture or mutate anything.
    Computed(fn(&str) -> String),
}

impl FixState {
    pub fn resolve(&self, new_state: &str) -> String {
        match self {
            FixState::State(s) => s.clone(),
            FixState::Computed(f) => f(new_state),
        }
    }
}

impl fmt::Debug for FixState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixState::State(s) => write!(f, "State({s:?})"),
            FixState::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

impl From<&str> for FixState {
    fn from(s: &str) -> Self {
        FixState::State(s.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DependOn {
    pub target: ObjectKey,
    /// What to drive the target to if it is not in one of `acceptable_states`.
    pub preferred_state: String,
    pub acceptable_states: Vec<String>,
    pub fix_state: Option<FixState>,
}

impl DependOn {
    /// Satisfied only by `preferred_state`.
    pub fn new(target: ObjectKey, preferred_state: impl Into<String>) -> Self {
        let preferred_state = preferred_state.into();
        Self {
            target,
            acceptable_states: vec![preferred_state.clone()],
            preferred_state,
            fix_state: None,
        }
    }

    /// Satisfied by any of `acceptable`; `preferred_state` is added if missing.
    pub fn acceptable(
        target: ObjectKey,
        preferred_state: impl Into<String>,
        acceptable: &[&str],
    ) -> Self {
        let preferred_state = preferred_state.into();
        let mut acceptable_states: Vec<String> = acceptable.iter().map(|s| s.to_string()).collect();
        if !acceptable_states.contains(&preferred_state) {
            acceptable_states.push(preferred_state.clone());
        }
        Self {
            target,
            preferred_state,
            acceptable_states,
            fix_state: None,
        }
    }

    /// Satisfied by every state of the target's type except `unacceptable`.
    pub fn unacceptable(
        target: ObjectKey,
        preferred_state: impl Into<String>,
        unacceptable: &[&str],
        all_states: &[String],
    ) -> Self {
        let acceptable: Vec<&str> = all_states
            .iter()
            .map(String::as_str)
            .filter(|s| !unacceptable.contains(s))
            .collect();
        Self::acceptable(target, preferred_state, &acceptable)
    }

    pub fn with_fix_state(mut self, fix_state: impl Into<FixState>) -> Self {
        self.fix_state = Some(fix_state.into());
        self
    }

    /// A dependency no state can satisfy; used when the depender cannot be
    /// moved out of the way.
    pub(crate) fn impossible(target: ObjectKey) -> Self {
        Self {
            target,
            preferred_state: String::new(),
            acceptable_states: Vec::new(),
            fix_state: None,
        }
    }

    pub fn accepts(&self, state: &str) -> bool {
        self.acceptable_states.iter().any(|s| s == state)
    }

    pub fn satisfied(&self, store: &dyn Store) -> bool {
        let Some(object) = store.get_object(&self.target) else {
            warn!(target = %self.target, "DependOn not satisfied: object no longer exists");
            return false;
        };
        let satisfied = self.accepts(&object.state);
        if !satisfied {
            warn!(
                target = %self.target,
                state = %object.state,
                acceptable = ?self.acceptable_states,
                preferred = %self.preferred_state,
                "DependOn not satisfied"
            );
        }
        satisfied
    }
}

#[derive(Debug, Clone)]
pub enum Dependable {
    On(DependOn),
    All(Vec<Dependable>),
    Any(Vec<Dependable>),
}

impl Dependable {
    /// The empty conjunction: always satisfied.
    pub fn none() -> Self {
        Dependable::All(Vec::new())
    }

    /// Every `DependOn` leaf, depth first.
    pub fn all(&self) -> Vec<&DependOn> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a DependOn>) {
        match self {
            Dependable::On(d) => out.push(d),
            Dependable::All(children) | Dependable::Any(children) => {
                for c in children {
                    c.collect(out);
                }
            }
        }
    }

    pub fn satisfied(&self, store: &dyn Store) -> bool {
        match self {
            Dependable::On(d) => d.satisfied(store),
            Dependable::All(children) => children.iter().all(|c| c.satisfied(store)),
            Dependable::Any(children) => {
                children.is_empty() || children.iter().any(|c| c.satisfied(store))
            }
        }
    }
}

impl From<DependOn> for Dependable {
    fn from(d: DependOn) -> Self {
        Dependable::On(d)
    }
}
