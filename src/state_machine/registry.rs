use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::job::JobClass;
use super::routes::StateTables;
use super::state::{LookupFn, ObjectKey, StatefulObject, StatefulType};
use crate::error::SchedulingError;
use crate::store::Store;

#[derive(Default)]
pub struct RegistryBuilder {
    types: Vec<Arc<dyn StatefulType>>,
    jobs: Vec<Arc<dyn JobClass>>,
}

impl RegistryBuilder {
    pub fn register_type(mut self, ty: Arc<dyn StatefulType>) -> Self {
        self.types.push(ty);
        self
    }

    pub fn register_job(mut self, job: Arc<dyn JobClass>) -> Self {
        self.jobs.push(job);
        self
    }

    /// Builds the per-root transition tables and the reverse dependency
    /// map. Every declaration problem surfaces here rather than at first
    /// use.
    pub fn build(self) -> Result<Registry, SchedulingError> {
        let mut types: HashMap<String, Arc<dyn StatefulType>> = HashMap::new();
        for ty in &self.types {
            if types.insert(ty.name().to_string(), ty.clone()).is_some() {
                return Err(SchedulingError::Schema(format!(
                    "type {} registered twice",
                    ty.name()
                )));
            }
            if !ty.has_state(ty.initial_state()) {
                return Err(SchedulingError::Schema(format!(
                    "type {}: initial state {} is not one of {:?}",
                    ty.name(),
                    ty.initial_state(),
                    ty.states()
                )));
            }
        }
        for ty in &self.types {
            if !types.contains_key(ty.root()) {
                return Err(SchedulingError::Schema(format!(
                    "type {}: unknown root type {}",
                    ty.name(),
                    ty.root()
                )));
            }
        }

        let mut jobs: HashMap<String, Arc<dyn JobClass>> = HashMap::new();
        let mut job_order = Vec::new();
        for job in &self.jobs {
            if jobs.insert(job.name().to_string(), job.clone()).is_some() {
                return Err(SchedulingError::Schema(format!(
                    "job class {} registered twice",
                    job.name()
                )));
            }
            job_order.push(job.name().to_string());
            if let Some(t) = job.state_transition() {
                let Some(ty) = types.get(&t.class) else {
                    return Err(SchedulingError::Schema(format!(
                        "job class {} transitions unknown type {}",
                        job.name(),
                        t.class
                    )));
                };
                if ty.root() != ty.name() {
                    return Err(SchedulingError::Schema(format!(
                        "job class {} must be declared against root type {}, not {}",
                        job.name(),
                        ty.root(),
                        t.class
                    )));
                }
            }
        }

        let mut tables = HashMap::new();
        for ty in self.types.iter().filter(|t| t.root() == t.name()) {
            let transitions = self.jobs.iter().filter_map(|j| {
                j.state_transition()
                    .filter(|t| t.class == ty.name())
                    .map(|t| (t.old_states.as_slice(), t.new_state.as_str(), j.name()))
            });
            let built = StateTables::build(ty.name(), ty.states(), transitions)?;
            debug!(kind = ty.name(), states = ty.states().len(), "built state tables");
            tables.insert(ty.name().to_string(), built);
        }

        let mut reverse_deps: HashMap<String, Vec<Arc<LookupFn>>> = HashMap::new();
        for ty in &self.types {
            for rd in ty.reverse_deps() {
                if !types.contains_key(&rd.referenced_type) {
                    return Err(SchedulingError::Schema(format!(
                        "type {}: reverse dependency on unknown type {}",
                        ty.name(),
                        rd.referenced_type
                    )));
                }
                reverse_deps
                    .entry(rd.referenced_type.clone())
                    .or_default()
                    .push(rd.lookup.clone());
            }
        }

        Ok(Registry {
            types,
            jobs,
            job_order,
            tables,
            reverse_deps,
        })
    }
}

/// Static description of every stateful type and job class the scheduler
/// knows about.
pub struct Registry {
    types: HashMap<String, Arc<dyn StatefulType>>,
    jobs: HashMap<String, Arc<dyn JobClass>>,
    job_order: Vec<String>,
    tables: HashMap<String, StateTables>,
    reverse_deps: HashMap<String, Vec<Arc<LookupFn>>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn type_of(&self, kind: &str) -> Result<&Arc<dyn StatefulType>, SchedulingError> {
        self.types
            .get(kind)
            .ok_or_else(|| SchedulingError::UnknownType(kind.to_string()))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn tables(&self, kind: &str) -> Result<&StateTables, SchedulingError> {
        let ty = self.type_of(kind)?;
        self.tables
            .get(ty.root())
            .ok_or_else(|| SchedulingError::UnknownType(ty.root().to_string()))
    }

    pub fn get_route(&self, kind: &str, from: &str, to: &str) -> Result<Vec<String>, SchedulingError> {
        self.tables(kind)?.get_route(from, to)
    }

    /// Target states that may be requested for `object` right now.
    pub fn get_available_states(&self, object: &StatefulObject) -> Result<Vec<String>, SchedulingError> {
        let ty = self.type_of(&object.key.kind)?;
        if object.immutable_state {
            return Ok(ty.immutable_transitions(&object.state));
        }
        Ok(self.tables(&object.key.kind)?.reachable_from(&object.state).to_vec())
    }

    pub fn job_class(&self, name: &str) -> Result<&Arc<dyn JobClass>, SchedulingError> {
        self.jobs
            .get(name)
            .ok_or_else(|| SchedulingError::UnknownJobClass(name.to_string()))
    }

    /// Job classes in registration order.
    pub fn job_classes(&self) -> impl Iterator<Item = &Arc<dyn JobClass>> {
        self.job_order.iter().filter_map(|n| self.jobs.get(n))
    }

    /// The state-change job class moving `kind` from `from` to `to` in one hop.
    pub fn job_class_for(&self, kind: &str, from: &str, to: &str) -> Result<&Arc<dyn JobClass>, SchedulingError> {
        let tables = self.tables(kind)?;
        let name = tables
            .job_class(from, to)
            .ok_or_else(|| SchedulingError::NoRoute {
                kind: tables.kind().to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })?;
        self.job_class(name)
    }

    /// Objects that may depend on `object`. With `inclusive`, dependents of
    /// dependents are included too.
    pub fn get_dependent_objects(
        &self,
        object: &StatefulObject,
        store: &dyn Store,
        inclusive: bool,
    ) -> Vec<ObjectKey> {
        let mut seen: HashSet<ObjectKey> = HashSet::new();
        let mut out = Vec::new();
        let mut queue = vec![object.clone()];
        while let Some(current) = queue.pop() {
            for key in self.direct_dependents(&current, store) {
                if key == object.key || !seen.insert(key.clone()) {
                    continue;
                }
                if inclusive && let Some(dependent) = store.get_object(&key) {
                    queue.push(dependent);
                }
                out.push(key);
            }
        }
        out
    }

    fn direct_dependents(&self, object: &StatefulObject, store: &dyn Store) -> Vec<ObjectKey> {
        let mut names = vec![object.key.kind.as_str()];
        if let Ok(ty) = self.type_of(&object.key.kind)
            && ty.root() != ty.name()
        {
            names.push(ty.root());
        }
        names
            .into_iter()
            .filter_map(|n| self.reverse_deps.get(n))
            .flatten()
            .flat_map(|lookup| lookup(object, store))
            .collect()
    }
}
