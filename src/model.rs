//! Declarative world model: stateful types, job classes with their steps,
//! and initial objects, loaded from TOML.
//!
//! Dependencies name the attribute holding the referenced object's id, so
//! reverse dependencies are derived from them without extra declarations.
//! Steps either run an action on the agent of the host the object lives on,
//! or run locally.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{JobPlanError, SchedulingError, StepError};
use crate::state_machine::{
    Advertisement, AttrValue, DependOn, Dependable, FieldKind, JobClass, JobSpec, ObjectKey,
    Registry, ReverseDep, StateTransition, StatefulObject, StatefulType, Step, StepArgs,
    StepContext, StepSpec,
};
use crate::store::Store;

/// `attr` on the depending object (or job argument) holds the id of an
/// object of type `kind`.
#[derive(Debug, Clone, Deserialize)]
pub struct DepDecl {
    /// States of the depending object in which this applies. Empty: all.
    #[serde(default)]
    pub in_states: Vec<String>,
    pub attr: String,
    pub kind: String,
    pub preferred: String,
    #[serde(default)]
    pub acceptable: Vec<String>,
    #[serde(default)]
    pub unacceptable: Vec<String>,
    #[serde(default)]
    pub fix_state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    #[serde(default)]
    pub root: Option<String>,
    pub states: Vec<String>,
    pub initial_state: String,
    #[serde(default)]
    pub deletable_states: Vec<String>,
    /// Targets offered when the object is observed-only.
    #[serde(default)]
    pub immutable_transitions: Vec<String>,
    #[serde(default)]
    pub timestamp_fields: Vec<String>,
    #[serde(default)]
    pub deps: Vec<DepDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionDecl {
    pub class: String,
    pub from: Vec<String>,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDecl {
    #[serde(default)]
    pub name: Option<String>,
    /// Agent action to run. Without one the step runs locally.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub args: StepArgs,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub database: bool,
    /// Wait this long for the agent to reconnect after the action.
    #[serde(default)]
    pub await_restart_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobDecl {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub transition: Option<TransitionDecl>,
    #[serde(default)]
    pub advertise: Option<Advertisement>,
    /// UI verb for a state-change job.
    #[serde(default)]
    pub verb: Option<String>,
    #[serde(default = "default_true")]
    pub cancellable: bool,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub confirmation_prompt: Option<String>,
    /// For advertised jobs: object states in which the verb is offered.
    #[serde(default)]
    pub run_in_states: Vec<String>,
    #[serde(default)]
    pub deps: Vec<DepDecl>,
    #[serde(default)]
    pub steps: Vec<StepDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectDecl {
    pub kind: String,
    pub id: u64,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub immutable_state: bool,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct World {
    #[serde(default)]
    pub types: Vec<TypeDecl>,
    #[serde(default)]
    pub jobs: Vec<JobDecl>,
    #[serde(default)]
    pub objects: Vec<ObjectDecl>,
}

impl World {
    pub fn from_toml(content: &str) -> Result<Self, JobPlanError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, JobPlanError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn registry(&self) -> Result<Registry, SchedulingError> {
        let kind_states: Arc<HashMap<String, Vec<String>>> = Arc::new(
            self.types
                .iter()
                .map(|t| (t.name.clone(), t.states.clone()))
                .collect(),
        );
        let all_deps = self
            .types
            .iter()
            .flat_map(|t| t.deps.iter().map(move |d| (t.name.as_str(), d)))
            .chain(
                self.jobs
                    .iter()
                    .flat_map(|j| j.deps.iter().map(move |d| (j.name.as_str(), d))),
            );
        for (owner, dep) in all_deps {
            validate_dep(owner, dep, &kind_states)?;
        }

        let mut builder = Registry::builder();
        for decl in &self.types {
            builder = builder.register_type(Arc::new(ModelType {
                decl: decl.clone(),
                kind_states: kind_states.clone(),
            }));
        }
        for decl in &self.jobs {
            builder = builder.register_job(Arc::new(ModelJob::new(decl.clone(), kind_states.clone())?));
        }
        builder.build()
    }

    /// Insert every declared object not already in `store`. Returns how
    /// many were inserted.
    pub fn populate(&self, store: &dyn Store) -> Result<usize, JobPlanError> {
        let types: HashMap<&str, &TypeDecl> =
            self.types.iter().map(|t| (t.name.as_str(), t)).collect();
        let mut inserted = 0;
        for decl in &self.objects {
            let key = ObjectKey::new(decl.kind.clone(), decl.id);
            if store.get_object(&key).is_some() {
                continue;
            }
            let ty = types
                .get(decl.kind.as_str())
                .ok_or_else(|| SchedulingError::UnknownType(decl.kind.clone()))?;
            let state = decl.state.clone().unwrap_or_else(|| ty.initial_state.clone());
            if !ty.states.contains(&state) {
                return Err(SchedulingError::InvalidState {
                    kind: ty.name.clone(),
                    state,
                    legal: ty.states.clone(),
                }
                .into());
            }
            let mut object = StatefulObject::new(key, state);
            object.immutable_state = decl.immutable_state;
            for (name, value) in &decl.attrs {
                let value = match (ty.timestamp_fields.contains(name), value.as_str()) {
                    (true, Some(text)) => chrono::DateTime::parse_from_rfc3339(text)
                        .map(|t| AttrValue::Timestamp(t.with_timezone(&chrono::Utc)))
                        .map_err(|e| JobPlanError::Config(format!("{name}: {e}")))?,
                    _ => AttrValue::Value(value.clone()),
                };
                object.attrs.insert(name.clone(), value);
            }
            store.insert_object(object)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// FQDNs of every declared object that carries one.
    pub fn fqdns(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .objects
            .iter()
            .filter_map(|o| o.attrs.get("fqdn").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

fn validate_dep(
    owner: &str,
    dep: &DepDecl,
    kind_states: &HashMap<String, Vec<String>>,
) -> Result<(), SchedulingError> {
    let Some(states) = kind_states.get(&dep.kind) else {
        return Err(SchedulingError::Schema(format!(
            "{owner}: dependency on unknown type {}",
            dep.kind
        )));
    };
    if !dep.acceptable.is_empty() && !dep.unacceptable.is_empty() {
        return Err(SchedulingError::Schema(format!(
            "{owner}: dependency on {} gives both acceptable and unacceptable states",
            dep.kind
        )));
    }
    for state in std::iter::once(&dep.preferred)
        .chain(&dep.acceptable)
        .chain(&dep.unacceptable)
    {
        if !states.contains(state) {
            return Err(SchedulingError::InvalidState {
                kind: dep.kind.clone(),
                state: state.clone(),
                legal: states.clone(),
            });
        }
    }
    Ok(())
}

/// An object reference held in an attribute or argument: a bare id, a
/// `kind/id` string, or a `{kind, id}` table.
fn key_from_value(value: &Value, kind: &str) -> Option<ObjectKey> {
    match value {
        Value::Number(n) => n.as_u64().map(|id| ObjectKey::new(kind, id)),
        Value::String(s) => s.parse().ok(),
        Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

fn depend_on(decl: &DepDecl, target: ObjectKey, kind_states: &HashMap<String, Vec<String>>) -> DependOn {
    let dep = if !decl.unacceptable.is_empty() {
        let unacceptable: Vec<&str> = decl.unacceptable.iter().map(String::as_str).collect();
        let all = kind_states.get(&decl.kind).map(Vec::as_slice).unwrap_or(&[]);
        DependOn::unacceptable(target, decl.preferred.clone(), &unacceptable, all)
    } else if !decl.acceptable.is_empty() {
        let acceptable: Vec<&str> = decl.acceptable.iter().map(String::as_str).collect();
        DependOn::acceptable(target, decl.preferred.clone(), &acceptable)
    } else {
        DependOn::new(target, decl.preferred.clone())
    };
    match &decl.fix_state {
        Some(fix) => dep.with_fix_state(fix.as_str()),
        None => dep,
    }
}

/// Host FQDN for an object: its own `fqdn` attribute, or that of the host
/// referenced by its `host` attribute.
fn resolve_fqdn(object: &StatefulObject, store: &dyn Store) -> Option<String> {
    if let Some(fqdn) = object.attr_str("fqdn") {
        return Some(fqdn.to_string());
    }
    let AttrValue::Value(host) = object.attrs.get("host")? else {
        return None;
    };
    let host = store.get_object(&key_from_value(host, "host")?)?;
    host.attr_str("fqdn").map(str::to_string)
}

struct ModelType {
    decl: TypeDecl,
    kind_states: Arc<HashMap<String, Vec<String>>>,
}

impl StatefulType for ModelType {
    fn name(&self) -> &str {
        &self.decl.name
    }

    fn root(&self) -> &str {
        self.decl.root.as_deref().unwrap_or(&self.decl.name)
    }

    fn states(&self) -> &[String] {
        &self.decl.states
    }

    fn initial_state(&self) -> &str {
        &self.decl.initial_state
    }

    fn get_deps(&self, object: &StatefulObject, state: &str, _store: &dyn Store) -> Dependable {
        let deps: Vec<Dependable> = self
            .decl
            .deps
            .iter()
            .filter(|d| d.in_states.is_empty() || d.in_states.iter().any(|s| s == state))
            .filter_map(|d| {
                let AttrValue::Value(v) = object.attrs.get(&d.attr)? else {
                    return None;
                };
                let target = key_from_value(v, &d.kind)?;
                Some(Dependable::from(depend_on(d, target, &self.kind_states)))
            })
            .collect();
        Dependable::All(deps)
    }

    fn reverse_deps(&self) -> Vec<ReverseDep> {
        self.decl
            .deps
            .iter()
            .map(|d| {
                let name = self.decl.name.clone();
                let attr = d.attr.clone();
                let kind = d.kind.clone();
                ReverseDep {
                    referenced_type: d.kind.clone(),
                    lookup: Arc::new(move |referenced: &StatefulObject, store: &dyn Store| {
                        store
                            .objects_of_kind(&name)
                            .into_iter()
                            .filter(|o| match o.attrs.get(&attr) {
                                Some(AttrValue::Value(v)) => {
                                    key_from_value(v, &kind).as_ref() == Some(&referenced.key)
                                }
                                _ => false,
                            })
                            .map(|o| o.key)
                            .collect()
                    }),
                }
            })
            .collect()
    }

    fn immutable_transitions(&self, _begin_state: &str) -> Vec<String> {
        self.decl.immutable_transitions.clone()
    }

    fn deletable_states(&self) -> &[String] {
        &self.decl.deletable_states
    }

    fn field_kind(&self, attr: &str) -> FieldKind {
        if self.decl.timestamp_fields.iter().any(|f| f == attr) {
            FieldKind::Timestamp
        } else {
            FieldKind::Json
        }
    }
}

struct ModelJob {
    decl: JobDecl,
    transition: Option<StateTransition>,
    steps: Vec<(Arc<dyn Step>, StepDecl)>,
    kind_states: Arc<HashMap<String, Vec<String>>>,
}

impl ModelJob {
    fn new(decl: JobDecl, kind_states: Arc<HashMap<String, Vec<String>>>) -> Result<Self, SchedulingError> {
        if decl.transition.is_some() && decl.advertise.is_some() {
            return Err(SchedulingError::Schema(format!(
                "job {} is both a state change and an advertised job",
                decl.name
            )));
        }
        let transition = decl.transition.as_ref().map(|t| StateTransition {
            class: t.class.clone(),
            old_states: t.from.clone(),
            new_state: t.to.clone(),
        });
        let steps = decl
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let name = s
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}Step{}", decl.name, i + 1));
                let step: Arc<dyn Step> = match &s.action {
                    Some(action) => Arc::new(AgentActionStep {
                        name,
                        action: action.clone(),
                        idempotent: s.idempotent,
                        database: s.database,
                        await_restart: s.await_restart_secs.map(Duration::from_secs),
                    }),
                    None => Arc::new(LocalStep {
                        name,
                        idempotent: s.idempotent,
                        database: s.database,
                    }),
                };
                (step, s.clone())
            })
            .collect();
        Ok(Self {
            decl,
            transition,
            steps,
            kind_states,
        })
    }

    /// Objects the job operates on.
    fn subjects(&self, job: &JobSpec) -> Vec<ObjectKey> {
        if let Some(key) = &job.stateful_object {
            return vec![key.clone()];
        }
        if let Some(key) = job.object_arg("object") {
            return vec![key];
        }
        job.objects_arg("objects")
    }
}

impl JobClass for ModelJob {
    fn name(&self) -> &str {
        &self.decl.name
    }

    fn state_transition(&self) -> Option<&StateTransition> {
        self.transition.as_ref()
    }

    fn advertisement(&self) -> Option<&Advertisement> {
        self.decl.advertise.as_ref()
    }

    fn cancellable(&self) -> bool {
        self.decl.cancellable
    }

    fn description(&self, job: &JobSpec) -> String {
        let subjects: Vec<String> = self.subjects(job).iter().map(ToString::to_string).collect();
        let subjects = subjects.join(", ");
        match &self.decl.description {
            Some(template) => template.replace("{object}", &subjects),
            None => match (&self.transition, &self.decl.advertise) {
                (Some(t), _) => format!(
                    "{} {subjects}: {} -> {}",
                    self.decl.name,
                    job.old_state.as_deref().unwrap_or("?"),
                    t.new_state
                ),
                (None, Some(a)) => format!("{} {subjects}", a.verb),
                (None, None) => format!("{} {subjects}", self.decl.name),
            },
        }
    }

    fn requires_confirmation(&self, _job: &JobSpec) -> bool {
        self.decl.requires_confirmation
    }

    fn confirmation_prompt(&self, _job: &JobSpec) -> Option<String> {
        self.decl.confirmation_prompt.clone()
    }

    fn state_verb(&self) -> Option<&str> {
        self.decl.verb.as_deref()
    }

    fn can_run(&self, object: &StatefulObject) -> bool {
        self.decl.run_in_states.is_empty() || self.decl.run_in_states.contains(&object.state)
    }

    fn get_deps(&self, job: &JobSpec, store: &dyn Store) -> Dependable {
        let subject = job
            .stateful_object
            .as_ref()
            .and_then(|key| store.get_object(key));
        let deps = self
            .decl
            .deps
            .iter()
            .filter_map(|d| {
                let target = match job.args.get(&d.attr) {
                    Some(v) => key_from_value(v, &d.kind),
                    None => match subject.as_ref()?.attrs.get(&d.attr)? {
                        AttrValue::Value(v) => key_from_value(v, &d.kind),
                        AttrValue::Timestamp(_) => None,
                    },
                }?;
                Some(Dependable::from(depend_on(d, target, &self.kind_states)))
            })
            .collect();
        Dependable::All(deps)
    }

    fn get_steps(&self, job: &JobSpec, store: &dyn Store) -> anyhow::Result<Vec<StepSpec>> {
        let subjects = self.subjects(job);
        let mut specs = Vec::new();
        for (step, decl) in &self.steps {
            if decl.action.is_none() {
                specs.push(StepSpec::new(step.clone(), decl.args.clone()));
                continue;
            }
            if subjects.is_empty() {
                return Err(anyhow!("{}: no object to run {} on", self.decl.name, step.name()));
            }
            for key in &subjects {
                let object = store
                    .get_object(key)
                    .ok_or_else(|| anyhow!("{}: object {key} not found", self.decl.name))?;
                let fqdn = resolve_fqdn(&object, store)
                    .ok_or_else(|| anyhow!("{}: no host for {key}", self.decl.name))?;
                let mut args = decl.args.clone();
                args.insert("fqdn".into(), Value::String(fqdn));
                args.insert("object".into(), serde_json::json!(key));
                specs.push(StepSpec::new(step.clone(), args));
            }
        }
        debug!(job = %self.decl.name, steps = specs.len(), "built steps");
        Ok(specs)
    }
}

/// Runs one action on the agent of the host named by the `fqdn` argument.
struct AgentActionStep {
    name: String,
    action: String,
    idempotent: bool,
    database: bool,
    await_restart: Option<Duration>,
}

#[async_trait]
impl Step for AgentActionStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn database(&self) -> bool {
        self.database
    }

    fn describe(&self, args: &StepArgs) -> String {
        let fqdn = args.get("fqdn").and_then(Value::as_str).unwrap_or("?");
        format!("{} on {fqdn}", self.action)
    }

    async fn run(&self, ctx: &StepContext, args: &StepArgs) -> Result<Value, StepError> {
        let fqdn = args
            .get("fqdn")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::Failed(anyhow!("{}: missing fqdn argument", self.name)))?;
        let mut agent_args = args.clone();
        agent_args.remove("fqdn");
        if let Some(prev) = &ctx.prev_result
            && !prev.is_null()
        {
            agent_args.insert("prev_result".into(), prev.clone());
        }

        let old_session = ctx.session_id(fqdn);
        let result = ctx
            .invoke_agent(fqdn, &self.action, Value::Object(agent_args))
            .await?;
        if let Some(timeout) = self.await_restart {
            ctx.log(&format!("Waiting for {fqdn} to restart"));
            ctx.await_restart(fqdn, old_session, timeout).await?;
        }
        Ok(result)
    }
}

/// Does no I/O. Returns its `result` argument, if any.
struct LocalStep {
    name: String,
    idempotent: bool,
    database: bool,
}

#[async_trait]
impl Step for LocalStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn database(&self) -> bool {
        self.database
    }

    async fn run(&self, ctx: &StepContext, args: &StepArgs) -> Result<Value, StepError> {
        ctx.log(&format!("{} complete", self.name));
        Ok(args.get("result").cloned().unwrap_or(Value::Null))
    }
}
