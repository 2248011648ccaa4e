//! Translates requests into commands: either "put these objects into these
//! states" or "run these jobs". Produces jobs with their locks and wait-for
//! edges populated.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dep_cache::DepCache;
use crate::error::SchedulingError;
use crate::lock_cache::{LockCache, LockRequest, StateLock};
use crate::state_machine::{
    Command, DependOn, Job, JobArgs, JobId, JobSpec, ObjectKey, Registry, StatefulObject,
};
use crate::store::Store;

/// One hop of a stateful object from `old_state` to `new_state`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transition {
    pub object: ObjectKey,
    pub old_state: String,
    pub new_state: String,
}

impl Transition {
    pub fn new(object: ObjectKey, old_state: impl Into<String>, new_state: impl Into<String>) -> Self {
        Self {
            object,
            old_state: old_state.into(),
            new_state: new_state.into(),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.object, self.old_state, self.new_state)
    }
}

/// A raw job request for `command_run_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub class_name: String,
    #[serde(default)]
    pub args: JobArgs,
    /// Indices of earlier entries in the same request this job waits for.
    #[serde(default)]
    pub depends_on_job_range: Vec<usize>,
}

impl JobDescriptor {
    pub fn new(class_name: impl Into<String>, args: JobArgs) -> Self {
        Self {
            class_name: class_name.into(),
            args,
            depends_on_job_range: Vec::new(),
        }
    }
}

/// Result of a planning pass, not yet committed to the store.
#[derive(Debug, Clone)]
pub struct PlannedCommand {
    pub command: Command,
    /// Newly created jobs in execution order.
    pub jobs: Vec<Job>,
}

/// UI-facing description of a job a transition would create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub class: String,
    pub requires_confirmation: bool,
    pub confirmation_prompt: Option<String>,
    pub description: String,
    pub stateful_object: Option<ObjectKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionConsequences {
    pub transition_job: Option<JobDescription>,
    pub dependency_jobs: Vec<JobDescription>,
}

/// One planning pass. Mutates `lock_cache` as jobs are created, so callers
/// hand in a staged copy and keep it only if planning succeeds.
pub struct CommandPlan<'a> {
    registry: &'a Registry,
    store: &'a dyn Store,
    lock_cache: &'a mut LockCache,
    dep_cache: DepCache,
    expected_states: HashMap<ObjectKey, String>,
    deps: Vec<Transition>,
    dep_set: HashSet<Transition>,
    /// `(a, b)`: a cannot run before b.
    edges: Vec<(Transition, Transition)>,
    collected: HashSet<Transition>,
    new_jobs: Vec<Job>,
}

impl<'a> CommandPlan<'a> {
    pub fn new(registry: &'a Registry, store: &'a dyn Store, lock_cache: &'a mut LockCache) -> Self {
        Self {
            registry,
            store,
            lock_cache,
            dep_cache: DepCache::new(),
            expected_states: HashMap::new(),
            deps: Vec::new(),
            dep_set: HashSet::new(),
            edges: Vec::new(),
            collected: HashSet::new(),
            new_jobs: Vec::new(),
        }
    }

    pub fn command_set_state(
        mut self,
        requests: &[(ObjectKey, String)],
        message: &str,
    ) -> Result<PlannedCommand, SchedulingError> {
        if requests.is_empty() {
            return Err(SchedulingError::EmptyRequest);
        }
        let mut command = Command::new(self.store.next_command_id(), message);
        for (key, state) in requests {
            self.set_state(key, state, &mut command)?;
        }
        Ok(self.finish(command))
    }

    pub fn command_run_jobs(
        mut self,
        jobs: &[JobDescriptor],
        message: &str,
    ) -> Result<PlannedCommand, SchedulingError> {
        let mut command = Command::new(self.store.next_command_id(), message);
        self.run_jobs_into(jobs, &mut command)?;
        Ok(self.finish(command))
    }

    /// Run `jobs`, then put every object in `preserve` back into the state
    /// it is in now.
    pub fn command_run_jobs_preserve_states(
        mut self,
        jobs: &[JobDescriptor],
        preserve: &[ObjectKey],
        message: &str,
    ) -> Result<PlannedCommand, SchedulingError> {
        let restore: Vec<(ObjectKey, String)> = preserve
            .iter()
            .map(|key| self.object(key).map(|o| (o.key, o.state)))
            .collect::<Result<_, _>>()?;

        let mut command = Command::new(self.store.next_command_id(), message);
        self.run_jobs_into(jobs, &mut command)?;
        for (key, state) in &restore {
            self.set_state(key, state, &mut command)?;
        }
        Ok(self.finish(command))
    }

    /// Read-only preview of what requesting `new_state` would do. Ignores
    /// queued jobs and plans against committed states only.
    pub fn get_transition_consequences(
        mut self,
        key: &ObjectKey,
        new_state: &str,
    ) -> Result<TransitionConsequences, SchedulingError> {
        let object = self.object(key)?;
        self.expected_states.clear();
        self.emit_transition_deps(
            Transition::new(key.clone(), object.state.clone(), new_state),
            &HashMap::new(),
        )?;
        let order = self.sort_graph()?;

        let mut descriptions = Vec::with_capacity(order.len());
        for t in &order {
            let spec = self.transition_spec(t)?;
            let class = self.registry.job_class(&spec.class_name)?;
            descriptions.push(JobDescription {
                class: spec.class_name.clone(),
                requires_confirmation: class.requires_confirmation(&spec),
                confirmation_prompt: class.confirmation_prompt(&spec),
                description: class.description(&spec),
                stateful_object: spec.stateful_object.clone(),
            });
        }
        let transition_job = descriptions.pop();
        Ok(TransitionConsequences {
            transition_job,
            dependency_jobs: descriptions,
        })
    }

    fn finish(self, mut command: Command) -> PlannedCommand {
        info!(
            command_id = command.id,
            message = %command.message,
            jobs = command.jobs.len(),
            dep_cache_hits = self.dep_cache.hits,
            dep_cache_misses = self.dep_cache.misses,
            "planned command"
        );
        if command.jobs.is_empty() {
            command.mark_complete(false, false);
        }
        PlannedCommand {
            command,
            jobs: self.new_jobs,
        }
    }

    fn run_jobs_into(
        &mut self,
        descriptors: &[JobDescriptor],
        command: &mut Command,
    ) -> Result<(), SchedulingError> {
        if descriptors.is_empty() {
            return Err(SchedulingError::EmptyRequest);
        }
        let mut specs = Vec::with_capacity(descriptors.len());
        for (index, d) in descriptors.iter().enumerate() {
            if let Some(&bad) = d.depends_on_job_range.iter().find(|&&i| i >= index) {
                return Err(SchedulingError::InvalidJobRange {
                    index,
                    depends_on: bad,
                });
            }
            specs.push(self.descriptor_spec(d)?);
        }
        let ranges: Vec<&[usize]> = descriptors
            .iter()
            .map(|d| d.depends_on_job_range.as_slice())
            .collect();
        self.add_jobs(specs, command, &ranges)
    }

    fn descriptor_spec(&self, d: &JobDescriptor) -> Result<JobSpec, SchedulingError> {
        let class = self.registry.job_class(&d.class_name)?;
        let mut spec = JobSpec::new(d.class_name.clone(), d.args.clone());
        if let Some(t) = class.state_transition() {
            let key = spec.object_arg("object").ok_or_else(|| SchedulingError::InvalidArgs {
                class: d.class_name.clone(),
                reason: "state change jobs need an 'object' argument".into(),
            })?;
            let object = self.object(&key)?;
            let old_state = match d.args.get("old_state").and_then(|v| v.as_str()) {
                Some(s) => s.to_string(),
                None => self
                    .lock_cache
                    .expected_state(&key)
                    .map(str::to_string)
                    .unwrap_or(object.state),
            };
            if !t.old_states.contains(&old_state) {
                return Err(SchedulingError::NoRoute {
                    kind: t.class.clone(),
                    from: old_state,
                    to: t.new_state.clone(),
                });
            }
            spec.stateful_object = Some(key);
            spec.old_state = Some(old_state);
        }
        Ok(spec)
    }

    /// Queue `specs`, first setting up whatever their dependencies need.
    pub(crate) fn add_jobs(
        &mut self,
        specs: Vec<JobSpec>,
        command: &mut Command,
        ranges: &[&[usize]],
    ) -> Result<(), SchedulingError> {
        let mut ids: Vec<JobId> = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let deps = self
                .dep_cache
                .job_deps(self.registry, self.store, &spec)?;
            for d in deps.all() {
                if !self.currently_satisfied(d) {
                    info!(
                        target = %d.target,
                        state = %d.preferred_state,
                        "add_jobs: setting required dependency"
                    );
                    self.set_state(&d.target, &d.preferred_state, command)?;
                }
            }
            let explicit: Vec<JobId> = ranges
                .get(index)
                .map(|r| r.iter().filter_map(|&i| ids.get(i).copied()).collect())
                .unwrap_or_default();
            let id = self.add_job(spec, command, &explicit)?;
            ids.push(id);
        }
        Ok(())
    }

    fn currently_satisfied(&self, d: &DependOn) -> bool {
        self.store
            .get_object(&d.target)
            .is_some_and(|o| d.accepts(&o.state))
    }

    fn add_job(
        &mut self,
        spec: JobSpec,
        command: &mut Command,
        explicit_deps: &[JobId],
    ) -> Result<JobId, SchedulingError> {
        let id = self.store.next_job_id();
        let locks = self.create_locks(id, &spec)?;
        let wait_for = self.create_dependencies(id, &locks, explicit_deps)?;

        let mut job = Job::new(id, spec);
        job.wait_for = wait_for;
        job.locks = locks.clone();
        for lock in locks {
            self.lock_cache.add(lock);
        }
        debug!(
            job_id = id,
            class = %job.spec.class_name,
            wait_for = ?job.wait_for,
            "add_job: created job"
        );
        command.add_job(id);
        self.new_jobs.push(job);
        Ok(id)
    }

    fn object(&self, key: &ObjectKey) -> Result<StatefulObject, SchedulingError> {
        self.store
            .get_object(key)
            .ok_or_else(|| SchedulingError::ObjectNotFound(key.clone()))
    }

    fn expected_state(&self, object: &StatefulObject) -> String {
        self.expected_states
            .get(&object.key)
            .cloned()
            .unwrap_or_else(|| object.state.clone())
    }

    fn mid_transition_state(&self, object: &StatefulObject, stack: &HashMap<ObjectKey, String>) -> String {
        stack
            .get(&object.key)
            .cloned()
            .unwrap_or_else(|| self.expected_state(object))
    }

    /// The state-change job that would perform `t`.
    fn transition_spec(&self, t: &Transition) -> Result<JobSpec, SchedulingError> {
        let class = self
            .registry
            .job_class_for(&t.object.kind, &t.old_state, &t.new_state)?;
        Ok(JobSpec::state_change(
            class.name(),
            t.object.clone(),
            t.old_state.clone(),
        ))
    }

    fn set_state(
        &mut self,
        key: &ObjectKey,
        new_state: &str,
        command: &mut Command,
    ) -> Result<(), SchedulingError> {
        let object = self.object(key)?;
        info!(
            object = %key,
            from = %object.state,
            to = new_state,
            "set_state"
        );

        let mut available = self.registry.get_available_states(&object)?;
        available.push(object.state.clone());
        if !available.iter().any(|s| s == new_state) {
            return Err(SchedulingError::UnavailableState {
                object: key.clone(),
                state: new_state.to_string(),
                available,
            });
        }

        self.expected_states = self
            .lock_cache
            .get_write_by_locked_item()
            .into_iter()
            .filter_map(|(item, lock)| lock.end_state.clone().map(|s| (item.clone(), s)))
            .collect();

        let expected = self.expected_state(&object);
        if new_state == expected {
            info!(object = %key, state = new_state, "set_state: already expected to be in state");
            if object.state != new_state {
                if let Some(lock) = self.lock_cache.get_latest_write(key, None) {
                    info!(job_id = lock.job_id, state = new_state, "set_state: state to be reached by job");
                    command.add_job(lock.job_id);
                }
            }
            return Ok(());
        }

        self.deps.clear();
        self.dep_set.clear();
        self.edges.clear();
        self.collected.clear();
        self.emit_transition_deps(
            Transition::new(key.clone(), expected, new_state),
            &HashMap::new(),
        )?;

        // Job ids follow the order jobs would run in without parallelism.
        for t in self.sort_graph()? {
            let spec = self.transition_spec(&t)?;
            debug!(transition = %t, "set_state: dep");
            self.add_job(spec, command, &[])?;
        }
        Ok(())
    }

    /// Emit the hops from `t.old_state` to `t.new_state` and everything they
    /// depend on. Returns the last hop.
    fn emit_transition_deps(
        &mut self,
        t: Transition,
        stack: &HashMap<ObjectKey, String>,
    ) -> Result<Option<Transition>, SchedulingError> {
        if self.dep_set.contains(&t) {
            debug!(transition = %t, "emit_transition_deps: already scheduled");
            return Ok(Some(t));
        }

        // Later checks may assume the object already reached the new state.
        let mut stack = stack.clone();
        stack.insert(t.object.clone(), t.new_state.clone());

        if t.old_state == t.new_state {
            return Ok(None);
        }

        let route = self
            .registry
            .get_route(&t.object.kind, &t.old_state, &t.new_state)?;
        debug!(transition = %t, route = ?route, "emit_transition_deps");

        let mut prev: Option<Transition> = None;
        for hop in route.windows(2) {
            let hop = Transition::new(t.object.clone(), hop[0].clone(), hop[1].clone());
            if self.dep_set.insert(hop.clone()) {
                self.deps.push(hop.clone());
            }
            self.collect_dependencies(&hop, &stack)?;
            if let Some(p) = prev {
                self.edges.push((hop.clone(), p));
            }
            prev = Some(hop);
        }
        Ok(prev)
    }

    fn add_edge(&mut self, from: &Transition, to: Option<Transition>) {
        if let Some(to) = to {
            self.edges.push((from.clone(), to));
        }
    }

    fn collect_dependencies(
        &mut self,
        root: &Transition,
        stack: &HashMap<ObjectKey, String>,
    ) -> Result<(), SchedulingError> {
        if !self.collected.insert(root.clone()) {
            return Ok(());
        }
        let object = self.object(&root.object)?;

        // Explicitly required by the transition job.
        let spec = self.transition_spec(root)?;
        let transition_deps = self.dep_cache.job_deps(self.registry, self.store, &spec)?;
        for d in transition_deps.all() {
            let target = self.object(&d.target)?;
            let old_state = self.expected_state(&target);
            if !d.accepts(&old_state) {
                let sub = self.emit_transition_deps(
                    Transition::new(d.target.clone(), old_state, d.preferred_state.clone()),
                    stack,
                )?;
                self.add_edge(root, sub);
            }
        }

        // Statically required while in the new state.
        let static_deps =
            self.dep_cache
                .object_deps(self.registry, self.store, &object, &root.new_state)?;
        for d in static_deps.all() {
            if stack.contains_key(&d.target) {
                continue;
            }
            let target = self.object(&d.target)?;
            let old_state = self.mid_transition_state(&target, stack);
            if !d.accepts(&old_state) {
                debug!(target = %d.target, state = %old_state, "new state static requires");
                let sub = self.emit_transition_deps(
                    Transition::new(d.target.clone(), old_state, d.preferred_state.clone()),
                    stack,
                )?;
                self.add_edge(root, sub);
            }
        }

        // Whatever depended on the old state.
        for dependent_key in self
            .registry
            .get_dependent_objects(&object, self.store, false)
        {
            if stack.contains_key(&dependent_key) {
                continue;
            }
            let Some(dependent) = self.store.get_object(&dependent_key) else {
                continue;
            };
            let dependent_state = self.mid_transition_state(&dependent, stack);
            let deps =
                self.dep_cache
                    .object_deps(self.registry, self.store, &dependent, &dependent_state)?;
            for d in deps.all() {
                if d.target != root.object || d.accepts(&root.new_state) {
                    continue;
                }
                let fix = d.fix_state.as_ref().ok_or_else(|| SchedulingError::MissingFixState {
                    dependent: dependent_key.clone(),
                    dependent_state: dependent_state.clone(),
                    object: root.object.clone(),
                    acceptable: d.acceptable_states.clone(),
                })?;
                let fix_state = fix.resolve(&root.new_state);
                debug!(
                    dependent = %dependent_key,
                    dependent_state = %dependent_state,
                    object = %root.object,
                    new_state = %root.new_state,
                    fix_state = %fix_state,
                    "reverse dependency"
                );
                let sub = self.emit_transition_deps(
                    Transition::new(dependent_key.clone(), dependent_state.clone(), fix_state),
                    stack,
                )?;
                self.add_edge(root, sub);
            }
        }
        Ok(())
    }

    /// Order emitted transitions by their longest path to a leaf, leaves
    /// first. Stable for equal distances.
    fn sort_graph(&self) -> Result<Vec<Transition>, SchedulingError> {
        let mut children: HashMap<&Transition, Vec<&Transition>> = HashMap::new();
        for (parent, child) in &self.edges {
            children.entry(parent).or_default().push(child);
        }

        fn leaf_distance<'t>(
            node: &'t Transition,
            children: &HashMap<&'t Transition, Vec<&'t Transition>>,
            cache: &mut HashMap<&'t Transition, usize>,
            visiting: &mut HashSet<&'t Transition>,
        ) -> Result<usize, SchedulingError> {
            if let Some(&d) = cache.get(node) {
                return Ok(d);
            }
            if !visiting.insert(node) {
                return Err(SchedulingError::DependencyCycle(node.to_string()));
            }
            let mut distance = 0;
            if let Some(kids) = children.get(node) {
                for &child in kids {
                    distance = distance.max(leaf_distance(child, children, cache, visiting)? + 1);
                }
            }
            visiting.remove(node);
            cache.insert(node, distance);
            Ok(distance)
        }

        let mut cache = HashMap::new();
        let mut visiting = HashSet::new();
        let mut ordered = Vec::with_capacity(self.deps.len());
        for t in &self.deps {
            ordered.push((t, leaf_distance(t, &children, &mut cache, &mut visiting)?));
        }
        ordered.sort_by_key(|(_, d)| *d);
        Ok(ordered.into_iter().map(|(t, _)| t.clone()).collect())
    }

    /// Locks for a job: reads on everything it depends on, reads on what
    /// the object needs in both its old and new state, the write lock on the
    /// object, and whatever the job class adds.
    fn create_locks(&mut self, job_id: JobId, spec: &JobSpec) -> Result<Vec<StateLock>, SchedulingError> {
        let registry = self.registry;
        let class = registry.job_class(&spec.class_name)?;
        let mut requests = Vec::new();

        let deps = self.dep_cache.job_deps(registry, self.store, spec)?;
        requests.extend(deps.all().into_iter().map(|d| LockRequest::Read(d.target.clone())));

        if let Some(t) = class.state_transition() {
            let (Some(key), Some(old_state)) = (&spec.stateful_object, &spec.old_state) else {
                return Err(SchedulingError::InvalidArgs {
                    class: spec.class_name.clone(),
                    reason: "state change job without object or old state".into(),
                });
            };
            let object = self.object(key)?;
            let old_deps = self
                .dep_cache
                .object_deps(registry, self.store, &object, old_state)?;
            let new_deps = self
                .dep_cache
                .object_deps(registry, self.store, &object, &t.new_state)?;
            requests.extend(
                old_deps
                    .all()
                    .into_iter()
                    .chain(new_deps.all())
                    .map(|d| LockRequest::Read(d.target.clone())),
            );
            requests.push(LockRequest::Write {
                item: key.clone(),
                begin_state: Some(old_state.clone()),
                end_state: Some(t.new_state.clone()),
            });
        }

        requests.extend(class.create_locks(spec, self.store));
        Ok(requests
            .into_iter()
            .map(|r| StateLock::from_request(job_id, r))
            .collect())
    }

    /// Wait-for edges from lock overlap with queued jobs: a write waits for
    /// the previous write and every read queued since; a read waits for the
    /// previous write.
    fn create_dependencies(
        &self,
        job_id: JobId,
        locks: &[StateLock],
        explicit: &[JobId],
    ) -> Result<Vec<JobId>, SchedulingError> {
        let mut wait_for: Vec<JobId> = Vec::new();
        let mut push = |id: JobId| {
            if !wait_for.contains(&id) {
                wait_for.push(id);
            }
        };

        for lock in locks {
            let prior_write = self
                .lock_cache
                .get_latest_write(&lock.locked_item, Some(job_id));
            if lock.write {
                let barrier = match prior_write {
                    Some(prior) => {
                        if let (Some(begin), Some(end)) = (&lock.begin_state, &prior.end_state) {
                            if begin != end {
                                return Err(SchedulingError::LockChain {
                                    job: job_id,
                                    item: lock.locked_item.clone(),
                                    begin: begin.clone(),
                                    prior: prior.job_id,
                                    end: end.clone(),
                                });
                            }
                        }
                        push(prior.job_id);
                        prior.job_id
                    }
                    None => 0,
                };
                for read in self
                    .lock_cache
                    .get_read_locks(&lock.locked_item, barrier, Some(job_id))
                {
                    push(read.job_id);
                }
            } else if let Some(prior) = prior_write {
                push(prior.job_id);
            }
        }

        for &id in explicit {
            push(id);
        }
        Ok(wait_for)
    }
}
