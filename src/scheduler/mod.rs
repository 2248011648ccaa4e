//! Job scheduler runtime: accepts planned commands, starts jobs once their
//! predecessors have succeeded, records outcomes and cascades failures.
//!
//! All bookkeeping (job collection, lock cache, running tokens) lives
//! behind one mutex held only for short in-memory work. Steps run outside
//! it, bounded by a general and a database worker pool.

mod collection;
mod runner;
mod service;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use collection::{JobCollection, WaitStatus};
pub use service::Service;

use crate::agent_rpc::AgentMessenger;
use crate::config::SchedulerConfig;
use crate::error::{JobPlanError, SchedulingError};
use crate::lock_cache::{LockCache, StateLock};
use crate::notification::{self, Notification, NotificationQueue};
use crate::planner::{CommandPlan, JobDescriptor, PlannedCommand, TransitionConsequences};
use crate::state_machine::{
    Command, CommandId, DependOn, Job, JobArgs, JobId, JobOutcome, JobSpec, JobState, ObjectKey,
    Registry, StatefulObject,
};
use crate::store::Store;

/// Passed to completion hooks when a job or a notification changed an
/// object. `object` is `None` once the row has been deleted.
#[derive(Debug, Clone)]
pub struct ObjectChanged {
    pub key: ObjectKey,
    pub object: Option<StatefulObject>,
    pub job_id: Option<JobId>,
    pub command_ids: Vec<CommandId>,
}

impl ObjectChanged {
    pub fn deleted(&self) -> bool {
        self.object.is_none()
    }
}

pub type CompletionHook = dyn Fn(&ObjectChanged) + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableTransition {
    pub state: String,
    pub verb: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableJob {
    pub class_name: String,
    pub verb: String,
    pub args: JobArgs,
    pub requires_confirmation: bool,
    pub confirmation_prompt: Option<String>,
}

/// Outstanding locks on one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemLocks {
    pub item: ObjectKey,
    pub read: Vec<StateLock>,
    pub write: Vec<StateLock>,
}

#[derive(Default)]
struct SchedulerState {
    lock_cache: LockCache,
    collection: JobCollection,
    /// Cancel tokens of tasked jobs.
    running: HashMap<JobId, CancellationToken>,
}

pub struct JobScheduler {
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    messenger: Arc<AgentMessenger>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    wake: Notify,
    general_pool: Semaphore,
    db_pool: Semaphore,
    hooks: Mutex<Vec<Arc<CompletionHook>>>,
    progress: watch::Sender<u64>,
    notifications: NotificationQueue,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
        messenger: Arc<AgentMessenger>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (progress, _) = watch::channel(0);
        Arc::new(Self {
            registry,
            store,
            messenger,
            general_pool: Semaphore::new(config.worker_pool_size.max(1)),
            db_pool: Semaphore::new(config.db_pool_size.max(1)),
            notifications: NotificationQueue::new(config.notification_queue_capacity),
            config,
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
            hooks: Mutex::new(Vec::new()),
            progress,
            shutdown,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn add_hook(&self, hook: impl Fn(&ObjectChanged) + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    fn fire_hooks(&self, changes: &[ObjectChanged]) {
        if changes.is_empty() {
            return;
        }
        let hooks: Vec<Arc<CompletionHook>> = self.hooks.lock().map(|h| h.clone()).unwrap_or_default();
        for change in changes {
            for hook in &hooks {
                hook(change);
            }
        }
    }

    fn bump_progress(&self) {
        self.progress.send_modify(|n| *n += 1);
    }

    /// Close out whatever a previous run left open: incomplete jobs become
    /// cancelled, incomplete commands errored and cancelled. Returns the
    /// number of jobs closed.
    pub fn recover(&self) -> Result<usize, JobPlanError> {
        let _state = self.lock();
        let mut closed = 0;
        for mut job in self.store.jobs().into_iter().filter(|j| !j.is_complete()) {
            warn!(job_id = job.id, state = %job.state, "cancelling job left over from previous run");
            job.set_state(JobState::Complete);
            job.cancelled = true;
            self.store.save_job(&job)?;
            closed += 1;
        }
        for mut command in self.store.commands().into_iter().filter(|c| !c.complete) {
            warn!(command_id = command.id, "closing command left over from previous run");
            command.mark_complete(true, true);
            self.store.save_command(&command)?;
        }
        Ok(closed)
    }

    pub fn command_set_state(
        &self,
        requests: &[(ObjectKey, String)],
        message: &str,
    ) -> Result<CommandId, SchedulingError> {
        self.plan(|plan| plan.command_set_state(requests, message))
    }

    pub fn command_run_jobs(&self, jobs: &[JobDescriptor], message: &str) -> Result<CommandId, SchedulingError> {
        self.plan(|plan| plan.command_run_jobs(jobs, message))
    }

    pub fn command_run_jobs_preserve_states(
        &self,
        jobs: &[JobDescriptor],
        preserve: &[ObjectKey],
        message: &str,
    ) -> Result<CommandId, SchedulingError> {
        self.plan(|plan| plan.command_run_jobs_preserve_states(jobs, preserve, message))
    }

    /// Plan against a staged copy of the lock cache; keep it only if
    /// planning succeeds.
    fn plan(
        &self,
        f: impl FnOnce(CommandPlan<'_>) -> Result<PlannedCommand, SchedulingError>,
    ) -> Result<CommandId, SchedulingError> {
        let command_id = {
            let mut state = self.lock();
            let mut staged = state.lock_cache.clone();
            let planned = f(CommandPlan::new(&self.registry, self.store.as_ref(), &mut staged))?;
            state.lock_cache = staged;
            self.commit_plan(&mut state, planned)
        };
        self.bump_progress();
        self.wake.notify_one();
        Ok(command_id)
    }

    fn commit_plan(&self, state: &mut SchedulerState, planned: PlannedCommand) -> CommandId {
        let PlannedCommand { command, jobs } = planned;
        for job in &jobs {
            if let Err(e) = self.store.save_job(job) {
                error!(job_id = job.id, error = %e, "could not persist job");
            }
        }
        if let Err(e) = self.store.save_command(&command) {
            error!(command_id = command.id, error = %e, "could not persist command");
        }
        info!(
            command_id = command.id,
            new_jobs = jobs.len(),
            jobs = command.jobs.len(),
            "command scheduled"
        );
        let id = command.id;
        state.collection.add_command(command, jobs);
        id
    }

    /// Preview of what requesting `new_state` would do. Never touches the
    /// live lock cache.
    pub fn get_transition_consequences(
        &self,
        key: &ObjectKey,
        new_state: &str,
    ) -> Result<TransitionConsequences, SchedulingError> {
        let mut staged = self.lock().lock_cache.clone();
        CommandPlan::new(&self.registry, self.store.as_ref(), &mut staged).get_transition_consequences(key, new_state)
    }

    /// Per object, the states that may be requested and the verb naming
    /// each. Objects with a queued writer offer nothing.
    pub fn available_transitions(
        &self,
        objects: &[ObjectKey],
    ) -> Result<BTreeMap<ObjectKey, Vec<AvailableTransition>>, SchedulingError> {
        let state = self.lock();
        let mut out = BTreeMap::new();
        for key in objects {
            let object = self
                .store
                .get_object(key)
                .ok_or_else(|| SchedulingError::ObjectNotFound(key.clone()))?;
            if state.lock_cache.get_latest_write(key, None).is_some() {
                out.insert(key.clone(), Vec::new());
                continue;
            }
            let mut transitions = Vec::new();
            for target in self.registry.get_available_states(&object)? {
                let verb = self
                    .transition_verb(&object, &target)
                    .unwrap_or_else(|| target.clone());
                transitions.push(AvailableTransition { state: target, verb });
            }
            out.insert(key.clone(), transitions);
        }
        Ok(out)
    }

    /// Verb of the job performing the last hop of the route to `target`.
    fn transition_verb(&self, object: &StatefulObject, target: &str) -> Option<String> {
        let route = self.registry.get_route(&object.key.kind, &object.state, target).ok()?;
        let [.., from, to] = route.as_slice() else {
            return None;
        };
        let class = self.registry.job_class_for(&object.key.kind, from, to).ok()?;
        Some(class.state_verb().unwrap_or(class.name()).to_string())
    }

    /// Per object, the advertised jobs that apply to it now, with the
    /// arguments to submit them. Busy objects offer nothing.
    pub fn available_jobs(
        &self,
        objects: &[ObjectKey],
    ) -> Result<BTreeMap<ObjectKey, Vec<AvailableJob>>, SchedulingError> {
        let state = self.lock();
        let mut out = BTreeMap::new();
        for key in objects {
            let object = self
                .store
                .get_object(key)
                .ok_or_else(|| SchedulingError::ObjectNotFound(key.clone()))?;
            if !state.lock_cache.get_by_locked_item(key).is_empty() {
                out.insert(key.clone(), Vec::new());
                continue;
            }
            let ty = self.registry.type_of(&key.kind)?;
            let mut jobs = Vec::new();
            for class in self.registry.job_classes() {
                let Some(advert) = class.advertisement() else {
                    continue;
                };
                let applies = advert.classes.iter().any(|c| c == ty.name() || c == ty.root());
                if !applies || !class.can_run(&object) {
                    continue;
                }
                let args = class.get_args(std::slice::from_ref(key));
                let spec = JobSpec::new(class.name(), args.clone());
                jobs.push(AvailableJob {
                    class_name: class.name().to_string(),
                    verb: advert.verb.clone(),
                    requires_confirmation: class.requires_confirmation(&spec),
                    confirmation_prompt: class.confirmation_prompt(&spec),
                    args,
                });
            }
            out.insert(key.clone(), jobs);
        }
        Ok(out)
    }

    /// Every outstanding lock, grouped by locked item.
    pub fn get_locks(&self) -> Vec<ItemLocks> {
        let state = self.lock();
        let mut by_item: BTreeMap<ObjectKey, ItemLocks> = BTreeMap::new();
        for lock in state.lock_cache.read_locks().chain(state.lock_cache.write_locks()) {
            let entry = by_item.entry(lock.locked_item.clone()).or_insert_with(|| ItemLocks {
                item: lock.locked_item.clone(),
                read: Vec::new(),
                write: Vec::new(),
            });
            if lock.write {
                entry.write.push(lock.clone());
            } else {
                entry.read.push(lock.clone());
            }
        }
        by_item.into_values().collect()
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        let from_collection = self.lock().collection.get(id).cloned();
        from_collection.or_else(|| self.store.get_job(id))
    }

    pub fn command(&self, id: CommandId) -> Option<Command> {
        let from_collection = self.lock().collection.command(id).cloned();
        from_collection.or_else(|| self.store.get_command(id))
    }

    /// Wait until command `id` is complete.
    pub async fn await_command(&self, id: CommandId) -> Result<Command, JobPlanError> {
        let mut progress = self.progress.subscribe();
        loop {
            let command = self.command(id).ok_or(JobPlanError::CommandNotFound(id))?;
            if command.complete {
                return Ok(command);
            }
            if progress.changed().await.is_err() {
                return Err(JobPlanError::CommandNotFound(id));
            }
        }
    }

    pub fn cancel_job(&self, job_id: JobId) -> Result<(), JobPlanError> {
        let changed = {
            let mut state = self.lock();
            self.cancel_job_locked(&mut state, job_id)?
        };
        self.fire_hooks(&changed);
        self.wake.notify_one();
        Ok(())
    }

    pub fn cancel_command(&self, command_id: CommandId) -> Result<(), JobPlanError> {
        let changed = {
            let mut state = self.lock();
            let job_ids = match state.collection.command(command_id) {
                Some(command) => command.jobs.clone(),
                None => self
                    .store
                    .get_command(command_id)
                    .map(|c| c.jobs)
                    .ok_or(JobPlanError::CommandNotFound(command_id))?,
            };
            info!(command_id, jobs = job_ids.len(), "cancelling command");
            let mut changed = Vec::new();
            for job_id in job_ids {
                changed.extend(self.cancel_job_locked(&mut state, job_id)?);
            }
            changed
        };
        self.fire_hooks(&changed);
        self.wake.notify_one();
        Ok(())
    }

    fn cancel_job_locked(&self, state: &mut SchedulerState, job_id: JobId) -> Result<Vec<ObjectChanged>, JobPlanError> {
        let Some((job_state, class_name)) = state
            .collection
            .get(job_id)
            .map(|j| (j.state, j.spec.class_name.clone()))
        else {
            // Evicted jobs are complete.
            return match self.store.get_job(job_id) {
                Some(_) => Ok(Vec::new()),
                None => Err(JobPlanError::JobNotFound(job_id)),
            };
        };
        match job_state {
            JobState::Complete => Ok(Vec::new()),
            JobState::Pending => {
                info!(job_id, "cancelling pending job");
                Ok(self.complete_job_locked(state, job_id, &JobOutcome::Cancelled))
            }
            JobState::Tasked => {
                let class = self.registry.job_class(&class_name)?;
                if class.cancellable() {
                    info!(job_id, "cancelling running job");
                    if let Some(token) = state.running.get(&job_id) {
                        token.cancel();
                    }
                    return Ok(Vec::new());
                }
                info!(job_id, "job is not cancellable, cancelling its dependents");
                let mut changed = Vec::new();
                for dependent in state.collection.dependents(job_id) {
                    changed.extend(self.complete_job_locked(state, dependent, &JobOutcome::Cancelled));
                }
                Ok(changed)
            }
        }
    }

    /// Mark `job_id` complete, release its locks and persist it. Failures
    /// cascade to every pending dependent, transitively.
    fn complete_job_locked(&self, state: &mut SchedulerState, job_id: JobId, outcome: &JobOutcome) -> Vec<ObjectChanged> {
        let Some(job) = state.collection.get_mut(job_id) else {
            return Vec::new();
        };
        if job.is_complete() {
            return Vec::new();
        }
        job.set_state(JobState::Complete);
        match outcome {
            JobOutcome::Success => {}
            JobOutcome::Errored(_) => job.errored = true,
            JobOutcome::Cancelled => job.cancelled = true,
        }
        let job = job.clone();
        state.lock_cache.remove_job(job_id);
        state.running.remove(&job_id);
        if let Err(e) = self.store.save_job(&job) {
            error!(job_id, error = %e, "could not persist job");
        }
        match outcome {
            JobOutcome::Success => info!(job_id, class = %job.spec.class_name, "job complete"),
            JobOutcome::Errored(reason) => {
                warn!(job_id, class = %job.spec.class_name, reason = %reason, "job errored");
                if let Ok(class) = self.registry.job_class(&job.spec.class_name) {
                    class.on_error(&job.spec, self.store.as_ref());
                }
            }
            JobOutcome::Cancelled => info!(job_id, class = %job.spec.class_name, "job cancelled"),
        }

        let command_ids = state.collection.commands_for_job(job_id);
        let mut changed = Vec::new();
        if job.succeeded() {
            for lock in job.locks.iter().filter(|l| l.write) {
                changed.push(ObjectChanged {
                    key: lock.locked_item.clone(),
                    object: self.store.get_object(&lock.locked_item),
                    job_id: Some(job_id),
                    command_ids: command_ids.clone(),
                });
            }
        } else {
            for dependent in state.collection.dependents(job_id) {
                debug!(job_id = dependent, failed = job_id, "cancelling dependent job");
                changed.extend(self.complete_job_locked(state, dependent, &JobOutcome::Cancelled));
            }
        }

        for command in state.collection.update_commands(job_id, self.store.as_ref()) {
            if let Err(e) = self.store.save_command(&command) {
                error!(command_id = command.id, error = %e, "could not persist command");
            }
            if command.complete {
                info!(command_id = command.id, status = %command.status(), "command complete");
            }
        }
        self.bump_progress();
        changed
    }

    /// Commit the outcome of a job's steps. On success the transitioned
    /// object's new state is written (or the row removed, for deletable
    /// states) before the locks are released.
    pub(crate) fn finish_job(&self, job_id: JobId, outcome: JobOutcome) {
        let changed = {
            let mut state = self.lock();
            let Some(job) = state.collection.get(job_id).cloned() else {
                warn!(job_id, "finished job is not in the collection");
                return;
            };
            let outcome = match outcome {
                JobOutcome::Success => match self.commit_success(&job) {
                    Ok(()) => JobOutcome::Success,
                    Err(e) => {
                        error!(job_id, error = %e, "could not commit job");
                        JobOutcome::Errored(format!("{e:#}"))
                    }
                },
                other => other,
            };
            let changed = self.complete_job_locked(&mut state, job_id, &outcome);
            state.collection.flush();
            changed
        };
        self.fire_hooks(&changed);
        self.wake.notify_one();
    }

    fn commit_success(&self, job: &Job) -> anyhow::Result<()> {
        let class = self.registry.job_class(&job.spec.class_name)?;
        if let (Some(transition), Some(key)) = (class.state_transition(), &job.spec.stateful_object) {
            let ty = self.registry.type_of(&key.kind)?;
            if ty.deletable_states().contains(&transition.new_state) {
                self.store.remove_object(key)?;
                info!(object = %key, state = %transition.new_state, "object removed");
            } else {
                let mut object = self
                    .store
                    .get_object(key)
                    .ok_or_else(|| anyhow::anyhow!("{key} no longer exists"))?;
                object.set_state(transition.new_state.clone());
                self.store.update_object(object)?;
                info!(object = %key, state = %transition.new_state, "state committed");
            }
        }
        class.on_success(&job.spec, self.store.as_ref())
    }

    /// Last-moment recheck of a job's dependencies against live state. For
    /// state-change jobs this also requires the object to still be in the
    /// state the job was planned from, its deps in the new state, and every
    /// dependent that cannot live with the new state to be in its fix state.
    fn deps_satisfied(&self, job: &Job) -> Result<(), String> {
        let store = self.store.as_ref();
        let class = self.registry.job_class(&job.spec.class_name).map_err(|e| e.to_string())?;
        if !class.get_deps(&job.spec, store).satisfied(store) {
            return Err(format!("dependencies of {} not satisfied", job.spec.class_name));
        }
        let (Some(transition), Some(key)) = (class.state_transition(), &job.spec.stateful_object) else {
            return Ok(());
        };
        let object = store.get_object(key).ok_or_else(|| format!("{key} no longer exists"))?;
        if let Some(old_state) = &job.spec.old_state
            && !DependOn::new(key.clone(), old_state.clone()).satisfied(store)
        {
            return Err(format!("{key} is {}, expected {old_state}", object.state));
        }
        let ty = self.registry.type_of(&key.kind).map_err(|e| e.to_string())?;
        if !ty.get_deps(&object, &transition.new_state, store).satisfied(store) {
            return Err(format!("dependencies of {key} in {} not satisfied", transition.new_state));
        }

        for dependent_key in self.registry.get_dependent_objects(&object, store, false) {
            let Some(dependent) = store.get_object(&dependent_key) else {
                continue;
            };
            let Ok(dependent_ty) = self.registry.type_of(&dependent_key.kind) else {
                continue;
            };
            let deps = dependent_ty.get_deps(&dependent, &dependent.state, store);
            for d in deps.all() {
                if d.target != *key || d.accepts(&transition.new_state) {
                    continue;
                }
                let fixed = match &d.fix_state {
                    Some(fix) => DependOn::new(dependent_key.clone(), fix.resolve(&transition.new_state)),
                    None => DependOn::impossible(dependent_key.clone()),
                };
                if !fixed.satisfied(store) {
                    return Err(format!(
                        "{dependent_key} still depends on {key} being {}",
                        object.state
                    ));
                }
            }
        }
        Ok(())
    }

    /// Move every runnable pending job to tasked. Returns the jobs to start.
    fn dispatch(&self) -> (Vec<(Job, CancellationToken)>, Vec<ObjectChanged>) {
        let mut state = self.lock();
        let mut started = Vec::new();
        let mut changed = Vec::new();
        for job_id in state.collection.pending_ids() {
            let Some(job) = state.collection.get(job_id).cloned() else {
                continue;
            };
            if job.state != JobState::Pending {
                continue;
            }
            match state.collection.wait_status(&job, self.store.as_ref()) {
                WaitStatus::Blocked => {}
                WaitStatus::Failed(prior) => {
                    debug!(job_id, prior, "predecessor did not succeed");
                    changed.extend(self.complete_job_locked(&mut state, job_id, &JobOutcome::Cancelled));
                }
                WaitStatus::Ready => {
                    if let Err(reason) = self.deps_satisfied(&job) {
                        changed.extend(self.complete_job_locked(&mut state, job_id, &JobOutcome::Errored(reason)));
                        continue;
                    }
                    let cancellable = self
                        .registry
                        .job_class(&job.spec.class_name)
                        .map(|c| c.cancellable())
                        .unwrap_or(true);
                    let token = self.shutdown.child_token();
                    // Non-cancellable jobs stop only for service shutdown.
                    let step_token = if cancellable {
                        token.clone()
                    } else {
                        self.shutdown.child_token()
                    };
                    let Some(row) = state.collection.get_mut(job_id) else {
                        continue;
                    };
                    row.set_state(JobState::Tasked);
                    let row = row.clone();
                    if let Err(e) = self.store.save_job(&row) {
                        error!(job_id, error = %e, "could not persist job");
                    }
                    state.running.insert(job_id, token);
                    debug!(job_id, class = %row.spec.class_name, "job tasked");
                    started.push((row, step_token));
                }
            }
        }
        if !changed.is_empty() {
            state.collection.flush();
        }
        (started, changed)
    }

    /// Scheduler loop: start runnable jobs whenever something completes,
    /// is planned or is notified. Returns an error if a job task panics.
    pub async fn run(self: Arc<Self>) -> Result<(), JobPlanError> {
        let mut workers: JoinSet<JobId> = JoinSet::new();
        info!(
            workers = self.config.worker_pool_size,
            db_workers = self.config.db_pool_size,
            "scheduler started"
        );
        let result = loop {
            let (started, changed) = self.dispatch();
            self.fire_hooks(&changed);
            for (job, token) in started {
                workers.spawn(runner::execute(self.clone(), job, token));
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                Some(joined) = workers.join_next() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!(error = %e, "job task panicked");
                        break Err(JobPlanError::WorkerPanic(e.to_string()));
                    }
                }
                _ = self.shutdown.cancelled() => break Ok(()),
            }
        };

        self.shutdown.cancel();
        let running: Vec<CancellationToken> = self.lock().running.values().cloned().collect();
        for token in running {
            token.cancel();
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                error!(error = %e, "job task panicked during shutdown");
            }
        }
        info!("scheduler stopped");
        result
    }

    /// Queue an out-of-band update for the notification worker.
    pub fn notify(&self, notification: Notification) {
        self.notifications.push(notification);
    }

    /// Apply one update under the scheduler lock, so queued writers are
    /// seen consistently.
    pub fn apply_notification(&self, notification: &Notification) -> Result<Option<StatefulObject>, JobPlanError> {
        let updated = {
            let state = self.lock();
            notification::apply(notification, &self.registry, self.store.as_ref(), &state.lock_cache)?
        };
        if let Some(object) = &updated {
            self.fire_hooks(&[ObjectChanged {
                key: object.key.clone(),
                object: Some(object.clone()),
                job_id: None,
                command_ids: Vec::new(),
            }]);
            self.wake.notify_one();
        }
        Ok(updated)
    }

    /// Drain the notification queue until shutdown.
    pub async fn run_notifications(self: Arc<Self>) {
        loop {
            tokio::select! {
                notification = self.notifications.pop() => {
                    if let Err(e) = self.apply_notification(&notification) {
                        warn!(object = %notification.key(), error = %e, "could not apply notification");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
        let dropped = self.notifications.dropped();
        if dropped > 0 {
            warn!(dropped, "notifications dropped on overflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};

    use super::*;
    use crate::agent_rpc::{ActionBehaviour, LoopbackAgent};
    use crate::error::StepError;
    use crate::model::World;
    use crate::state_machine::{
        CommandStatus, Dependable, JobClass, StateTransition, StatefulType, Step, StepArgs, StepContext,
        StepResultState, StepSpec,
    };
    use crate::store::MemoryStore;

    const WORLD: &str = r#"
[[types]]
name = "host"
states = ["lnet_down", "lnet_up", "removed"]
initial_state = "lnet_down"
deletable_states = ["removed"]

[[types]]
name = "target"
states = ["unmounted", "mounted"]
initial_state = "unmounted"

[[types.deps]]
in_states = ["mounted"]
attr = "host"
kind = "host"
preferred = "lnet_up"
fix_state = "unmounted"

[[types]]
name = "server"
states = ["stopped", "started", "failed"]
initial_state = "stopped"

[[types]]
name = "pipeline"
states = ["a", "b", "c", "d"]
initial_state = "a"

[[jobs]]
name = "StartLnetJob"
verb = "Start LNet"
transition = { class = "host", from = ["lnet_down"], to = "lnet_up" }
steps = [{ action = "start_lnet" }]

[[jobs]]
name = "StopLnetJob"
verb = "Stop LNet"
transition = { class = "host", from = ["lnet_up"], to = "lnet_down" }
steps = [{ action = "stop_lnet" }]

[[jobs]]
name = "RemoveHostJob"
verb = "Remove"
transition = { class = "host", from = ["lnet_down"], to = "removed" }

[[jobs]]
name = "MountTargetJob"
transition = { class = "target", from = ["unmounted"], to = "mounted" }
steps = [{ action = "mount_target", idempotent = true }]

[[jobs]]
name = "UnmountTargetJob"
transition = { class = "target", from = ["mounted"], to = "unmounted" }
steps = [{ action = "unmount_target" }]

[[jobs]]
name = "StartServerJob"
verb = "Start"
transition = { class = "server", from = ["stopped"], to = "started" }
steps = [{ action = "start_server" }]

[[jobs]]
name = "AToB"
cancellable = false
transition = { class = "pipeline", from = ["a"], to = "b" }
steps = [{ action = "slow" }]

[[jobs]]
name = "BToC"
transition = { class = "pipeline", from = ["b"], to = "c" }
steps = [{ action = "fast" }]

[[jobs]]
name = "CToD"
transition = { class = "pipeline", from = ["c"], to = "d" }
steps = [{ action = "fast" }]

[[jobs]]
name = "RebootHostJob"
advertise = { classes = ["host"], verb = "Reboot" }
run_in_states = ["lnet_up"]
steps = [{ action = "reboot" }]

[[objects]]
kind = "host"
id = 1
state = "lnet_down"
attrs = { fqdn = "oss1.local" }

[[objects]]
kind = "target"
id = 1
attrs = { host = 1 }

[[objects]]
kind = "server"
id = 1
attrs = { fqdn = "mgs1.local" }

[[objects]]
kind = "pipeline"
id = 1
attrs = { fqdn = "mgs1.local" }
"#;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            retry_base_delay_ms: 1,
            session_wait_timeout_secs: 5,
            ..SchedulerConfig::default()
        }
    }

    fn key(kind: &str, id: u64) -> ObjectKey {
        ObjectKey::new(kind, id)
    }

    fn set(key: &ObjectKey, state: &str) -> Vec<(ObjectKey, String)> {
        vec![(key.clone(), state.to_string())]
    }

    fn force_state(store: &MemoryStore, key: &ObjectKey, state: &str) {
        let mut object = store.get_object(key).unwrap();
        object.set_state(state);
        store.update_object(object).unwrap();
    }

    fn populated() -> (World, Arc<MemoryStore>) {
        let world = World::from_toml(WORLD).unwrap();
        let store = Arc::new(MemoryStore::new());
        world.populate(store.as_ref()).unwrap();
        (world, store)
    }

    fn start_with(
        prepare: impl FnOnce(&MemoryStore),
        agent: impl FnOnce(LoopbackAgent) -> LoopbackAgent,
    ) -> (Service, Arc<MemoryStore>) {
        let (world, store) = populated();
        prepare(store.as_ref());
        let agent = agent(LoopbackAgent::new(world.fqdns()));
        let service = Service::start(world.registry().unwrap(), store.clone(), config(), agent).unwrap();
        (service, store)
    }

    fn start(agent: impl FnOnce(LoopbackAgent) -> LoopbackAgent) -> (Service, Arc<MemoryStore>) {
        start_with(|_| {}, agent)
    }

    /// A scheduler whose loop is not running.
    fn idle() -> (Arc<JobScheduler>, Arc<MemoryStore>, CancellationToken) {
        let (world, store) = populated();
        let (messenger, _queue) = AgentMessenger::new(&config());
        let shutdown = CancellationToken::new();
        let scheduler = JobScheduler::new(
            Arc::new(world.registry().unwrap()),
            store.clone(),
            messenger,
            config(),
            shutdown.clone(),
        );
        (scheduler, store, shutdown)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn record_changes(scheduler: &JobScheduler) -> Arc<Mutex<Vec<ObjectChanged>>> {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        scheduler.add_hook(move |c| sink.lock().unwrap().push(c.clone()));
        changes
    }

    #[tokio::test]
    async fn single_step_transition() {
        let (mut service, store) = start(|a| a);
        let changes = record_changes(&service.scheduler);
        let server = key("server", 1);

        let id = service
            .scheduler
            .command_set_state(&set(&server, "started"), "go")
            .unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Successful);
        assert_eq!(command.jobs.len(), 1);
        assert_eq!(store.get_object(&server).unwrap().state, "started");
        let steps = store.step_results_for_job(command.jobs[0]);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].state, StepResultState::Success);
        assert_eq!(service.agent.actions(), vec!["start_server"]);

        let changes = changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, server);
        assert_eq!(changes[0].command_ids, vec![id]);
        assert!(service.scheduler.get_locks().is_empty());
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn multi_hop_route_runs_in_order() {
        let (mut service, store) = start(|a| a);
        let pipeline = key("pipeline", 1);
        let id = service
            .scheduler
            .command_set_state(&set(&pipeline, "c"), "go")
            .unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Successful);
        let jobs: Vec<Job> = command.jobs.iter().map(|j| store.get_job(*j).unwrap()).collect();
        assert_eq!(jobs[0].spec.class_name, "AToB");
        assert_eq!(jobs[1].spec.class_name, "BToC");
        assert_eq!(jobs[1].wait_for, vec![jobs[0].id]);
        assert_eq!(store.get_object(&pipeline).unwrap().state, "c");
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dependency_is_brought_up_first() {
        let (mut service, store) = start(|a| a);
        let id = service
            .scheduler
            .command_set_state(&set(&key("target", 1), "mounted"), "mount")
            .unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Successful);
        let mount = store.get_job(command.jobs[1]).unwrap();
        assert!(mount.wait_for.contains(&command.jobs[0]));
        assert_eq!(store.get_object(&key("host", 1)).unwrap().state, "lnet_up");
        assert_eq!(store.get_object(&key("target", 1)).unwrap().state, "mounted");
        assert_eq!(service.agent.actions(), vec!["start_lnet", "mount_target"]);
        assert_eq!(service.agent.calls()[1].fqdn, "oss1.local");
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dependent_is_moved_out_of_the_way() {
        let (mut service, store) = start_with(
            |store| {
                force_state(store, &key("host", 1), "lnet_up");
                force_state(store, &key("target", 1), "mounted");
            },
            |a| a,
        );
        let id = service
            .scheduler
            .command_set_state(&set(&key("host", 1), "lnet_down"), "stop")
            .unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Successful);
        assert_eq!(service.agent.actions(), vec!["unmount_target", "stop_lnet"]);
        assert_eq!(store.get_object(&key("target", 1)).unwrap().state, "unmounted");
        assert_eq!(store.get_object(&key("host", 1)).unwrap().state, "lnet_down");
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn same_state_request_shares_the_queued_job() {
        let (mut service, store) = start(|a| {
            a.with_action(
                "start_server",
                ActionBehaviour::ok(Value::Null).delayed(Duration::from_millis(200)),
            )
        });
        let server = key("server", 1);
        let first = service
            .scheduler
            .command_set_state(&set(&server, "started"), "first")
            .unwrap();
        let second = service
            .scheduler
            .command_set_state(&set(&server, "started"), "second")
            .unwrap();

        let first = service.await_command(first).await.unwrap();
        let second = service.await_command(second).await.unwrap();
        assert_eq!(second.jobs, first.jobs);
        assert_eq!(store.jobs().len(), 1);
        assert_eq!(first.status(), CommandStatus::Successful);
        assert_eq!(second.status(), CommandStatus::Successful);
        assert_eq!(service.agent.actions(), vec!["start_server"]);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_with_non_cancellable_head_cancels_downstream() {
        let (mut service, store) = start(|a| {
            a.with_action(
                "slow",
                ActionBehaviour::ok(Value::Null).delayed(Duration::from_millis(300)),
            )
        });
        let pipeline = key("pipeline", 1);
        let id = service
            .scheduler
            .command_set_state(&set(&pipeline, "d"), "go")
            .unwrap();
        let jobs = service.scheduler.command(id).unwrap().jobs;
        assert_eq!(jobs.len(), 3);

        let agent = service.agent.clone();
        wait_until(|| agent.actions().len() == 1).await;
        service.scheduler.cancel_command(id).unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Cancelled);
        assert!(store.get_job(jobs[0]).unwrap().succeeded());
        for id in &jobs[1..] {
            let job = store.get_job(*id).unwrap();
            assert!(job.is_complete() && job.cancelled && !job.errored);
            assert!(store.step_results_for_job(*id).is_empty());
        }
        assert_eq!(store.get_object(&pipeline).unwrap().state, "b");
        assert_eq!(service.agent.actions(), vec!["slow"]);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_a_running_job_cancels_the_agent_request() {
        let (mut service, store) = start(|a| {
            a.with_action(
                "start_server",
                ActionBehaviour::ok(Value::Null).delayed(Duration::from_secs(30)),
            )
        });
        let server = key("server", 1);
        let id = service
            .scheduler
            .command_set_state(&set(&server, "started"), "go")
            .unwrap();
        let job_id = service.scheduler.command(id).unwrap().jobs[0];

        let agent = service.agent.clone();
        wait_until(|| agent.actions().len() == 1).await;
        service.scheduler.cancel_job(job_id).unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Cancelled);
        let agent = service.agent.clone();
        wait_until(|| agent.cancels() == 1).await;
        assert_eq!(store.get_object(&server).unwrap().state, "stopped");
        let steps = store.step_results_for_job(job_id);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].state, StepResultState::Failed);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn idempotent_step_is_retried() {
        let (mut service, store) = start(|a| a.with_action("mount_target", ActionBehaviour::failing("EIO").times(2)));
        let id = service
            .scheduler
            .command_set_state(&set(&key("target", 1), "mounted"), "mount")
            .unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Successful);
        let mut attempts = store.step_results_for_job(command.jobs[1]);
        attempts.sort_by_key(|r| r.id);
        let states: Vec<StepResultState> = attempts.iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![StepResultState::Failed, StepResultState::Failed, StepResultState::Success]
        );
        assert!(attempts.iter().all(|r| r.step_index == 0));
        assert_eq!(attempts[0].backtrace, "EIO");
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_job_cancels_dependents() {
        let (mut service, store) =
            start(|a| a.with_action("start_lnet", ActionBehaviour::failing("Traceback: no lnet")));
        let id = service
            .scheduler
            .command_set_state(&set(&key("target", 1), "mounted"), "mount")
            .unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Errored);
        let start = store.get_job(command.jobs[0]).unwrap();
        let mount = store.get_job(command.jobs[1]).unwrap();
        assert!(start.errored);
        assert!(mount.cancelled && !mount.errored);
        assert!(store.step_results_for_job(start.id)[0].backtrace.contains("no lnet"));
        assert_eq!(store.get_object(&key("host", 1)).unwrap().state, "lnet_down");
        assert_eq!(service.agent.actions(), vec!["start_lnet"]);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn deletable_state_removes_the_row() {
        let (mut service, store) = start(|a| a);
        let changes = record_changes(&service.scheduler);
        let host = key("host", 1);
        let id = service
            .scheduler
            .command_set_state(&set(&host, "removed"), "remove")
            .unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Successful);
        assert!(store.get_object(&host).is_none());
        let changes = changes.lock().unwrap().clone();
        assert!(changes.iter().any(|c| c.key == host && c.deleted()));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn notifications_are_drained_by_the_worker() {
        let (service, store) = start(|a| a);
        let server = key("server", 1);
        service.scheduler.notify(
            Notification::new(&server, Utc::now() + chrono::Duration::seconds(5))
                .with_attr("state", json!("failed"))
                .with_attr("uptime", json!(42)),
        );
        let watched = store.clone();
        let watched_key = server.clone();
        wait_until(move || watched.get_object(&watched_key).is_some_and(|o| o.state == "failed")).await;
        assert!(store.get_object(&server).unwrap().attrs.contains_key("uptime"));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_recheck_errors_the_job() {
        let (scheduler, store, shutdown) = idle();
        force_state(&store, &key("host", 1), "lnet_up");
        let id = scheduler
            .command_set_state(&set(&key("target", 1), "mounted"), "mount")
            .unwrap();
        assert_eq!(scheduler.command(id).unwrap().jobs.len(), 1);
        force_state(&store, &key("host", 1), "lnet_down");

        let run = tokio::spawn(scheduler.clone().run());
        let command = scheduler.await_command(id).await.unwrap();
        assert_eq!(command.status(), CommandStatus::Errored);
        assert!(store.step_results_for_job(command.jobs[0]).is_empty());
        assert_eq!(store.get_object(&key("target", 1)).unwrap().state, "unmounted");

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn job_whose_object_moved_on_is_errored() {
        let (scheduler, store, _shutdown) = idle();
        let pipeline = key("pipeline", 1);
        let id = scheduler
            .command_set_state(&set(&pipeline, "c"), "go")
            .unwrap();
        let jobs = scheduler.command(id).unwrap().jobs;
        assert_eq!(jobs.len(), 2);

        // Agrees with the queued BToC, so the notification is applied.
        let n = Notification::new(&pipeline, Utc::now() + chrono::Duration::seconds(5))
            .with_attr("state", json!("c"));
        scheduler.apply_notification(&n).unwrap().unwrap();
        assert_eq!(store.get_object(&pipeline).unwrap().state, "c");

        let (started, _changed) = scheduler.dispatch();
        assert!(started.is_empty());
        let a_to_b = scheduler.job(jobs[0]).unwrap();
        assert_eq!(a_to_b.spec.class_name, "AToB");
        assert!(a_to_b.is_complete() && a_to_b.errored);
        assert!(store.step_results_for_job(a_to_b.id).is_empty());
        assert!(scheduler.job(jobs[1]).unwrap().cancelled);
        assert_eq!(store.get_object(&pipeline).unwrap().state, "c");
        assert_eq!(scheduler.command(id).unwrap().status(), CommandStatus::Errored);
    }

    #[test]
    fn job_is_held_back_while_a_dependent_still_needs_the_old_state() {
        let (scheduler, store, _shutdown) = idle();
        let host = key("host", 1);
        force_state(&store, &host, "lnet_up");
        let id = scheduler
            .command_set_state(&set(&host, "lnet_down"), "stop")
            .unwrap();
        let jobs = scheduler.command(id).unwrap().jobs;
        assert_eq!(jobs.len(), 1);

        // Mounted behind the planner's back.
        force_state(&store, &key("target", 1), "mounted");
        let (started, _changed) = scheduler.dispatch();
        assert!(started.is_empty());
        let stop = scheduler.job(jobs[0]).unwrap();
        assert_eq!(stop.spec.class_name, "StopLnetJob");
        assert!(stop.is_complete() && stop.errored);
        assert!(store.step_results_for_job(stop.id).is_empty());
        assert_eq!(store.get_object(&host).unwrap().state, "lnet_up");
    }

    #[test]
    fn notification_state_yields_to_queued_writer() {
        let (scheduler, store, _shutdown) = idle();
        let server = key("server", 1);
        scheduler
            .command_set_state(&set(&server, "started"), "go")
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);

        let n = Notification::new(&server, later)
            .with_attr("state", json!("failed"))
            .with_attr("uptime", json!(10));
        let updated = scheduler.apply_notification(&n).unwrap().unwrap();
        assert_eq!(updated.state, "stopped");
        assert!(updated.attrs.contains_key("uptime"));

        let n = Notification::new(&server, later).with_attr("state", json!("started"));
        scheduler.apply_notification(&n).unwrap().unwrap();
        assert_eq!(store.get_object(&server).unwrap().state, "started");
    }

    #[test]
    fn recover_cancels_leftovers() {
        let (scheduler, store, _shutdown) = idle();
        let mut job = Job::new(store.next_job_id(), JobSpec::new("StartServerJob", JobArgs::new()));
        job.set_state(JobState::Tasked);
        store.save_job(&job).unwrap();
        let mut command = Command::new(store.next_command_id(), "interrupted");
        command.add_job(job.id);
        store.save_command(&command).unwrap();

        assert_eq!(scheduler.recover().unwrap(), 1);
        let job = store.get_job(job.id).unwrap();
        assert!(job.is_complete() && job.cancelled);
        let command = store.get_command(command.id).unwrap();
        assert!(command.complete && command.errored && command.cancelled);
        assert_eq!(scheduler.recover().unwrap(), 0);
    }

    #[test]
    fn available_transitions_name_the_last_hop() {
        let (scheduler, _store, _shutdown) = idle();
        let host = key("host", 1);
        let available = scheduler.available_transitions(&[host.clone()]).unwrap();
        let mut offered: Vec<(String, String)> = available[&host]
            .iter()
            .map(|t| (t.state.clone(), t.verb.clone()))
            .collect();
        offered.sort();
        assert_eq!(
            offered,
            vec![
                ("lnet_up".to_string(), "Start LNet".to_string()),
                ("removed".to_string(), "Remove".to_string()),
            ]
        );

        let server = key("server", 1);
        scheduler
            .command_set_state(&set(&server, "started"), "go")
            .unwrap();
        assert!(scheduler.available_transitions(&[server.clone()]).unwrap()[&server].is_empty());

        let locks = scheduler.get_locks();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].item, server);
        assert_eq!(locks[0].write.len(), 1);
        assert_eq!(locks[0].write[0].end_state.as_deref(), Some("started"));
    }

    #[test]
    fn available_jobs_follow_can_run() {
        let (scheduler, store, _shutdown) = idle();
        let host = key("host", 1);
        assert!(scheduler.available_jobs(&[host.clone()]).unwrap()[&host].is_empty());

        force_state(&store, &host, "lnet_up");
        let jobs = scheduler.available_jobs(&[host.clone()]).unwrap();
        let offered = &jobs[&host];
        assert_eq!(offered.len(), 1);
        assert_eq!(offered[0].class_name, "RebootHostJob");
        assert_eq!(offered[0].verb, "Reboot");
        assert_eq!(offered[0].args["object"], json!({"kind": "host", "id": 1}));

        assert!(matches!(
            scheduler.available_jobs(&[key("host", 9)]),
            Err(SchedulingError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn scheduling_errors_leave_no_rows() {
        let (scheduler, store, _shutdown) = idle();
        let err = scheduler
            .command_set_state(&set(&key("server", 1), "bogus"), "go")
            .unwrap_err();
        assert!(matches!(err, SchedulingError::UnavailableState { .. }));
        assert!(store.jobs().is_empty());
        assert!(store.commands().is_empty());
        assert!(scheduler.get_locks().is_empty());
    }

    #[test]
    fn consequences_do_not_touch_live_locks() {
        let (scheduler, _store, _shutdown) = idle();
        let preview = scheduler
            .get_transition_consequences(&key("target", 1), "mounted")
            .unwrap();
        assert_eq!(preview.transition_job.unwrap().class, "MountTargetJob");
        assert_eq!(preview.dependency_jobs.len(), 1);
        assert!(scheduler.get_locks().is_empty());
    }

    struct Widget {
        states: Vec<String>,
    }

    impl StatefulType for Widget {
        fn name(&self) -> &str {
            "widget"
        }

        fn states(&self) -> &[String] {
            &self.states
        }

        fn initial_state(&self) -> &str {
            "off"
        }
    }

    fn widget_registry(job: Arc<dyn JobClass>) -> Registry {
        Registry::builder()
            .register_type(Arc::new(Widget {
                states: vec!["off".into(), "on".into()],
            }))
            .register_job(job)
            .build()
            .unwrap()
    }

    fn widgets(ids: &[u64]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store
                .insert_object(StatefulObject::new(key("widget", *id), "off"))
                .unwrap();
        }
        store
    }

    /// Turns a widget on once widget 2 is on; counts `on_error` calls.
    struct GuardedJob {
        transition: StateTransition,
        errors: Arc<AtomicUsize>,
    }

    impl JobClass for GuardedJob {
        fn name(&self) -> &str {
            "GuardedJob"
        }

        fn state_transition(&self) -> Option<&StateTransition> {
            Some(&self.transition)
        }

        fn description(&self, _job: &JobSpec) -> String {
            "Guarded".into()
        }

        fn get_deps(&self, job: &JobSpec, _store: &dyn Store) -> Dependable {
            match &job.stateful_object {
                Some(k) if k.id != 2 => DependOn::new(key("widget", 2), "on").into(),
                _ => Dependable::none(),
            }
        }

        fn get_steps(&self, _job: &JobSpec, _store: &dyn Store) -> anyhow::Result<Vec<StepSpec>> {
            Ok(Vec::new())
        }

        fn on_error(&self, _job: &JobSpec, _store: &dyn Store) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn failed_recheck_runs_the_error_hook() {
        let errors = Arc::new(AtomicUsize::new(0));
        let registry = widget_registry(Arc::new(GuardedJob {
            transition: StateTransition::new("widget", &["off"], "on"),
            errors: errors.clone(),
        }));
        let store = widgets(&[1, 2]);
        let mut on = store.get_object(&key("widget", 2)).unwrap();
        on.set_state("on");
        store.update_object(on).unwrap();

        let (messenger, _queue) = AgentMessenger::new(&config());
        let scheduler = JobScheduler::new(
            Arc::new(registry),
            store.clone(),
            messenger,
            config(),
            CancellationToken::new(),
        );
        let id = scheduler
            .command_set_state(&set(&key("widget", 1), "on"), "go")
            .unwrap();
        let mut off = store.get_object(&key("widget", 2)).unwrap();
        off.set_state("off");
        store.update_object(off).unwrap();

        let (started, _changed) = scheduler.dispatch();
        assert!(started.is_empty());
        assert_eq!(scheduler.command(id).unwrap().status(), CommandStatus::Errored);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    struct DbJob {
        transition: StateTransition,
        step: Arc<DbStep>,
    }

    impl JobClass for DbJob {
        fn name(&self) -> &str {
            "DbJob"
        }

        fn state_transition(&self) -> Option<&StateTransition> {
            Some(&self.transition)
        }

        fn description(&self, _job: &JobSpec) -> String {
            "Database work".into()
        }

        fn get_steps(&self, _job: &JobSpec, _store: &dyn Store) -> anyhow::Result<Vec<StepSpec>> {
            Ok(vec![StepSpec::new(self.step.clone(), StepArgs::new())])
        }
    }

    #[derive(Default)]
    struct DbStep {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Step for DbStep {
        fn name(&self) -> &str {
            "DbStep"
        }

        fn database(&self) -> bool {
            true
        }

        async fn run(&self, _ctx: &StepContext, _args: &StepArgs) -> Result<Value, StepError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn database_steps_share_the_db_pool() {
        let step = Arc::new(DbStep::default());
        let registry = widget_registry(Arc::new(DbJob {
            transition: StateTransition::new("widget", &["off"], "on"),
            step: step.clone(),
        }));
        let store = widgets(&[1, 2]);
        let config = SchedulerConfig {
            db_pool_size: 1,
            ..config()
        };
        let mut service =
            Service::start(registry, store.clone(), config, LoopbackAgent::new(Vec::<String>::new())).unwrap();

        let mut assignments = set(&key("widget", 1), "on");
        assignments.extend(set(&key("widget", 2), "on"));
        let id = service.scheduler.command_set_state(&assignments, "go").unwrap();
        let command = service.await_command(id).await.unwrap();

        assert_eq!(command.status(), CommandStatus::Successful);
        assert_eq!(command.jobs.len(), 2);
        assert_eq!(step.peak.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_object(&key("widget", 2)).unwrap().state, "on");
        service.shutdown().await.unwrap();
    }

    struct ExplodeJob {
        transition: StateTransition,
    }

    impl JobClass for ExplodeJob {
        fn name(&self) -> &str {
            "ExplodeJob"
        }

        fn state_transition(&self) -> Option<&StateTransition> {
            Some(&self.transition)
        }

        fn description(&self, _job: &JobSpec) -> String {
            "Explode".into()
        }

        fn get_steps(&self, _job: &JobSpec, _store: &dyn Store) -> anyhow::Result<Vec<StepSpec>> {
            Ok(vec![StepSpec::new(Arc::new(ExplodeStep), StepArgs::new())])
        }
    }

    struct ExplodeStep;

    #[async_trait]
    impl Step for ExplodeStep {
        fn name(&self) -> &str {
            "ExplodeStep"
        }

        async fn run(&self, _ctx: &StepContext, _args: &StepArgs) -> Result<Value, StepError> {
            panic!("step exploded")
        }
    }

    #[tokio::test]
    async fn panicking_step_fails_the_service() {
        let registry = Registry::builder()
            .register_type(Arc::new(Widget {
                states: vec!["off".into(), "on".into()],
            }))
            .register_job(Arc::new(ExplodeJob {
                transition: StateTransition::new("widget", &["off"], "on"),
            }))
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert_object(StatefulObject::new(key("widget", 1), "off"))
            .unwrap();
        let mut service =
            Service::start(registry, store.clone(), config(), LoopbackAgent::new(Vec::<String>::new())).unwrap();

        let id = service
            .scheduler
            .command_set_state(&set(&key("widget", 1), "on"), "go")
            .unwrap();
        let err = service.await_command(id).await.unwrap_err();
        assert!(matches!(err, JobPlanError::WorkerPanic(_)));
        let _ = service.shutdown().await;
    }
}