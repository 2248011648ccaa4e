//! In-memory view of outstanding jobs and the commands that own them.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::state_machine::{Command, CommandId, Job, JobId, JobState};
use crate::store::Store;

/// Whether a pending job's `wait_for` predecessors allow it to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    Blocked,
    /// A predecessor finished without succeeding.
    Failed(JobId),
}

#[derive(Debug, Default)]
pub struct JobCollection {
    jobs: BTreeMap<JobId, Job>,
    commands: HashMap<CommandId, Command>,
    commands_by_job: HashMap<JobId, Vec<CommandId>>,
}

impl JobCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly planned command. `jobs` are the jobs planning
    /// created; the command may also own jobs already in the collection.
    pub fn add_command(&mut self, command: Command, jobs: Vec<Job>) {
        for job in jobs {
            self.jobs.insert(job.id, job);
        }
        for job_id in &command.jobs {
            let owners = self.commands_by_job.entry(*job_id).or_default();
            if !owners.contains(&command.id) {
                owners.push(command.id);
            }
        }
        self.commands.insert(command.id, command);
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn command(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Pending job ids in creation order.
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.ids_in(JobState::Pending)
    }

    pub fn tasked_ids(&self) -> Vec<JobId> {
        self.ids_in(JobState::Tasked)
    }

    fn ids_in(&self, state: JobState) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.state == state)
            .map(|j| j.id)
            .collect()
    }

    pub fn commands_for_job(&self, id: JobId) -> Vec<CommandId> {
        self.commands_by_job.get(&id).cloned().unwrap_or_default()
    }

    /// Pending jobs that wait for `id`.
    pub fn dependents(&self, id: JobId) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Pending && j.wait_for.contains(&id))
            .map(|j| j.id)
            .collect()
    }

    /// Predecessors evicted by a flush are read back from the store.
    pub fn wait_status(&self, job: &Job, store: &dyn Store) -> WaitStatus {
        for &w in &job.wait_for {
            let done = match self.jobs.get(&w) {
                Some(prior) => (prior.is_complete(), prior.succeeded()),
                None => match store.get_job(w) {
                    Some(prior) => (prior.is_complete(), prior.succeeded()),
                    None => (true, false),
                },
            };
            match done {
                (false, _) => return WaitStatus::Blocked,
                (true, false) => return WaitStatus::Failed(w),
                (true, true) => {}
            }
        }
        WaitStatus::Ready
    }

    /// Recompute the flags of every command owning `job_id`. Returns the
    /// commands that changed.
    pub fn update_commands(&mut self, job_id: JobId, store: &dyn Store) -> Vec<Command> {
        let mut changed = Vec::new();
        for command_id in self.commands_for_job(job_id) {
            let Some(mut command) = self.commands.get(&command_id).cloned() else {
                continue;
            };
            let jobs: Vec<Job> = command
                .jobs
                .iter()
                .filter_map(|id| self.jobs.get(id).cloned().or_else(|| store.get_job(*id)))
                .collect();
            if command.update_from_jobs(&jobs) {
                self.commands.insert(command_id, command.clone());
                changed.push(command);
            }
        }
        changed
    }

    /// Nothing pending or tasked.
    pub fn is_quiescent(&self) -> bool {
        self.jobs.values().all(Job::is_complete)
    }

    /// Evict completed jobs and commands. Only done when quiescent, so no
    /// remaining job can still be waiting on an evicted one.
    pub fn flush(&mut self) -> usize {
        if !self.is_quiescent() {
            return 0;
        }
        let evicted = self.jobs.len();
        self.jobs.clear();
        self.commands.retain(|_, c| !c.complete);
        self.commands_by_job.clear();
        debug!(evicted, "flushed job collection");
        evicted
    }
}
