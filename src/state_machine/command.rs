use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Job, JobId};

pub type CommandId = u64;

/// Derived alert of a command: Running → Successful | Cancelled | Errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Running,
    Successful,
    Cancelled,
    Errored,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Running => write!(f, "running"),
            CommandStatus::Successful => write!(f, "successful"),
            CommandStatus::Cancelled => write!(f, "cancelled"),
            CommandStatus::Errored => write!(f, "errored"),
        }
    }
}

/// User-facing aggregate of the jobs scheduled from one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub errored: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub dismissed: bool,
    /// Jobs may be shared with other commands (same-state requests attach
    /// an existing writer).
    #[serde(default)]
    pub jobs: Vec<JobId>,
}

impl Command {
    pub fn new(id: CommandId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            created_at: Utc::now(),
            complete: false,
            errored: false,
            cancelled: false,
            dismissed: false,
            jobs: Vec::new(),
        }
    }

    pub fn add_job(&mut self, job: JobId) {
        if !self.jobs.contains(&job) {
            self.jobs.push(job);
        }
    }

    pub fn mark_complete(&mut self, errored: bool, cancelled: bool) {
        self.complete = true;
        self.errored = errored;
        self.cancelled = cancelled;
    }

    /// Recompute the completion flags from the current rows of the
    /// command's jobs. Returns true if anything changed.
    pub fn update_from_jobs<'a>(&mut self, jobs: impl IntoIterator<Item = &'a Job>) -> bool {
        let mut all_complete = true;
        let mut errored = false;
        let mut cancelled = false;
        for job in jobs {
            all_complete &= job.is_complete();
            errored |= job.errored;
            cancelled |= job.cancelled;
        }
        let before = (self.complete, self.errored, self.cancelled);
        self.errored = errored;
        self.cancelled = cancelled;
        self.complete = all_complete;
        before != (self.complete, self.errored, self.cancelled)
    }

    pub fn status(&self) -> CommandStatus {
        if !self.complete {
            CommandStatus::Running
        } else if self.errored {
            CommandStatus::Errored
        } else if self.cancelled {
            CommandStatus::Cancelled
        } else {
            CommandStatus::Successful
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{JobArgs, JobSpec, JobState};

    fn job(id: JobId, state: JobState, errored: bool, cancelled: bool) -> Job {
        let mut job = Job::new(id, JobSpec::new("J", JobArgs::new()));
        job.state = state;
        job.errored = errored;
        job.cancelled = cancelled;
        job
    }

    #[test]
    fn empty_command_completes_successfully() {
        let mut cmd = Command::new(1, "noop");
        cmd.mark_complete(false, false);
        assert_eq!(cmd.status(), CommandStatus::Successful);
    }

    #[test]
    fn status_derived_from_jobs() {
        let mut cmd = Command::new(1, "go");
        let jobs = vec![
            job(1, JobState::Complete, false, false),
            job(2, JobState::Tasked, false, false),
        ];
        cmd.update_from_jobs(&jobs);
        assert_eq!(cmd.status(), CommandStatus::Running);

        let jobs = vec![
            job(1, JobState::Complete, false, false),
            job(2, JobState::Complete, false, true),
        ];
        assert!(cmd.update_from_jobs(&jobs));
        assert_eq!(cmd.status(), CommandStatus::Cancelled);

        let jobs = vec![
            job(1, JobState::Complete, true, false),
            job(2, JobState::Complete, false, true),
        ];
        cmd.update_from_jobs(&jobs);
        assert_eq!(cmd.status(), CommandStatus::Errored);
        assert!(!cmd.update_from_jobs(&jobs));
    }

    #[test]
    fn add_job_is_idempotent() {
        let mut cmd = Command::new(1, "go");
        cmd.add_job(4);
        cmd.add_job(4);
        assert_eq!(cmd.jobs, vec![4]);
    }
}
