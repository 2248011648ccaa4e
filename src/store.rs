//! Persistence seam for stateful objects, commands, jobs and step results.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::state_machine::{Command, CommandId, Job, JobId, ObjectKey, StatefulObject, StepResult};

/// Row storage used by the planner and the scheduler. Calls are short and
/// synchronous; writes from the scheduler happen under its mutex.
pub trait Store: Send + Sync {
    fn get_object(&self, key: &ObjectKey) -> Option<StatefulObject>;
    fn objects_of_kind(&self, kind: &str) -> Vec<StatefulObject>;
    fn all_objects(&self) -> Vec<StatefulObject>;
    fn insert_object(&self, object: StatefulObject) -> Result<(), StoreError>;
    /// Fails with `IntegrityConflict` if the row no longer exists.
    fn update_object(&self, object: StatefulObject) -> Result<(), StoreError>;
    fn remove_object(&self, key: &ObjectKey) -> Result<StatefulObject, StoreError>;

    fn next_job_id(&self) -> JobId;
    fn next_command_id(&self) -> CommandId;
    fn next_step_result_id(&self) -> u64;

    fn save_command(&self, command: &Command) -> Result<(), StoreError>;
    fn get_command(&self, id: CommandId) -> Option<Command>;
    fn commands(&self) -> Vec<Command>;

    fn save_job(&self, job: &Job) -> Result<(), StoreError>;
    fn get_job(&self, id: JobId) -> Option<Job>;
    fn jobs(&self) -> Vec<Job>;

    fn save_step_result(&self, result: &StepResult) -> Result<(), StoreError>;
    fn step_results_for_job(&self, job_id: JobId) -> Vec<StepResult>;
}

#[derive(Debug, Default)]
struct Tables {
    objects: BTreeMap<ObjectKey, StatefulObject>,
    commands: BTreeMap<CommandId, Command>,
    jobs: BTreeMap<JobId, Job>,
    step_results: BTreeMap<u64, StepResult>,
    last_job_id: JobId,
    last_command_id: CommandId,
    last_step_result_id: u64,
}

/// On-disk form of a [`MemoryStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    objects: Vec<StatefulObject>,
    #[serde(default)]
    commands: Vec<Command>,
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(default)]
    step_results: Vec<StepResult>,
    #[serde(default)]
    last_job_id: JobId,
    #[serde(default)]
    last_command_id: CommandId,
    #[serde(default)]
    last_step_result_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`MemoryStore::snapshot`]. A missing file
    /// yields an empty store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            debug!(path = %path.display(), "no store snapshot, starting empty");
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let snap: Snapshot = serde_json::from_str(&content)?;
        info!(
            path = %path.display(),
            objects = snap.objects.len(),
            jobs = snap.jobs.len(),
            "loaded store snapshot"
        );
        let tables = Tables {
            objects: snap.objects.into_iter().map(|o| (o.key.clone(), o)).collect(),
            commands: snap.commands.into_iter().map(|c| (c.id, c)).collect(),
            jobs: snap.jobs.into_iter().map(|j| (j.id, j)).collect(),
            step_results: snap.step_results.into_iter().map(|r| (r.id, r)).collect(),
            last_job_id: snap.last_job_id,
            last_command_id: snap.last_command_id,
            last_step_result_id: snap.last_step_result_id,
        };
        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    pub fn snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let snap = {
            let t = self.read();
            Snapshot {
                objects: t.objects.values().cloned().collect(),
                commands: t.commands.values().cloned().collect(),
                jobs: t.jobs.values().cloned().collect(),
                step_results: t.step_results.values().cloned().collect(),
                last_job_id: t.last_job_id,
                last_command_id: t.last_command_id,
                last_step_result_id: t.last_step_result_id,
            }
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&snap)?)?;
        debug!(path = %path.display(), "wrote store snapshot");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn get_object(&self, key: &ObjectKey) -> Option<StatefulObject> {
        self.read().objects.get(key).cloned()
    }

    fn objects_of_kind(&self, kind: &str) -> Vec<StatefulObject> {
        self.read()
            .objects
            .values()
            .filter(|o| o.key.kind == kind)
            .cloned()
            .collect()
    }

    fn all_objects(&self) -> Vec<StatefulObject> {
        self.read().objects.values().cloned().collect()
    }

    fn insert_object(&self, object: StatefulObject) -> Result<(), StoreError> {
        let mut t = self.write();
        if t.objects.contains_key(&object.key) {
            return Err(StoreError::IntegrityConflict(object.key));
        }
        t.objects.insert(object.key.clone(), object);
        Ok(())
    }

    fn update_object(&self, object: StatefulObject) -> Result<(), StoreError> {
        let mut t = self.write();
        match t.objects.get_mut(&object.key) {
            Some(row) => {
                *row = object;
                Ok(())
            }
            None => Err(StoreError::IntegrityConflict(object.key)),
        }
    }

    fn remove_object(&self, key: &ObjectKey) -> Result<StatefulObject, StoreError> {
        self.write()
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn next_job_id(&self) -> JobId {
        let mut t = self.write();
        t.last_job_id += 1;
        t.last_job_id
    }

    fn next_command_id(&self) -> CommandId {
        let mut t = self.write();
        t.last_command_id += 1;
        t.last_command_id
    }

    fn next_step_result_id(&self) -> u64 {
        let mut t = self.write();
        t.last_step_result_id += 1;
        t.last_step_result_id
    }

    fn save_command(&self, command: &Command) -> Result<(), StoreError> {
        self.write().commands.insert(command.id, command.clone());
        Ok(())
    }

    fn get_command(&self, id: CommandId) -> Option<Command> {
        self.read().commands.get(&id).cloned()
    }

    fn commands(&self) -> Vec<Command> {
        self.read().commands.values().cloned().collect()
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.write().jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn get_job(&self, id: JobId) -> Option<Job> {
        self.read().jobs.get(&id).cloned()
    }

    fn jobs(&self) -> Vec<Job> {
        self.read().jobs.values().cloned().collect()
    }

    fn save_step_result(&self, result: &StepResult) -> Result<(), StoreError> {
        self.write().step_results.insert(result.id, result.clone());
        Ok(())
    }

    fn step_results_for_job(&self, job_id: JobId) -> Vec<StepResult> {
        self.read()
            .step_results
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{JobArgs, JobSpec};
    use tempfile::TempDir;

    #[test]
    fn ids_are_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.next_job_id(), 1);
        assert_eq!(store.next_job_id(), 2);
        assert_eq!(store.next_command_id(), 1);
        assert_eq!(store.next_step_result_id(), 1);
    }

    #[test]
    fn update_of_removed_object_conflicts() {
        let store = MemoryStore::new();
        let obj = StatefulObject::new(ObjectKey::new("host", 1), "lnet_up");
        store.insert_object(obj.clone()).unwrap();
        assert!(matches!(
            store.insert_object(obj.clone()),
            Err(StoreError::IntegrityConflict(_))
        ));
        store.remove_object(&obj.key).unwrap();
        assert!(matches!(
            store.update_object(obj.clone()),
            Err(StoreError::IntegrityConflict(_))
        ));
        assert!(matches!(
            store.remove_object(&obj.key),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn objects_of_kind_filters() {
        let store = MemoryStore::new();
        store
            .insert_object(StatefulObject::new(ObjectKey::new("host", 1), "lnet_up"))
            .unwrap();
        store
            .insert_object(StatefulObject::new(ObjectKey::new("target", 1), "mounted"))
            .unwrap();
        assert_eq!(store.objects_of_kind("host").len(), 1);
        assert_eq!(store.all_objects().len(), 2);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("store.json");

        let store = MemoryStore::new();
        store
            .insert_object(StatefulObject::new(ObjectKey::new("host", 1), "lnet_up"))
            .unwrap();
        let job = Job::new(store.next_job_id(), JobSpec::new("Noop", JobArgs::new()));
        store.save_job(&job).unwrap();
        let mut cmd = Command::new(store.next_command_id(), "go");
        cmd.add_job(job.id);
        store.save_command(&cmd).unwrap();
        store.snapshot(&path).unwrap();

        let loaded = MemoryStore::open(&path).unwrap();
        assert_eq!(loaded.get_job(job.id), Some(job));
        assert_eq!(loaded.get_command(cmd.id), Some(cmd));
        assert!(loaded.get_object(&ObjectKey::new("host", 1)).is_some());
        assert_eq!(loaded.next_job_id(), 2);
    }

    #[test]
    fn open_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(&dir.path().join("absent.json")).unwrap();
        assert!(store.jobs().is_empty());
    }
}
