//! In-memory index of the locks held by outstanding (pending or tasked)
//! jobs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{JobId, ObjectKey};

/// A lock a job wants, before the planner has assigned it to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRequest {
    Read(ObjectKey),
    Write {
        item: ObjectKey,
        begin_state: Option<String>,
        end_state: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLock {
    pub uuid: Uuid,
    pub job_id: JobId,
    pub locked_item: ObjectKey,
    pub write: bool,
    #[serde(default)]
    pub begin_state: Option<String>,
    #[serde(default)]
    pub end_state: Option<String>,
}

impl StateLock {
    pub fn read(job_id: JobId, locked_item: ObjectKey) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            job_id,
            locked_item,
            write: false,
            begin_state: None,
            end_state: None,
        }
    }

    pub fn write(
        job_id: JobId,
        locked_item: ObjectKey,
        begin_state: Option<String>,
        end_state: Option<String>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            job_id,
            locked_item,
            write: true,
            begin_state,
            end_state,
        }
    }

    pub fn from_request(job_id: JobId, request: LockRequest) -> Self {
        match request {
            LockRequest::Read(item) => Self::read(job_id, item),
            LockRequest::Write {
                item,
                begin_state,
                end_state,
            } => Self::write(job_id, item, begin_state, end_state),
        }
    }

    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "uuid": self.uuid,
            "job_id": self.job_id,
            "locked_item": self.locked_item,
            "write": self.write,
            "begin_state": self.begin_state,
            "end_state": self.end_state,
        })
    }

    pub fn from_dict(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LockCache {
    write_by_item: HashMap<ObjectKey, Vec<StateLock>>,
    read_by_item: HashMap<ObjectKey, Vec<StateLock>>,
    by_job: HashMap<JobId, Vec<StateLock>>,
}

impl LockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks must be added in job id order.
    pub fn add(&mut self, lock: StateLock) {
        let index = if lock.write {
            &mut self.write_by_item
        } else {
            &mut self.read_by_item
        };
        index
            .entry(lock.locked_item.clone())
            .or_default()
            .push(lock.clone());
        self.by_job.entry(lock.job_id).or_default().push(lock);
    }

    /// Release every lock owned by `job_id`.
    pub fn remove_job(&mut self, job_id: JobId) {
        let Some(locks) = self.by_job.remove(&job_id) else {
            return;
        };
        for lock in locks {
            let index = if lock.write {
                &mut self.write_by_item
            } else {
                &mut self.read_by_item
            };
            if let Some(item_locks) = index.get_mut(&lock.locked_item) {
                item_locks.retain(|l| l.job_id != job_id);
                if item_locks.is_empty() {
                    index.remove(&lock.locked_item);
                }
            }
        }
    }

    /// Most recently queued write lock on `item`, optionally ignoring the
    /// locks of one job.
    pub fn get_latest_write(&self, item: &ObjectKey, not_job: Option<JobId>) -> Option<&StateLock> {
        self.write_by_item
            .get(item)?
            .iter()
            .rev()
            .find(|l| Some(l.job_id) != not_job)
    }

    /// Read locks on `item` queued at or after the job `after`.
    pub fn get_read_locks(&self, item: &ObjectKey, after: JobId, not_job: Option<JobId>) -> Vec<&StateLock> {
        self.read_by_item
            .get(item)
            .map(|locks| {
                locks
                    .iter()
                    .filter(|l| l.job_id >= after && Some(l.job_id) != not_job)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The latest write lock per item: the eventual state of everything
    /// with queued writers.
    pub fn get_write_by_locked_item(&self) -> HashMap<&ObjectKey, &StateLock> {
        self.write_by_item
            .iter()
            .filter_map(|(item, locks)| locks.last().map(|l| (item, l)))
            .collect()
    }

    /// State `item` will be in once every queued writer has run, if any
    /// writer declares one.
    pub fn expected_state(&self, item: &ObjectKey) -> Option<&str> {
        self.get_latest_write(item, None)?.end_state.as_deref()
    }

    pub fn get_by_locked_item(&self, item: &ObjectKey) -> Vec<&StateLock> {
        let mut locks: Vec<&StateLock> = self
            .read_by_item
            .get(item)
            .into_iter()
            .chain(self.write_by_item.get(item))
            .flatten()
            .collect();
        locks.sort_by_key(|l| l.job_id);
        locks
    }

    pub fn get_by_job(&self, job_id: JobId) -> &[StateLock] {
        self.by_job.get(&job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn read_locks(&self) -> impl Iterator<Item = &StateLock> {
        self.read_by_item.values().flatten()
    }

    pub fn write_locks(&self) -> impl Iterator<Item = &StateLock> {
        self.write_by_item.values().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.by_job.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: u64) -> ObjectKey {
        ObjectKey::new("host", id)
    }

    #[test]
    fn dict_roundtrip() {
        let lock = StateLock::write(3, host(1), Some("lnet_down".into()), Some("lnet_up".into()));
        assert_eq!(StateLock::from_dict(lock.to_dict()).unwrap(), lock);
        let lock = StateLock::read(4, host(2));
        assert_eq!(StateLock::from_dict(lock.to_dict()).unwrap(), lock);
    }

    #[test]
    fn latest_write_and_expected_state() {
        let mut cache = LockCache::new();
        cache.add(StateLock::write(1, host(1), Some("a".into()), Some("b".into())));
        cache.add(StateLock::write(2, host(1), Some("b".into()), Some("c".into())));
        assert_eq!(cache.get_latest_write(&host(1), None).unwrap().job_id, 2);
        assert_eq!(cache.get_latest_write(&host(1), Some(2)).unwrap().job_id, 1);
        assert_eq!(cache.expected_state(&host(1)), Some("c"));
        assert_eq!(cache.expected_state(&host(2)), None);
        assert_eq!(cache.get_write_by_locked_item().len(), 1);
    }

    #[test]
    fn read_locks_after_barrier() {
        let mut cache = LockCache::new();
        cache.add(StateLock::read(1, host(1)));
        cache.add(StateLock::write(2, host(1), None, None));
        cache.add(StateLock::read(3, host(1)));
        cache.add(StateLock::read(4, host(1)));
        let ids: Vec<JobId> = cache
            .get_read_locks(&host(1), 2, Some(4))
            .iter()
            .map(|l| l.job_id)
            .collect();
        assert_eq!(ids, vec![3]);
        assert_eq!(cache.get_read_locks(&host(1), 0, None).len(), 3);
        assert_eq!(cache.get_by_locked_item(&host(1)).len(), 4);
    }

    #[test]
    fn remove_job_releases_everything() {
        let mut cache = LockCache::new();
        cache.add(StateLock::read(1, host(2)));
        cache.add(StateLock::write(1, host(1), Some("a".into()), Some("b".into())));
        cache.add(StateLock::read(2, host(1)));
        assert_eq!(cache.get_by_job(1).len(), 2);

        cache.remove_job(1);
        assert!(cache.get_by_job(1).is_empty());
        assert!(cache.get_latest_write(&host(1), None).is_none());
        assert!(cache.get_read_locks(&host(2), 0, None).is_empty());
        assert_eq!(cache.get_read_locks(&host(1), 0, None).len(), 1);

        cache.remove_job(2);
        assert!(cache.is_empty());
    }

    #[test]
    fn clone_is_independent() {
        let mut cache = LockCache::new();
        cache.add(StateLock::read(1, host(1)));
        let mut staged = cache.clone();
        staged.add(StateLock::read(2, host(1)));
        assert_eq!(cache.get_read_locks(&host(1), 0, None).len(), 1);
        assert_eq!(staged.get_read_locks(&host(1), 0, None).len(), 2);
    }
}
