//! Bounded LRU of recent task snapshots.
//!
//! 読み書きのたびに「最近使った」印を更新し、容量を超えたら
//! 最も古いものから捨てます。捨てられた task も store には残ります。

use std::collections::{BTreeMap, HashMap};

use crate::domain::{Task, TaskId};

struct Entry {
    task: Task,
    stamp: u64,
}

pub struct TaskCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<TaskId, Entry>,
    /// stamp -> id, oldest first
    recency: BTreeMap<u64, TaskId>,
}

impl TaskCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, id: TaskId) -> Option<&mut Entry> {
        let stamp = self.next_stamp();
        let entry = self.entries.get_mut(&id)?;
        self.recency.remove(&entry.stamp);
        entry.stamp = stamp;
        self.recency.insert(stamp, id);
        Some(entry)
    }

    /// Lookup that counts as a use.
    pub fn get(&mut self, id: TaskId) -> Option<&Task> {
        self.touch(id).map(|entry| &entry.task)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.touch(id).map(|entry| &mut entry.task)
    }

    /// Lookup without refreshing recency.
    pub fn peek(&self, id: TaskId) -> Option<&Task> {
        self.entries.get(&id).map(|entry| &entry.task)
    }

    /// Insert or replace. Returns the evicted task, if any.
    pub fn insert(&mut self, task: Task) -> Option<Task> {
        let stamp = self.next_stamp();
        let id = task.id;
        if let Some(old) = self.entries.insert(id, Entry { task, stamp }) {
            self.recency.remove(&old.stamp);
        }
        self.recency.insert(stamp, id);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let (_, oldest) = self.recency.pop_first()?;
        self.entries.remove(&oldest).map(|entry| entry.task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn task() -> Task {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Task::new(TaskId::from_ulid(Ulid::new()), None, now)
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = TaskCache::new(2);
        let (a, b, c) = (task(), task(), task());
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);

        assert!(cache.insert(a).is_none());
        assert!(cache.insert(b).is_none());
        cache.get(a_id);

        let evicted = cache.insert(c).unwrap();
        assert_eq!(evicted.id, b_id);
        assert!(cache.peek(a_id).is_some());
        assert!(cache.peek(c_id).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn peek_does_not_refresh() {
        let mut cache = TaskCache::new(2);
        let (a, b, c) = (task(), task(), task());
        let a_id = a.id;

        cache.insert(a);
        cache.insert(b);
        cache.peek(a_id);

        assert_eq!(cache.insert(c).map(|t| t.id), Some(a_id));
    }

    #[test]
    fn replacing_an_entry_does_not_grow() {
        let mut cache = TaskCache::new(1);
        let mut a = task();
        cache.insert(a.clone());

        a.progress = Some("50%".into());
        assert!(cache.insert(a.clone()).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(a.id).unwrap().progress.as_deref(), Some("50%"));
    }
}
