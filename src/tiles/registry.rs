//! Keyed map of in-flight load tasks
//!
//! At most one task exists per key. All membership changes for a key happen
//! under that key's shard lock, which is what keeps coalescing, dropping and
//! draining from racing each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fxhash::FxBuildHasher;
use std::hash::Hash;
use std::sync::Arc;

use crate::Result;

/// Outcome of [`TaskRegistry::attach_or_insert`]
pub(crate) enum Registration<V> {
    /// Joined a task that was already in flight
    Joined(Arc<V>),
    /// Created, submitted and registered a new task
    Created(Arc<V>),
}

impl<V> Registration<V> {
    pub(crate) fn task(&self) -> &Arc<V> {
        match self {
            Self::Joined(task) | Self::Created(task) => task,
        }
    }

    pub(crate) fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

pub(crate) struct TaskRegistry<K, V> {
    tasks: DashMap<K, Arc<V>, FxBuildHasher>,
}

impl<K, V> TaskRegistry<K, V>
where
    K: Eq + Hash + Copy,
{
    pub(crate) fn new() -> Self {
        Self {
            tasks: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
        self.tasks.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Join the task registered for `key`, or create one
    ///
    /// `attach` returns `false` when the existing task can no longer take
    /// callbacks, in which case it is replaced. `create` must leave the task
    /// fully set up; it is only published once `create` succeeds.
    pub(crate) fn attach_or_insert<A, C>(
        &self,
        key: K,
        attach: A,
        create: C,
    ) -> Result<Registration<V>>
    where
        A: FnOnce(&V) -> bool,
        C: FnOnce() -> Result<Arc<V>>,
    {
        match self.tasks.entry(key) {
            Entry::Occupied(mut entry) => {
                if attach(entry.get()) {
                    return Ok(Registration::Joined(Arc::clone(entry.get())));
                }
                let task = create()?;
                entry.insert(Arc::clone(&task));
                Ok(Registration::Created(task))
            }
            Entry::Vacant(entry) => {
                let task = create()?;
                entry.insert(Arc::clone(&task));
                Ok(Registration::Created(task))
            }
        }
    }

    pub(crate) fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.tasks.remove(key).map(|(_, task)| task)
    }

    /// Remove the task for `key` if `predicate` holds, evaluated under the
    /// shard lock
    pub(crate) fn remove_if<P>(&self, key: &K, predicate: P) -> Option<Arc<V>>
    where
        P: FnOnce(&V) -> bool,
    {
        self.tasks
            .remove_if(key, |_, task| predicate(task))
            .map(|(_, task)| task)
    }

    /// Keys whose task satisfies `predicate`, snapshotted without holding any
    /// lock afterwards
    pub(crate) fn keys_where<P>(&self, predicate: P) -> Vec<K>
    where
        P: Fn(&V) -> bool,
    {
        self.tasks
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect()
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchedulerError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Slot {
        joins: AtomicUsize,
        sealed: AtomicBool,
    }

    fn join(slot: &Slot) -> bool {
        if slot.sealed.load(Ordering::SeqCst) {
            return false;
        }
        slot.joins.fetch_add(1, Ordering::SeqCst);
        true
    }

    #[test]
    fn test_second_request_joins() {
        let registry: TaskRegistry<u32, Slot> = TaskRegistry::new();

        let first = registry
            .attach_or_insert(1, join, || Ok(Arc::new(Slot::default())))
            .unwrap();
        let second = registry
            .attach_or_insert(1, join, || panic!("must not create twice"))
            .unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert!(Arc::ptr_eq(first.task(), second.task()));
        assert_eq!(second.task().joins.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sealed_task_is_replaced() {
        let registry: TaskRegistry<u32, Slot> = TaskRegistry::new();
        let first = registry
            .attach_or_insert(1, join, || Ok(Arc::new(Slot::default())))
            .unwrap();
        first.task().sealed.store(true, Ordering::SeqCst);

        let second = registry
            .attach_or_insert(1, join, || Ok(Arc::new(Slot::default())))
            .unwrap();
        assert!(second.is_new());
        assert!(!Arc::ptr_eq(first.task(), second.task()));
    }

    #[test]
    fn test_failed_create_leaves_no_entry() {
        let registry: TaskRegistry<u32, Slot> = TaskRegistry::new();
        let result = registry.attach_or_insert(1, join, || Err(SchedulerError::PoolShutdown));

        assert!(result.is_err());
        assert!(!registry.contains(&1));
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let registry: TaskRegistry<u32, Slot> = TaskRegistry::new();
        registry
            .attach_or_insert(7, join, || Ok(Arc::new(Slot::default())))
            .unwrap();

        assert!(registry.remove_if(&7, |slot| slot.sealed.load(Ordering::SeqCst)).is_none());
        assert_eq!(registry.keys_where(|_| true), vec![7]);
        assert!(registry.get(&7).is_some());
        assert!(registry.remove_if(&7, |_| true).is_some());
        assert!(registry.remove(&7).is_none());
    }
}
