//! Load tasks: one in-flight load of one tile
//!
//! A task goes through two steps. The off-thread `run` reads the tile from
//! storage and flags the task finished. The on-thread completion step stamps
//! the tile and hands it to every registered callback. Each step happens once,
//! and completion never starts before `run` has finished.

use crate::background::pool::{Compensator, Job};
use crate::core::keys::{ColumnKey, CubeKey};
use crate::tiles::stats::SchedulerStats;
use crate::traits::{TileDomain, TilePayload, TileStorage};
use crate::{Result, SchedulerError};
use once_cell::sync::OnceCell;
use std::fmt::Display;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Completion callback. Receives the loaded tile, or `None` if it does not
/// exist or could not be read. Callbacks are compared by identity, so keep
/// the `Arc` around if you may want to drop the request later.
pub type LoadCallback<T> = Arc<dyn Fn(Option<Arc<T>>) + Send + Sync>;

/// Wrap a closure as a load callback for either tile kind
pub fn load_callback<T, F>(f: F) -> LoadCallback<T>
where
    F: Fn(Option<Arc<T>>) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_callback<T>(a: &LoadCallback<T>, b: &LoadCallback<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct Completion<T> {
    /// Raw tile as read by `run`, taken by the completion step
    payload: Option<T>,
    /// Tile that was already resident, handed out as is
    resident: Option<Arc<T>>,
    finished: bool,
    completed: bool,
    callbacks: Vec<LoadCallback<T>>,
    result: Option<Arc<T>>,
}

/// State shared by both task flavors
pub(crate) struct TaskCore<K, T> {
    key: K,
    domain: Arc<dyn TileDomain>,
    stats: Arc<SchedulerStats>,
    claimed: AtomicBool,
    state: Mutex<Completion<T>>,
    signal: Condvar,
}

impl<K, T> TaskCore<K, T>
where
    K: Copy + Display,
    T: TilePayload,
{
    fn new(key: K, domain: Arc<dyn TileDomain>, stats: Arc<SchedulerStats>) -> Self {
        Self {
            key,
            domain,
            stats,
            claimed: AtomicBool::new(false),
            state: Mutex::new(Completion {
                payload: None,
                resident: None,
                finished: false,
                completed: false,
                callbacks: Vec::new(),
                result: None,
            }),
            signal: Condvar::new(),
        }
    }

    pub(crate) fn key(&self) -> K {
        self.key
    }

    // Flags and callbacks stay consistent across a panic, so a poisoned lock
    // is still safe to use everywhere except in `wait_finished`.
    fn lock(&self) -> MutexGuard<'_, Completion<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Run a storage read, turning errors and panics into an absent tile
    fn read(&self, kind: &str, load: impl FnOnce() -> io::Result<Option<T>>) -> Option<T> {
        self.stats.record_load();
        match panic::catch_unwind(AssertUnwindSafe(load)) {
            Ok(Ok(tile)) => tile,
            Ok(Err(e)) => {
                self.stats.record_failure();
                log::error!("Could not load {} in {}: {}", kind, self.key, e);
                None
            }
            Err(_) => {
                self.stats.record_failure();
                log::error!("Storage panicked while loading {} in {}", kind, self.key);
                None
            }
        }
    }

    /// Store the result and wake every waiter. Last thing `run` does.
    fn finish(&self, payload: Option<T>) {
        let mut state = self.lock();
        state.payload = payload;
        state.finished = true;
        self.signal.notify_all();
    }

    /// Finish without a read, with a tile that is already resident. The
    /// completion step skips stamping for it.
    fn finish_resident(&self, tile: Arc<T>) {
        let mut state = self.lock();
        state.resident = Some(tile);
        state.finished = true;
        self.signal.notify_all();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Block until `run` has finished on whichever thread is executing it
    pub(crate) fn wait_finished(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| {
            SchedulerError::WaitInterrupted(format!("task lock poisoned for {}", self.key))
        })?;
        while !state.finished {
            state = self.signal.wait(state).map_err(|_| {
                SchedulerError::WaitInterrupted(format!("wait broken for {}", self.key))
            })?;
        }
        Ok(())
    }

    /// Register a callback. Returns `false` if the task has already completed
    /// and the callback would never fire.
    pub(crate) fn add_callback(&self, callback: LoadCallback<T>) -> bool {
        let mut state = self.lock();
        if state.completed {
            return false;
        }
        state.callbacks.push(callback);
        true
    }

    /// Remove the first registration of `callback`
    pub(crate) fn remove_callback(&self, callback: &LoadCallback<T>) -> bool {
        let mut state = self.lock();
        match state.callbacks.iter().position(|c| same_callback(c, callback)) {
            Some(index) => {
                state.callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_callbacks(&self) -> bool {
        !self.lock().callbacks.is_empty()
    }

    /// Stamp the tile and fire callbacks in registration order
    ///
    /// Waits for `run` if it has not finished yet. Calling this again after
    /// the first time only returns the result.
    pub(crate) fn run_synchronous_part(&self) -> Result<Option<Arc<T>>> {
        self.wait_finished()?;

        let (payload, resident, callbacks) = {
            let mut state = self.lock();
            if state.completed {
                return Ok(state.result.clone());
            }
            state.completed = true;
            (
                state.payload.take(),
                state.resident.take(),
                std::mem::take(&mut state.callbacks),
            )
        };

        let result = resident.or_else(|| {
            payload.map(|mut tile| {
                tile.stamp_loaded(self.domain.world_time());
                Arc::new(tile)
            })
        });
        self.lock().result = result.clone();
        self.stats.record_completion();

        for callback in callbacks {
            callback(result.clone());
        }
        Ok(result)
    }
}

/// Loads a column
pub(crate) struct ColumnTask<S: TileStorage> {
    core: TaskCore<ColumnKey, S::Column>,
    storage: Arc<S>,
}

impl<S: TileStorage> ColumnTask<S> {
    pub(crate) fn new(
        key: ColumnKey,
        domain: Arc<dyn TileDomain>,
        storage: Arc<S>,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            core: TaskCore::new(key, domain, stats),
            storage,
        }
    }

    pub(crate) fn core(&self) -> &TaskCore<ColumnKey, S::Column> {
        &self.core
    }

    /// Serve the load from a column that is already resident. The task is
    /// claimed so no worker ever reads it.
    pub(crate) fn complete_with_resident(&self, column: Arc<S::Column>) {
        if self.core.try_claim() {
            self.core.finish_resident(column);
        }
    }
}

impl<S: TileStorage> Job for ColumnTask<S> {
    fn try_claim(&self) -> bool {
        self.core.try_claim()
    }

    fn run(&self) {
        let key = self.core.key;
        let column = self.core.read("column", || self.storage.load_column(key));
        self.core.finish(column);
    }
}

/// Loads a cube once its parent column is known
pub(crate) struct CubeTask<S: TileStorage> {
    core: TaskCore<CubeKey, S::Cube>,
    storage: Arc<S>,
    parent: OnceCell<Option<Arc<S::Column>>>,
    compensator: Compensator,
}

impl<S: TileStorage> CubeTask<S> {
    pub(crate) fn new(
        key: CubeKey,
        domain: Arc<dyn TileDomain>,
        storage: Arc<S>,
        stats: Arc<SchedulerStats>,
        compensator: Compensator,
    ) -> Self {
        Self {
            core: TaskCore::new(key, domain, stats),
            storage,
            parent: OnceCell::new(),
            compensator,
        }
    }

    pub(crate) fn core(&self) -> &TaskCore<CubeKey, S::Cube> {
        &self.core
    }

    /// Supply the parent column. Only the first value is kept; returns
    /// whether this call was the one that set it.
    pub(crate) fn set_parent(&self, column: Option<Arc<S::Column>>) -> bool {
        if self.parent.set(column).is_err() {
            log::debug!("parent column for {} already set", self.core.key);
            return false;
        }
        // Notify under the lock so a run about to wait cannot miss it
        let _state = self.core.lock();
        self.core.signal.notify_all();
        true
    }

    /// Finish with an absent cube when the load can no longer be scheduled
    pub(crate) fn abandon(&self) {
        if self.core.try_claim() {
            self.core.finish(None);
        }
    }

    fn await_parent(&self) -> Option<Arc<S::Column>> {
        if let Some(column) = self.parent.get() {
            return column.clone();
        }

        log::debug!("cube {} waiting for its column", self.core.key);
        let _blocking = self.compensator.before_block();

        let mut state = self.core.lock();
        while self.parent.get().is_none() {
            state = self
                .core
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);
        self.parent.get().cloned().flatten()
    }
}

impl<S: TileStorage> Job for CubeTask<S> {
    fn try_claim(&self) -> bool {
        self.core.try_claim()
    }

    fn run(&self) {
        let key = self.core.key;
        let cube = match self.await_parent() {
            Some(column) => self
                .core
                .read("cube", || self.storage.load_cube(&column, key)),
            None => {
                log::debug!("column for {} is absent, skipping cube load", key);
                None
            }
        };
        self.core.finish(cube);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::DomainId;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct World;

    impl TileDomain for World {
        fn id(&self) -> DomainId {
            DomainId(1)
        }

        fn world_time(&self) -> u64 {
            42
        }
    }

    #[derive(Debug, PartialEq)]
    struct Tile {
        value: i32,
        saved_at: u64,
    }

    impl TilePayload for Tile {
        fn stamp_loaded(&mut self, world_time: u64) {
            self.saved_at = world_time;
        }
    }

    struct Store {
        reads: AtomicUsize,
        fail: bool,
    }

    impl TileStorage for Store {
        type Column = Tile;
        type Cube = Tile;

        fn load_column(&self, key: ColumnKey) -> io::Result<Option<Tile>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
            }
            Ok(Some(Tile {
                value: key.x + key.z,
                saved_at: 0,
            }))
        }

        fn load_cube(&self, column: &Tile, key: CubeKey) -> io::Result<Option<Tile>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Tile {
                value: column.value * 100 + key.y,
                saved_at: 0,
            }))
        }
    }

    fn store(fail: bool) -> Arc<Store> {
        Arc::new(Store {
            reads: AtomicUsize::new(0),
            fail,
        })
    }

    fn column_task(storage: Arc<Store>) -> ColumnTask<Store> {
        ColumnTask::new(
            ColumnKey::new(DomainId(1), 3, 4),
            Arc::new(World),
            storage,
            Arc::new(SchedulerStats::default()),
        )
    }

    fn cube_task(storage: Arc<Store>) -> Arc<CubeTask<Store>> {
        Arc::new(CubeTask::new(
            CubeKey::new(DomainId(1), 3, 2, 4),
            Arc::new(World),
            storage,
            Arc::new(SchedulerStats::default()),
            Compensator::default(),
        ))
    }

    #[test]
    fn test_callbacks_fire_in_order_with_stamped_tile() {
        let task = column_task(store(false));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "first-again"] {
            let seen = seen.clone();
            task.core().add_callback(load_callback(move |tile: Option<Arc<Tile>>| {
                seen.lock().unwrap().push((tag, tile));
            }));
        }

        assert!(task.try_claim());
        task.run();
        let result = task.core().run_synchronous_part().unwrap().unwrap();

        assert_eq!(*result, Tile { value: 7, saved_at: 42 });
        let seen = seen.lock().unwrap();
        let tags: Vec<_> = seen.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags, ["first", "second", "first-again"]);
        for (_, tile) in seen.iter() {
            assert!(Arc::ptr_eq(tile.as_ref().unwrap(), &result));
        }
    }

    #[test]
    fn test_completion_runs_once() {
        let task = column_task(store(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        task.core().add_callback(load_callback(move |_: Option<Arc<Tile>>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        task.run();
        let first = task.core().run_synchronous_part().unwrap();
        let second = task.core().run_synchronous_part().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(first.as_ref().unwrap(), second.as_ref().unwrap()));
        assert!(!task.core().add_callback(load_callback(|_: Option<Arc<Tile>>| {})));
    }

    #[test]
    fn test_failed_read_still_finishes() {
        let task = column_task(store(true));
        let got = Arc::new(Mutex::new(None));
        let slot = got.clone();
        task.core().add_callback(load_callback(move |tile: Option<Arc<Tile>>| {
            *slot.lock().unwrap() = Some(tile.is_none());
        }));

        task.run();
        assert!(task.core().is_finished());
        assert!(task.core().run_synchronous_part().unwrap().is_none());
        assert_eq!(*got.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_remove_callback_by_identity() {
        let task = column_task(store(false));
        let a = load_callback(|_: Option<Arc<Tile>>| {});
        let b = load_callback(|_: Option<Arc<Tile>>| {});

        task.core().add_callback(a.clone());
        task.core().add_callback(a.clone());
        task.core().add_callback(b.clone());

        assert!(task.core().remove_callback(&a));
        assert!(task.core().remove_callback(&b));
        assert!(task.core().has_callbacks());
        assert!(task.core().remove_callback(&a));
        assert!(!task.core().has_callbacks());
        assert!(!task.core().remove_callback(&a));
    }

    #[test]
    fn test_resident_column_skips_storage_and_stamp() {
        let storage = store(false);
        let task = column_task(storage.clone());
        let resident = Arc::new(Tile { value: 5, saved_at: 3 });
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        task.core().add_callback(load_callback(move |tile: Option<Arc<Tile>>| {
            *slot.lock().unwrap() = tile;
        }));

        task.complete_with_resident(resident.clone());

        assert!(task.core().is_finished());
        assert!(!task.try_claim());
        let result = task.core().run_synchronous_part().unwrap().unwrap();
        assert!(Arc::ptr_eq(&result, &resident));
        assert_eq!(result.saved_at, 3);
        assert!(Arc::ptr_eq(seen.lock().unwrap().as_ref().unwrap(), &resident));
        assert_eq!(storage.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abandoned_cube_finishes_absent() {
        let storage = store(false);
        let task = cube_task(storage.clone());

        task.abandon();

        assert!(task.core().is_finished());
        assert!(task.core().run_synchronous_part().unwrap().is_none());
        assert_eq!(storage.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let task = column_task(store(false));
        assert!(task.try_claim());
        assert!(!task.try_claim());
    }

    #[test]
    fn test_cube_waits_for_late_parent() {
        let storage = store(false);
        let task = cube_task(storage.clone());

        let runner = {
            let task = task.clone();
            thread::spawn(move || task.run())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!task.core().is_finished());
        assert_eq!(storage.reads.load(Ordering::SeqCst), 0);

        task.set_parent(Some(Arc::new(Tile { value: 7, saved_at: 0 })));
        runner.join().unwrap();

        let cube = task.core().run_synchronous_part().unwrap().unwrap();
        assert_eq!(cube.value, 702);
        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cube_parent_is_set_once() {
        let task = cube_task(store(false));
        assert!(task.set_parent(Some(Arc::new(Tile { value: 1, saved_at: 0 }))));
        assert!(!task.set_parent(Some(Arc::new(Tile { value: 9, saved_at: 0 }))));

        task.run();
        assert_eq!(task.core().run_synchronous_part().unwrap().unwrap().value, 102);
    }

    #[test]
    fn test_cube_without_column_is_absent() {
        let storage = store(false);
        let task = cube_task(storage.clone());
        task.set_parent(None);

        task.run();
        assert!(task.core().run_synchronous_part().unwrap().is_none());
        assert_eq!(storage.reads.load(Ordering::SeqCst), 0);
    }
}
