//! Main-thread entry point for tile loading
//!
//! [`LoadScheduler`] coalesces requests per tile key, hands the blocking reads
//! to a [`WorkerPool`] and completes finished loads on the host thread during
//! [`LoadScheduler::drain_cycle`]. Synchronous loads either take over a queued
//! task or wait for the running one, so a tile is never read twice at once.

use crate::background::pool::{Job, WorkerPool};
use crate::SchedulerError;
use crate::core::config::SchedulerConfig;
use crate::core::keys::{ColumnKey, CubeKey, DomainId};
use crate::tiles::registry::{Registration, TaskRegistry};
use crate::tiles::stats::{SchedulerStats, StatsSnapshot};
use crate::tiles::task::{ColumnTask, CubeTask, LoadCallback};
use crate::traits::{ColumnProvider, TileDomain, TileStorage};
use crate::Result;
use std::sync::{Arc, Weak};

pub struct LoadScheduler<S: TileStorage> {
    columns: TaskRegistry<ColumnKey, ColumnTask<S>>,
    cubes: TaskRegistry<CubeKey, CubeTask<S>>,
    pool: Arc<WorkerPool>,
    stats: Arc<SchedulerStats>,
    config: SchedulerConfig,
}

impl<S: TileStorage> LoadScheduler<S> {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::new(config.pool.clone())?);
        log::info!(
            "tile scheduler ready (floor {}, one extra worker per {} participants)",
            config.pool.base_threads,
            config.pool.participants_per_thread
        );

        Ok(Self {
            columns: TaskRegistry::new(),
            cubes: TaskRegistry::new(),
            pool,
            stats: Arc::new(SchedulerStats::default()),
            config,
        })
    }

    /// Load a column, blocking until it is available
    ///
    /// Joins a load already in flight for the same key. Its callbacks fire
    /// here, on the calling thread, before this returns. The caller is
    /// responsible for making the column resident afterwards, which is what
    /// lets later queued requests skip storage.
    pub fn load_column_sync(
        &self,
        domain: &Arc<dyn TileDomain>,
        storage: &Arc<S>,
        x: i32,
        z: i32,
    ) -> Result<Option<Arc<S::Column>>> {
        let key = ColumnKey::new(domain.id(), x, z);
        self.stats.record_request();

        let task = match self.columns.remove(&key) {
            Some(task) => {
                self.stats.record_sync_join();
                log::debug!("synchronous load joins queued column {}", key);
                if self.pool.remove(task.as_ref()) {
                    task.run();
                }
                task
            }
            None => {
                let task = self.column_task(key, domain, storage);
                task.run();
                task
            }
        };
        task.core().run_synchronous_part()
    }

    /// Load a cube, blocking until it is available
    ///
    /// The parent column is loaded through `cache` first. A cube whose column
    /// does not exist resolves to `None` without touching storage.
    pub fn load_cube_sync<P>(
        &self,
        domain: &Arc<dyn TileDomain>,
        storage: &Arc<S>,
        cache: &P,
        x: i32,
        y: i32,
        z: i32,
    ) -> Result<Option<Arc<S::Cube>>>
    where
        P: ColumnProvider<S::Column> + ?Sized,
    {
        let key = CubeKey::new(domain.id(), x, y, z);
        self.stats.record_request();
        let column = cache.load_column(key.column())?;

        let task = match self.cubes.remove(&key) {
            Some(task) => {
                self.stats.record_sync_join();
                log::debug!("synchronous load joins queued cube {}", key);
                task.set_parent(column);
                if self.pool.remove(task.as_ref()) {
                    task.run();
                }
                task
            }
            None => {
                let task = self.cube_task(key, domain, storage);
                task.set_parent(column);
                task.run();
                task
            }
        };
        task.core().run_synchronous_part()
    }

    /// Queue a column load. `callback` fires from a later
    /// [`drain_cycle`](Self::drain_cycle), or from a synchronous load of the
    /// same column, whichever comes first.
    ///
    /// A column already resident in `cache` is handed to the callback on the
    /// next drain without reading storage.
    pub fn queue_column_load<P>(
        &self,
        domain: &Arc<dyn TileDomain>,
        storage: &Arc<S>,
        cache: &P,
        x: i32,
        z: i32,
        callback: LoadCallback<S::Column>,
    ) -> Result<()>
    where
        P: ColumnProvider<S::Column> + ?Sized,
    {
        let key = ColumnKey::new(domain.id(), x, z);
        self.stats.record_request();
        let resident = cache.loaded_column(key);

        let registration = self.columns.attach_or_insert(
            key,
            |task| task.core().add_callback(Arc::clone(&callback)),
            || {
                let task = self.column_task(key, domain, storage);
                task.core().add_callback(Arc::clone(&callback));
                match resident {
                    Some(column) => {
                        log::debug!("column {} already resident", key);
                        task.complete_with_resident(column);
                    }
                    None => self.pool.execute(task.clone())?,
                }
                Ok(task)
            },
        )?;

        self.note_registration(&registration, &key);
        Ok(())
    }

    /// Queue a cube load. The parent column is taken from `cache` if resident,
    /// otherwise `cache` is asked to resolve it in the background. The cube
    /// is only handed to the pool once its column is known, so cubes waiting
    /// on cold columns never hold a worker.
    pub fn queue_cube_load<P>(
        &self,
        domain: &Arc<dyn TileDomain>,
        storage: &Arc<S>,
        cache: &P,
        x: i32,
        y: i32,
        z: i32,
        callback: LoadCallback<S::Cube>,
    ) -> Result<()>
    where
        P: ColumnProvider<S::Column> + ?Sized,
    {
        let key = CubeKey::new(domain.id(), x, y, z);
        self.stats.record_request();

        let registration = self.cubes.attach_or_insert(
            key,
            |task| task.core().add_callback(Arc::clone(&callback)),
            || {
                if self.pool.is_shutdown() {
                    return Err(SchedulerError::PoolShutdown);
                }
                let task = self.cube_task(key, domain, storage);
                task.core().add_callback(Arc::clone(&callback));
                Ok(task)
            },
        )?;
        self.note_registration(&registration, &key);

        // Joined requests ride on the parent resolution already in progress
        let Registration::Created(task) = registration else {
            return Ok(());
        };

        match cache.loaded_column(key.column()) {
            Some(column) => {
                task.set_parent(Some(column));
                dispatch_cube(&self.pool, task);
            }
            None => {
                let pending = Arc::clone(&task);
                let pool = Arc::downgrade(&self.pool);
                let resolved = cache.resolve_column_async(
                    key.column(),
                    Box::new(move |column: Option<Arc<S::Column>>| {
                        if pending.set_parent(column) {
                            dispatch_cube_weak(&pool, pending);
                        }
                    }),
                );
                if let Err(e) = resolved {
                    log::warn!("Could not resolve column for cube {}: {}", key, e);
                    if task.set_parent(None) {
                        dispatch_cube(&self.pool, task);
                    }
                }
            }
        }
        Ok(())
    }

    /// Withdraw `callback` from a queued column load
    ///
    /// Once the last callback is gone the load is dropped, and cancelled if no
    /// worker has started it. Returns `false` if nothing matched.
    pub fn drop_column_load(
        &self,
        domain: DomainId,
        x: i32,
        z: i32,
        callback: &LoadCallback<S::Column>,
    ) -> bool {
        let key = ColumnKey::new(domain, x, z);
        let mut queued = false;
        let mut removed_callback = false;

        let emptied = self.columns.remove_if(&key, |task| {
            queued = true;
            removed_callback = task.core().remove_callback(callback);
            !task.core().has_callbacks()
        });

        if !queued {
            log::warn!("Attempting to drop column that wasn't queued in {}", key);
            return false;
        }
        if !removed_callback {
            log::warn!("Callback was not registered for column in {}", key);
            return false;
        }

        self.stats.record_drop();
        if let Some(task) = emptied {
            self.cancel(task.as_ref(), &key);
        }
        true
    }

    /// Withdraw `callback` from a queued cube load. See
    /// [`drop_column_load`](Self::drop_column_load).
    pub fn drop_cube_load(
        &self,
        domain: DomainId,
        x: i32,
        y: i32,
        z: i32,
        callback: &LoadCallback<S::Cube>,
    ) -> bool {
        let key = CubeKey::new(domain, x, y, z);
        let mut queued = false;
        let mut removed_callback = false;

        let emptied = self.cubes.remove_if(&key, |task| {
            queued = true;
            removed_callback = task.core().remove_callback(callback);
            !task.core().has_callbacks()
        });

        if !queued {
            log::warn!("Attempting to drop cube that wasn't queued in {}", key);
            return false;
        }
        if !removed_callback {
            log::warn!("Callback was not registered for cube in {}", key);
            return false;
        }

        self.stats.record_drop();
        if let Some(task) = emptied {
            self.cancel(task.as_ref(), &key);
        }
        true
    }

    /// Complete every finished load, firing its callbacks on this thread
    ///
    /// Columns go first so that cube callbacks see their column resident.
    /// Returns the number of loads completed.
    pub fn drain_cycle(&self) -> usize {
        let mut completed = 0;

        for key in self.columns.keys_where(|task| task.core().is_finished()) {
            let Some(task) = self
                .columns
                .remove_if(&key, |task| task.core().is_finished())
            else {
                continue;
            };
            if let Err(e) = task.core().run_synchronous_part() {
                log::error!("Could not complete column load in {}: {}", key, e);
            }
            completed += 1;
        }

        for key in self.cubes.keys_where(|task| task.core().is_finished()) {
            let Some(task) = self.cubes.remove_if(&key, |task| task.core().is_finished())
            else {
                continue;
            };
            if let Err(e) = task.core().run_synchronous_part() {
                log::error!("Could not complete cube load in {}: {}", key, e);
            }
            completed += 1;
        }

        if completed > 0 {
            log::trace!("drain cycle completed {} load(s)", completed);
        }
        completed
    }

    /// Resize the worker floor for the current participant count and return
    /// the new floor
    pub fn resize_pool(&self, participants: usize) -> usize {
        self.pool.adjust_for_participants(participants)
    }

    /// Stop accepting new asynchronous loads. Loads already queued still run
    /// and can be drained; synchronous loads keep working on the caller.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub fn pending_column_loads(&self) -> usize {
        self.columns.len()
    }

    pub fn pending_cube_loads(&self) -> usize {
        self.cubes.len()
    }

    pub fn is_column_queued(&self, key: &ColumnKey) -> bool {
        self.columns.contains(key)
    }

    pub fn is_cube_queued(&self, key: &CubeKey) -> bool {
        self.cubes.contains(key)
    }

    /// Whether the in-flight load for `key` has finished reading and waits
    /// for a drain cycle
    pub fn is_column_ready(&self, key: &ColumnKey) -> bool {
        self.columns
            .get(key)
            .map(|task| task.core().is_finished())
            .unwrap_or(false)
    }

    pub fn is_cube_ready(&self, key: &CubeKey) -> bool {
        self.cubes
            .get(key)
            .map(|task| task.core().is_finished())
            .unwrap_or(false)
    }

    pub fn pool_core_size(&self) -> usize {
        self.pool.core_size()
    }

    /// Jobs submitted to the pool that no worker has dequeued yet
    pub fn queued_jobs(&self) -> usize {
        self.pool.queued_jobs()
    }

    pub fn pool(&self) -> &WorkerPool {
        self.pool.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn column_task(
        &self,
        key: ColumnKey,
        domain: &Arc<dyn TileDomain>,
        storage: &Arc<S>,
    ) -> Arc<ColumnTask<S>> {
        Arc::new(ColumnTask::new(
            key,
            Arc::clone(domain),
            Arc::clone(storage),
            Arc::clone(&self.stats),
        ))
    }

    fn cube_task(
        &self,
        key: CubeKey,
        domain: &Arc<dyn TileDomain>,
        storage: &Arc<S>,
    ) -> Arc<CubeTask<S>> {
        Arc::new(CubeTask::new(
            key,
            Arc::clone(domain),
            Arc::clone(storage),
            Arc::clone(&self.stats),
            self.pool.compensator(),
        ))
    }

    fn note_registration<V, K: std::fmt::Display>(&self, registration: &Registration<V>, key: &K) {
        if !registration.is_new() {
            self.stats.record_coalesced();
            log::debug!("coalesced load request for {}", key);
        }
    }

    fn cancel<K: std::fmt::Display>(&self, job: &dyn Job, key: &K) {
        if self.pool.remove(job) {
            self.stats.record_cancelled();
            log::debug!("cancelled queued load for {}", key);
        } else {
            log::debug!("load for {} already started, result will be discarded", key);
        }
    }
}

/// Hand a cube whose parent is known to the pool. If the pool no longer
/// accepts work the cube finishes absent so its entry still drains.
fn dispatch_cube<S: TileStorage>(pool: &WorkerPool, task: Arc<CubeTask<S>>) {
    if let Err(e) = pool.execute(task.clone()) {
        log::warn!("Could not submit cube load {}: {}", task.core().key(), e);
        task.abandon();
    }
}

fn dispatch_cube_weak<S: TileStorage>(pool: &Weak<WorkerPool>, task: Arc<CubeTask<S>>) {
    match pool.upgrade() {
        Some(pool) => dispatch_cube(&pool, task),
        None => task.abandon(),
    }
}

impl<S: TileStorage> std::fmt::Debug for LoadScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadScheduler")
            .field("pending_columns", &self.columns.len())
            .field("pending_cubes", &self.cubes.len())
            .field("pool", &self.pool)
            .finish()
    }
}
