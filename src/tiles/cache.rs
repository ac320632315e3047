use crate::core::keys::ColumnKey;
use crate::tiles::scheduler::LoadScheduler;
use crate::tiles::task::load_callback;
use crate::traits::{ColumnProvider, ColumnReady, TileDomain, TileStorage};
use crate::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Resident column cache with LRU eviction
///
/// Missing columns are loaded through the scheduler, so cube loads resolving
/// their parent share the same coalescing as direct column requests.
pub struct ResidentCache<S: TileStorage> {
    columns: Arc<Mutex<LruCache<ColumnKey, Arc<S::Column>>>>,
    scheduler: Arc<LoadScheduler<S>>,
    domain: Arc<dyn TileDomain>,
    storage: Arc<S>,
}

impl<S: TileStorage> ResidentCache<S> {
    pub fn new(
        capacity: usize,
        scheduler: Arc<LoadScheduler<S>>,
        domain: Arc<dyn TileDomain>,
        storage: Arc<S>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            columns: Arc::new(Mutex::new(LruCache::new(capacity))),
            scheduler,
            domain,
            storage,
        }
    }

    /// Cache sized from the scheduler's configuration
    pub fn for_scheduler(
        scheduler: Arc<LoadScheduler<S>>,
        domain: Arc<dyn TileDomain>,
        storage: Arc<S>,
    ) -> Self {
        let capacity = scheduler.config().resident_cache_size;
        Self::new(capacity, scheduler, domain, storage)
    }

    pub fn get(&self, key: &ColumnKey) -> Option<Arc<S::Column>> {
        self.columns.lock().ok()?.get(key).cloned()
    }

    pub fn put(&self, key: ColumnKey, column: Arc<S::Column>) {
        if let Ok(mut columns) = self.columns.lock() {
            columns.put(key, column);
        }
    }

    pub fn contains(&self, key: &ColumnKey) -> bool {
        self.columns
            .lock()
            .ok()
            .map(|columns| columns.contains(key))
            .unwrap_or(false)
    }

    /// Evict a column, e.g. when the host unloads it
    pub fn remove(&self, key: &ColumnKey) -> Option<Arc<S::Column>> {
        self.columns.lock().ok()?.pop(key)
    }

    pub fn clear(&self) {
        if let Ok(mut columns) = self.columns.lock() {
            columns.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.columns
            .lock()
            .ok()
            .map(|columns| columns.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.columns
            .lock()
            .ok()
            .map(|columns| columns.cap().get())
            .unwrap_or(0)
    }

    pub fn domain(&self) -> &Arc<dyn TileDomain> {
        &self.domain
    }
}

impl<S: TileStorage> ColumnProvider<S::Column> for ResidentCache<S> {
    fn loaded_column(&self, key: ColumnKey) -> Option<Arc<S::Column>> {
        self.get(&key)
    }

    fn load_column(&self, key: ColumnKey) -> Result<Option<Arc<S::Column>>> {
        if let Some(column) = self.get(&key) {
            return Ok(Some(column));
        }

        let column = self
            .scheduler
            .load_column_sync(&self.domain, &self.storage, key.x, key.z)?;
        if let Some(column) = &column {
            self.put(key, Arc::clone(column));
        }
        Ok(column)
    }

    fn resolve_column_async(&self, key: ColumnKey, on_ready: ColumnReady<S::Column>) -> Result<()> {
        if let Some(column) = self.get(&key) {
            on_ready(Some(column));
            return Ok(());
        }

        // Callbacks are `Fn`, the notification is one-shot
        let on_ready = Mutex::new(Some(on_ready));
        let columns = Arc::clone(&self.columns);
        let callback = load_callback(move |column: Option<Arc<S::Column>>| {
            if let Some(column) = &column {
                if let Ok(mut columns) = columns.lock() {
                    columns.put(key, Arc::clone(column));
                }
            }
            let pending = on_ready.lock().ok().and_then(|mut slot| slot.take());
            if let Some(on_ready) = pending {
                on_ready(column);
            }
        });

        self.scheduler
            .queue_column_load(&self.domain, &self.storage, self, key.x, key.z, callback)
    }
}

impl<S: TileStorage> std::fmt::Debug for ResidentCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidentCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SchedulerConfig;
    use crate::core::keys::{CubeKey, DomainId};
    use crate::traits::TilePayload;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct World;

    impl TileDomain for World {
        fn id(&self) -> DomainId {
            DomainId(0)
        }

        fn world_time(&self) -> u64 {
            0
        }
    }

    struct Column(i32);
    impl TilePayload for Column {}

    #[derive(Default)]
    struct Store {
        reads: AtomicUsize,
    }

    impl TileStorage for Store {
        type Column = Column;
        type Cube = Column;

        fn load_column(&self, key: ColumnKey) -> io::Result<Option<Column>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Column(key.x * 10 + key.z)))
        }

        fn load_cube(&self, _column: &Column, _key: CubeKey) -> io::Result<Option<Column>> {
            Ok(None)
        }
    }

    fn cache(capacity: usize) -> (ResidentCache<Store>, Arc<Store>) {
        let scheduler = Arc::new(LoadScheduler::new(SchedulerConfig::for_testing()).unwrap());
        let storage = Arc::new(Store::default());
        let cache = ResidentCache::new(capacity, scheduler, Arc::new(World), storage.clone());
        (cache, storage)
    }

    fn key(x: i32, z: i32) -> ColumnKey {
        ColumnKey::new(DomainId(0), x, z)
    }

    #[test]
    fn test_lru_eviction() {
        let (cache, _) = cache(2);

        cache.put(key(1, 1), Arc::new(Column(1)));
        cache.put(key(2, 2), Arc::new(Column(2)));
        cache.put(key(3, 3), Arc::new(Column(3)));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key(1, 1)));
        assert!(cache.contains(&key(3, 3)));
        assert_eq!(cache.capacity(), 2);
    }

    #[test]
    fn test_load_column_reads_once() {
        let (cache, storage) = cache(8);

        let first = cache.load_column(key(2, 3)).unwrap().unwrap();
        let second = cache.load_column(key(2, 3)).unwrap().unwrap();

        assert_eq!(first.0, 23);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolve_resident_column_immediately() {
        let (cache, storage) = cache(8);
        cache.put(key(0, 0), Arc::new(Column(5)));

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        cache
            .resolve_column_async(
                key(0, 0),
                Box::new(move |column: Option<Arc<Column>>| {
                    *slot.lock().unwrap() = column.map(|c| c.0)
                }),
            )
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(5));
        assert_eq!(storage.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolve_missing_column_after_drain() {
        let (cache, _) = cache(8);
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();

        cache
            .resolve_column_async(
                key(4, 1),
                Box::new(move |column: Option<Arc<Column>>| {
                    *slot.lock().unwrap() = column.map(|c| c.0)
                }),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_none() && Instant::now() < deadline {
            cache.scheduler.drain_cycle();
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(*seen.lock().unwrap(), Some(41));
        assert!(cache.contains(&key(4, 1)));
    }
}
