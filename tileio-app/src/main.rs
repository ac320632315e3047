use anyhow::Context;
use fxhash::{FxHashMap, FxHashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tileio::prelude::*;

const FRAMES: u64 = 240;
const FRAME_TIME: Duration = Duration::from_millis(16);
const VIEW_RADIUS: i32 = 3;
const CUBES_PER_COLUMN: i32 = 4;

/// Headless host driving the scheduler through a simulated frame loop
fn main() -> anyhow::Result<()> {
    tileio::logging::init();

    let config = match std::env::var("TILEIO_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading scheduler config from {}", path))?;
            SchedulerConfig::from_json_str(&json).context("parsing scheduler config")?
        }
        Err(_) => SchedulerProfile::Balanced.resolve(),
    };

    let scheduler = Arc::new(LoadScheduler::new(config)?);
    let world = Arc::new(Overworld::default());
    let domain: Arc<dyn TileDomain> = world.clone();
    let storage = Arc::new(RegionStore::new(Duration::from_millis(4)));
    let cache = ResidentCache::for_scheduler(scheduler.clone(), domain.clone(), storage.clone());

    let mut session = Session::new(scheduler.clone(), domain, storage.clone());
    let started = Instant::now();

    for frame in 0..FRAMES {
        world.tick();

        // Players join over time and wander along the x axis
        let players = 1 + (frame / 40) as usize * 60;
        if frame % 40 == 0 {
            let floor = scheduler.resize_pool(players);
            log::info!("frame {}: {} players, pool floor {}", frame, players, floor);
        }
        let centre = (frame / 20) as i32;
        session.stream_around(&cache, centre, 0)?;

        // Spawn area must be present before the first frame renders
        if frame == 0 {
            let spawn = scheduler.load_cube_sync(session.domain(), &storage, &cache, 0, 0, 0)?;
            log::info!("spawn cube loaded: {}", spawn.is_some());
        }

        let completed = scheduler.drain_cycle();
        if completed > 0 {
            log::debug!("frame {}: {} load(s) completed", frame, completed);
        }
        thread::sleep(FRAME_TIME);
    }

    while scheduler.pending_column_loads() + scheduler.pending_cube_loads() > 0 {
        scheduler.drain_cycle();
        thread::sleep(FRAME_TIME);
    }
    scheduler.shutdown();

    let stats = scheduler.stats();
    log::info!(
        "{} requests, {} storage reads, {} coalesced ({:.1}%), {} cancelled, {} columns resident, {:?}",
        stats.total_requests,
        stats.storage_loads,
        stats.coalesced_requests,
        stats.coalescing_ratio() * 100.0,
        stats.cancelled_tasks,
        cache.len(),
        started.elapsed()
    );
    println!("rendered {} cubes over {} frames", session.rendered(), FRAMES);
    Ok(())
}

#[derive(Default)]
struct Overworld {
    ticks: AtomicU64,
}

impl Overworld {
    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }
}

impl TileDomain for Overworld {
    fn id(&self) -> DomainId {
        DomainId(0)
    }

    fn world_time(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

struct ColumnData {
    heights: Vec<u8>,
    last_saved: u64,
}

impl TilePayload for ColumnData {
    fn stamp_loaded(&mut self, world_time: u64) {
        log::trace!("column last saved at tick {}, now {}", self.last_saved, world_time);
        self.last_saved = world_time;
    }
}

struct CubeData {
    blocks: Vec<u16>,
}

impl TilePayload for CubeData {}

/// Procedural store with a fixed read latency
struct RegionStore {
    latency: Duration,
}

impl RegionStore {
    fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl TileStorage for RegionStore {
    type Column = ColumnData;
    type Cube = CubeData;

    fn load_column(&self, key: ColumnKey) -> io::Result<Option<ColumnData>> {
        thread::sleep(self.latency);
        let seed = (key.x.wrapping_mul(31) ^ key.z.wrapping_mul(17)) as u8;
        Ok(Some(ColumnData {
            heights: (0..=255u8).map(|i| seed.wrapping_add(i) % 64).collect(),
            last_saved: 0,
        }))
    }

    fn load_cube(&self, column: &ColumnData, key: CubeKey) -> io::Result<Option<CubeData>> {
        thread::sleep(self.latency);
        let floor = (key.y * 16) as u8;
        if column.heights.iter().all(|&h| h < floor) {
            // Empty air was never written
            return Ok(None);
        }
        Ok(Some(CubeData {
            blocks: vec![1; 16 * 16 * 16],
        }))
    }
}

/// Tracks which cubes a host wants and keeps the scheduler in sync with it
struct Session {
    scheduler: Arc<LoadScheduler<RegionStore>>,
    domain: Arc<dyn TileDomain>,
    storage: Arc<RegionStore>,
    wanted: FxHashMap<CubeKey, LoadCallback<CubeData>>,
    rendered: Arc<AtomicU64>,
}

impl Session {
    fn new(
        scheduler: Arc<LoadScheduler<RegionStore>>,
        domain: Arc<dyn TileDomain>,
        storage: Arc<RegionStore>,
    ) -> Self {
        Self {
            scheduler,
            domain,
            storage,
            wanted: FxHashMap::default(),
            rendered: Arc::new(AtomicU64::new(0)),
        }
    }

    fn domain(&self) -> &Arc<dyn TileDomain> {
        &self.domain
    }

    fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    /// Queue every cube in view and drop requests for cubes that left it
    fn stream_around(
        &mut self,
        cache: &ResidentCache<RegionStore>,
        cx: i32,
        cz: i32,
    ) -> anyhow::Result<()> {
        let domain_id = self.domain.id();
        let mut in_view = FxHashSet::default();
        for x in cx - VIEW_RADIUS..=cx + VIEW_RADIUS {
            for z in cz - VIEW_RADIUS..=cz + VIEW_RADIUS {
                for y in 0..CUBES_PER_COLUMN {
                    in_view.insert(CubeKey::new(domain_id, x, y, z));
                }
            }
        }

        let gone: Vec<CubeKey> = self
            .wanted
            .keys()
            .filter(|key| !in_view.contains(key))
            .copied()
            .collect();
        for key in gone {
            if let Some(callback) = self.wanted.remove(&key) {
                // Already delivered loads are no longer queued
                if self.scheduler.is_cube_queued(&key) {
                    self.scheduler
                        .drop_cube_load(key.domain, key.x, key.y, key.z, &callback);
                }
            }
        }

        for key in in_view {
            if self.wanted.contains_key(&key) {
                continue;
            }
            let rendered = self.rendered.clone();
            let callback = load_callback(move |cube: Option<Arc<CubeData>>| {
                if cube.map(|c| !c.blocks.is_empty()).unwrap_or(false) {
                    rendered.fetch_add(1, Ordering::Relaxed);
                }
            });
            self.scheduler
                .queue_cube_load(
                    &self.domain,
                    &self.storage,
                    cache,
                    key.x,
                    key.y,
                    key.z,
                    callback.clone(),
                )
                .with_context(|| format!("queueing cube {}", key))?;
            self.wanted.insert(key, callback);
        }
        Ok(())
    }
}
