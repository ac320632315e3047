//! Worker pool running blocking tile reads
//!
//! Jobs are withdrawn by claiming them: a submitted job stays in the queue,
//! and a worker that dequeues one somebody else already claimed just skips
//! it. A job that has to wait on another job takes a [`BlockGuard`] first, so
//! the pool can start a thread for the job it waits on.

use crate::core::config::PoolConfig;
use crate::{Result, SchedulerError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

/// A unit of work the pool can execute
///
/// A job may be withdrawn after submission: whoever wins [`Job::try_claim`]
/// runs it, and a worker that dequeues an already claimed job skips it.
pub trait Job: Send + Sync + 'static {
    /// Claim the job for execution. Returns `true` for exactly one caller.
    fn try_claim(&self) -> bool;

    /// Execute the job. Only called by the thread that claimed it.
    fn run(&self);
}

/// State shared between the pool handle and its worker threads
struct PoolState {
    config: PoolConfig,
    receiver: Receiver<Arc<dyn Job>>,
    core_size: AtomicUsize,
    live: AtomicUsize,
    idle: AtomicUsize,
    /// Workers parked inside a job waiting on another job
    blocked: AtomicUsize,
    thread_counter: AtomicUsize,
}

impl PoolState {
    /// Reserve a worker slot while the pool is below `limit`
    fn reserve_below(&self, limit: usize) -> bool {
        let mut live = self.live.load(Ordering::Acquire);
        loop {
            if live >= limit {
                return false;
            }
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }

    /// Give up a worker slot if the pool is above its floor
    fn try_retire(&self) -> bool {
        let mut live = self.live.load(Ordering::Acquire);
        loop {
            if live <= self.core_size.load(Ordering::Acquire) {
                return false;
            }
            match self.live.compare_exchange_weak(
                live,
                live - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }

    /// Start a worker for a slot that has already been reserved
    fn spawn_worker(self: &Arc<Self>) -> std::io::Result<()> {
        let n = self.thread_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{} #{}", self.config.thread_name_prefix, n);
        let state = Arc::clone(self);

        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(state));

        match spawned {
            Ok(_) => {
                log::debug!("started {}", name);
                Ok(())
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                log::error!("failed to start {}: {}", name, e);
                Err(e)
            }
        }
    }

    fn compensate(self: &Arc<Self>) {
        if self.receiver.is_empty() || self.idle.load(Ordering::Acquire) > 0 {
            return;
        }
        if self.reserve_below(usize::MAX) {
            log::debug!(
                "all workers blocked with {} job(s) queued, adding a worker",
                self.receiver.len()
            );
            let _ = self.spawn_worker();
        }
    }
}

fn worker_loop(state: Arc<PoolState>) {
    let keep_alive = state.config.keep_alive();

    loop {
        state.idle.fetch_add(1, Ordering::AcqRel);
        let next = state.receiver.recv_timeout(keep_alive);
        state.idle.fetch_sub(1, Ordering::AcqRel);

        match next {
            Ok(job) => {
                if !job.try_claim() {
                    // Withdrawn after submission
                    continue;
                }
                if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
                    log::error!("tile job panicked, worker continues");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if state.try_retire() {
                    log::debug!("idle worker above floor exiting");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                state.live.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }
}

/// Growable thread pool with an unbounded queue
///
/// Threads are started lazily as work arrives, up to the current floor
/// (core size). Threads above the floor exit after sitting idle for the
/// configured keep-alive. Worker threads are detached and never keep the
/// process alive.
pub struct WorkerPool {
    state: Arc<PoolState>,
    sender: Mutex<Option<Sender<Arc<dyn Job>>>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = unbounded();
        let core_size = config.base_threads;

        Ok(Self {
            state: Arc::new(PoolState {
                config,
                receiver,
                core_size: AtomicUsize::new(core_size),
                live: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                blocked: AtomicUsize::new(0),
                thread_counter: AtomicUsize::new(0),
            }),
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Queue a job, starting a worker if the pool is below its floor
    pub fn execute(&self, job: Arc<dyn Job>) -> Result<()> {
        {
            let guard = self
                .sender
                .lock()
                .map_err(|_| SchedulerError::PoolShutdown)?;
            let sender = guard.as_ref().ok_or(SchedulerError::PoolShutdown)?;
            sender
                .send(job)
                .map_err(|_| SchedulerError::PoolShutdown)?;
        }

        // Blocked workers cannot pick up the job, so they do not count
        // against the floor
        let limit = self.state.core_size.load(Ordering::Acquire)
            + self.state.blocked.load(Ordering::Acquire);
        if self.state.reserve_below(limit) {
            if let Err(e) = self.state.spawn_worker() {
                if self.live_workers() == 0 {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Withdraw a job that no worker has started yet
    ///
    /// Returns `true` if the job was withdrawn, in which case the caller now
    /// owns its execution. Returns `false` if it is already running or done.
    pub fn remove(&self, job: &dyn Job) -> bool {
        job.try_claim()
    }

    /// Change the worker floor
    ///
    /// Raising it starts workers for jobs that are already queued. Lowering it
    /// lets surplus workers exit once they have been idle for the keep-alive.
    pub fn set_core_size(&self, core_size: usize) {
        let core_size = core_size.max(1);
        let previous = self.state.core_size.swap(core_size, Ordering::AcqRel);
        if core_size == previous {
            return;
        }

        log::info!("tile I/O pool floor {} -> {}", previous, core_size);

        if core_size > previous {
            let mut to_start = self.state.receiver.len().min(core_size - previous);
            while to_start > 0 && self.state.reserve_below(core_size) {
                if self.state.spawn_worker().is_err() {
                    break;
                }
                to_start -= 1;
            }
        }
    }

    /// Resize the floor from a participant count using the configured ratio
    pub fn adjust_for_participants(&self, participants: usize) -> usize {
        let core_size = self.state.config.core_size_for(participants);
        self.set_core_size(core_size);
        core_size
    }

    /// Handle jobs can use to ask for an extra worker while they block
    pub fn compensator(&self) -> Compensator {
        Compensator(Arc::downgrade(&self.state))
    }

    /// Stop accepting work. Already queued jobs are still drained.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            if sender.take().is_some() {
                log::info!("tile I/O pool shutting down");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender
            .lock()
            .map(|sender| sender.is_none())
            .unwrap_or(true)
    }

    pub fn core_size(&self) -> usize {
        self.state.core_size.load(Ordering::Acquire)
    }

    pub fn live_workers(&self) -> usize {
        self.state.live.load(Ordering::Acquire)
    }

    pub fn idle_workers(&self) -> usize {
        self.state.idle.load(Ordering::Acquire)
    }

    /// Jobs waiting in the queue, including withdrawn ones not yet skipped
    pub fn queued_jobs(&self) -> usize {
        self.state.receiver.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.state.config
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("core_size", &self.core_size())
            .field("live", &self.live_workers())
            .field("idle", &self.idle_workers())
            .field("blocked", &self.state.blocked.load(Ordering::Acquire))
            .field("queued", &self.queued_jobs())
            .finish()
    }
}

/// Weak handle to a pool, held by jobs that may block on other jobs
#[derive(Clone, Default)]
pub struct Compensator(Weak<PoolState>);

impl Compensator {
    /// Called right before blocking. Starts an extra worker when every worker
    /// is busy and jobs are waiting, and lets jobs submitted while the guard
    /// lives start a worker of their own.
    pub fn before_block(&self) -> BlockGuard {
        let state = self.0.upgrade();
        if let Some(state) = &state {
            state.blocked.fetch_add(1, Ordering::AcqRel);
            state.compensate();
        }
        BlockGuard(state)
    }
}

/// Marks the current thread as blocked until dropped
#[must_use = "the thread only counts as blocked while the guard is alive"]
pub struct BlockGuard(Option<Arc<PoolState>>);

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if let Some(state) = &self.0 {
            state.blocked.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for Compensator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Compensator")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}
