//! Engine-wide defaults for the loading pipeline.
//! Keeping them in a single place makes it easier to tweak the scheduler's magic numbers.

/// Worker floor the pool never shrinks below.
pub const BASE_THREADS: usize = 1;

/// One additional worker is kept alive for every this many participants.
pub const PARTICIPANTS_PER_THREAD: usize = 50;

/// Seconds a worker above the floor may sit idle before it exits.
pub const KEEP_ALIVE_SECS: u64 = 60;

/// Prefix for worker thread names, followed by ` #<n>`.
pub const THREAD_NAME_PREFIX: &str = "Tile I/O Thread";
