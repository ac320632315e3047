//! # tileio
//!
//! An asynchronous tile-loading scheduler.
//!
//! Tiles (2-D columns and the 3-D cubes stacked inside them) are read from a
//! persistence backend on a pool of worker threads. Requests for the same tile
//! are coalesced into a single load, synchronous requests join loads that are
//! already in flight, and completion callbacks are handed back to the main
//! thread once per frame through [`LoadScheduler::drain_cycle`].
//!
//! ```ignore
//! use tileio::prelude::*;
//!
//! let scheduler = LoadScheduler::new(SchedulerConfig::default())?;
//! scheduler.queue_column_load(&world, &storage, &cache, 3, 4, load_callback(|column| {
//!     log::info!("column ready: {}", column.is_some());
//! }))?;
//!
//! // once per frame
//! scheduler.drain_cycle();
//! ```

pub mod background;
pub mod core;
#[cfg(feature = "debug")]
pub mod logging;
pub mod prelude;
pub mod tiles;
pub mod traits;
pub use crate::core::constants;

// Re-export public API
pub use crate::core::{
    config::{PoolConfig, SchedulerConfig, SchedulerProfile},
    keys::{ColumnKey, CubeKey, DomainId},
};

pub use background::pool::{Job, WorkerPool};

pub use tiles::{
    cache::ResidentCache,
    scheduler::LoadScheduler,
    stats::{SchedulerStats, StatsSnapshot},
    task::{load_callback, LoadCallback},
};

pub use traits::{ColumnProvider, TileDomain, TilePayload, TileStorage};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to wait for tile load: {0}")]
    WaitInterrupted(String),

    #[error("Worker pool has been shut down")]
    PoolShutdown,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Error type alias for convenience
pub type Error = SchedulerError;
