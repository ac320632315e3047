//! Prelude module for common tileio types and traits
//!
//! This module re-exports the most commonly used types, traits, and functions
//! for easy importing with `use tileio::prelude::*;`

pub use crate::core::{
    config::{PoolConfig, SchedulerConfig, SchedulerProfile},
    keys::{ColumnKey, CubeKey, DomainId},
};

pub use crate::tiles::{
    cache::ResidentCache,
    scheduler::LoadScheduler,
    stats::StatsSnapshot,
    task::{load_callback, LoadCallback},
};

pub use crate::traits::{ColumnProvider, ColumnReady, TileDomain, TilePayload, TileStorage};

pub use crate::background::pool::WorkerPool;

pub use crate::{Error as SchedulerError, Result};

pub use std::{
    sync::Arc,
    time::{Duration, Instant},
};

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet, FxHasher};
