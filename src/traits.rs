//! Collaborator abstractions consumed by the scheduler
//!
//! The scheduler owns none of the storage format, the resident tile cache or
//! the world clock. Hosts plug those in through the traits below.

use crate::core::keys::{ColumnKey, CubeKey, DomainId};
use crate::Result;
use std::io;
use std::sync::Arc;

/// The domain (world) a tile is requested for
pub trait TileDomain: Send + Sync + 'static {
    fn id(&self) -> DomainId;

    /// Current world time, stamped onto tiles as they are handed back
    fn world_time(&self) -> u64;
}

/// Anything the persistence backend can produce
pub trait TilePayload: Send + Sync + 'static {
    /// Bookkeeping applied on the main thread right before callbacks run,
    /// e.g. recording the last save time.
    fn stamp_loaded(&mut self, _world_time: u64) {}
}

/// Persistence backend turning a tile key into a tile
///
/// Both methods block on I/O and are only ever called from a worker thread or
/// from a caller that explicitly asked for a synchronous load.
/// `Ok(None)` means the tile was never stored.
pub trait TileStorage: Send + Sync + 'static {
    type Column: TilePayload;
    type Cube: TilePayload;

    fn load_column(&self, key: ColumnKey) -> io::Result<Option<Self::Column>>;

    /// Read a cube. The parent column is always resolved first.
    fn load_cube(&self, column: &Self::Column, key: CubeKey) -> io::Result<Option<Self::Cube>>;
}

/// Callback invoked once a parent column has been resolved
pub type ColumnReady<C> = Box<dyn FnOnce(Option<Arc<C>>) + Send>;

/// The resident column cache, consulted so that cube loads can obtain their
/// parent without duplicating column loading logic
pub trait ColumnProvider<C>: Send + Sync {
    /// The column if it is already resident
    fn loaded_column(&self, key: ColumnKey) -> Option<Arc<C>>;

    /// Make the column resident, blocking if necessary
    fn load_column(&self, key: ColumnKey) -> Result<Option<Arc<C>>>;

    /// Make the column resident in the background and call `on_ready` once it
    /// is, or with `None` if it could not be loaded
    fn resolve_column_async(&self, key: ColumnKey, on_ready: ColumnReady<C>) -> Result<()>;
}
