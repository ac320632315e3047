pub mod cache;
pub(crate) mod registry;
pub mod scheduler;
pub mod stats;
pub mod task;

// Re-exports for convenience
pub use cache::ResidentCache;
pub use scheduler::LoadScheduler;
pub use stats::{SchedulerStats, StatsSnapshot};
pub use task::{load_callback, LoadCallback};
