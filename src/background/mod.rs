pub mod pool;

pub use pool::{BlockGuard, Compensator, Job, WorkerPool};
