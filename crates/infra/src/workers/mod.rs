//! Background tasks: the cache sweeper, the invalidation worker and the
//! scheduled-invalidation drain ticker.

pub mod handle;
pub mod invalidation_worker;
pub mod periodic;

pub use handle::WorkerHandle;
pub use invalidation_worker::InvalidationWorker;
pub use periodic::{spawn_cache_sweeper, spawn_drain_ticker, spawn_periodic};
