//! Isolation primitives bounding concurrent command executions: a
//! non-blocking counting permit and a bounded worker pool with queue-depth
//! admission.

pub mod semaphore;
pub mod thread_pool;

pub use semaphore::TrySemaphore;
pub use thread_pool::{CommandThreadPool, PoolRejection};
