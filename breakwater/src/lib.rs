//! Latency and fault tolerance runtime for calls to external dependencies.
//!
//! Each dependency call is wrapped as a single-shot [`Command`] executed
//! under isolation (a bounded worker pool or a counting semaphore), observed
//! through rolling metrics, and gated by a circuit breaker. Refused or
//! failed executions fall back to a user-supplied value; within one request,
//! responses can be memoized through a [`RequestContext`].
//!
//! ```no_run
//! use breakwater::{Command, RequestContext};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let context = RequestContext::new();
//! let result = context
//!     .scope(async {
//!         let command = Command::builder("UserGroup", "GetUser")
//!             .run(|| async { Ok("alice".to_string()) })
//!             .fallback(|| async { Ok("anonymous".to_string()) })
//!             .build();
//!         command.execute().await
//!     })
//!     .await;
//! context.shutdown();
//! # result.map(|_| ()).map_err(anyhow::Error::from)
//! # }
//! ```

use tracing::info;

pub mod circuit;
pub mod command;
pub mod context;
pub mod error;
pub mod isolation;
pub mod keys;
pub mod metrics;
pub mod plugins;
pub mod properties;

pub use command::{Command, CommandBuilder, CommandResponse, QueuedExecution};
pub use context::{RequestContext, RequestLog};
pub use error::{BadRequest, CommandError, FailureType, RuntimeFailure};
pub use isolation::{CommandThreadPool, TrySemaphore};
pub use keys::{CommandKey, GroupKey, PoolKey};
pub use metrics::{CommandMetrics, EventType, HealthCounts};
pub use properties::{CommandProperties, IsolationStrategy, ThreadPoolProperties};

/// Stop every worker pool immediately and drain the pool registry. In-flight
/// submissions observe pool rejections afterwards.
pub fn shutdown() {
    isolation::thread_pool::shutdown();
}

/// Stop every worker pool, waiting up to `timeout` for running and queued
/// jobs to drain before abandoning them. Returns true when everything
/// drained in time.
pub async fn shutdown_with_timeout(timeout: std::time::Duration) -> bool {
    isolation::thread_pool::shutdown_with_timeout(timeout).await
}

/// Testing hook: stop all pools and clear every process-wide registry
/// (metrics, breakers, semaphores, publisher state). Safe to call between
/// test cases.
pub fn reset() {
    isolation::thread_pool::shutdown();
    metrics::command_metrics::reset_registry();
    circuit::reset_registry();
    isolation::semaphore::reset_registry();
    plugins::reset_publisher_state();
}

/// Initialize tracing output for the library.
pub fn init_logging(level: Option<String>) {
    let log_level = level.unwrap_or_else(|| "info".to_string());

    if tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::new(format!(
                "breakwater={log_level}"
            )))
            .finish(),
    )
    .is_err()
    {
        // Subscriber already set, ignore error
    }

    info!("breakwater logging initialized at level: {}", log_level);
}
