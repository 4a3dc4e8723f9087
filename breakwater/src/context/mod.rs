//! Request-scoped state: the response cache and the executed-command log,
//! plus the ambient "current context" slot commands resolve when no context
//! is supplied explicitly.

pub mod cache;
pub mod log;

pub use cache::RequestCache;
pub use log::{LogEntry, RequestLog, MAX_LOG_SIZE};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
}

/// Scope associated with one logical caller (one user request). Holds the
/// response cache and the executed-command log; at most one context is
/// active per unit of concurrency.
///
/// The context is an explicit value: thread it through
/// [`CommandBuilder::context`](crate::command::CommandBuilder::context), or
/// install it ambiently for a future's duration with [`RequestContext::scope`].
/// Task-local installation does not cross `tokio::spawn`; restoring it on a
/// worker is the concurrency strategy's job.
#[derive(Debug)]
pub struct RequestContext {
    id: Uuid,
    active: AtomicBool,
    cache: RequestCache,
    log: RequestLog,
}

impl RequestContext {
    pub fn new() -> Arc<RequestContext> {
        let context = Arc::new(RequestContext {
            id: Uuid::new_v4(),
            active: AtomicBool::new(true),
            cache: RequestCache::new(),
            log: RequestLog::new(),
        });
        debug!(target: "breakwater::context", id = %context.id, "request context created");
        context
    }

    /// The ambient context installed by [`scope`](Self::scope), if any.
    pub fn current() -> Option<Arc<RequestContext>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    /// Run `fut` with this context installed as the ambient current context.
    pub fn scope<F: Future>(self: &Arc<Self>, fut: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(Arc::clone(self), fut)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// End the request: discard cached responses and the command log. The
    /// next context starts empty.
    pub fn shutdown(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.cache.clear_all();
            self.log.clear();
            debug!(target: "breakwater::context", id = %self.id, "request context shut down");
        }
    }
}
