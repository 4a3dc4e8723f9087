use crate::keys::CommandKey;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a command invocation surfaced an error instead of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureType {
    /// The run body returned an error.
    CommandFailure,
    /// The run body exceeded the execution timeout.
    Timeout,
    /// The circuit breaker refused the request.
    ShortCircuit,
    /// The worker pool refused the submission (virtual cap or full queue).
    ThreadPoolRejected,
    /// The execution semaphore had no free permit.
    SemaphoreRejected,
    /// The fallback semaphore had no free permit.
    FallbackSemaphoreRejected,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureType::CommandFailure => "command failure",
            FailureType::Timeout => "timeout",
            FailureType::ShortCircuit => "short-circuit",
            FailureType::ThreadPoolRejected => "thread pool rejection",
            FailureType::SemaphoreRejected => "semaphore rejection",
            FailureType::FallbackSemaphoreRejected => "fallback semaphore rejection",
        };
        f.write_str(name)
    }
}

/// Marker error a run body returns to signal invalid caller input.
///
/// Bad requests propagate to the caller unchanged: they are not counted as
/// failures, do not trip the circuit breaker and never trigger the fallback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BadRequest {
    message: String,
}

impl BadRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Terminal failure of one command invocation, carrying the originating
/// error and the fallback error (when one was attempted) as inner causes.
///
/// Causes are reference-counted so a failure stored in the request cache can
/// be handed to every duplicate caller without re-materializing it.
#[derive(Debug, Clone)]
pub struct RuntimeFailure {
    command: CommandKey,
    failure_type: FailureType,
    message: String,
    cause: Option<Arc<anyhow::Error>>,
    fallback_cause: Option<Arc<anyhow::Error>>,
}

impl RuntimeFailure {
    pub(crate) fn new(
        command: CommandKey,
        failure_type: FailureType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command,
            failure_type,
            message: message.into(),
            cause: None,
            fallback_cause: None,
        }
    }

    pub(crate) fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub(crate) fn with_fallback_cause(mut self, cause: anyhow::Error) -> Self {
        self.fallback_cause = Some(Arc::new(cause));
        self
    }

    pub fn command(&self) -> &CommandKey {
        &self.command
    }

    pub fn failure_type(&self) -> FailureType {
        self.failure_type
    }

    /// The error that started the failure path, if user code produced one
    /// (rejections and short-circuits have none).
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    /// The error the fallback body produced, when a fallback ran and failed.
    pub fn fallback_cause(&self) -> Option<&anyhow::Error> {
        self.fallback_cause.as_deref()
    }
}

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.command, self.failure_type, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, "; caused by: {cause}")?;
        }
        if let Some(fallback) = &self.fallback_cause {
            write!(f, "; fallback failed with: {fallback}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeFailure {}

/// Error surfaced by [`Command::execute`](crate::command::Command::execute)
/// and the future returned by [`Command::queue`](crate::command::Command::queue).
///
/// Cloneable so the request cache can replay a failed execution to every
/// duplicate caller within the request.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// User-signalled invalid input, propagated unchanged.
    #[error("bad request: {0}")]
    BadRequest(Arc<anyhow::Error>),

    /// The invocation failed after exhausting the fallback path.
    #[error(transparent)]
    Runtime(RuntimeFailure),

    /// Second execution of a single-shot command, or a cache key used
    /// without an active request context.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl CommandError {
    /// The failure type, when this is a runtime failure.
    pub fn failure_type(&self) -> Option<FailureType> {
        match self {
            CommandError::Runtime(failure) => Some(failure.failure_type()),
            _ => None,
        }
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, CommandError::BadRequest(_))
    }
}
