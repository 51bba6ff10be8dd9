//! Runtime abstractions.
//!
//! The server and client both need somewhere to spawn background futures:
//! a connection's I/O loop, a worker's response-delay timer, a client's
//! dedicated session thread. Rather than hard-code `tokio::spawn`, both
//! accept anything implementing [`Executor`], which lets an embedder plug in
//! a runtime handle scoped to a particular set of threads (e.g. a separate
//! "timer context" used only for response-delay waits).

use std::future::Future;

/// An executor of futures, used to place work onto a particular runtime or
/// set of threads.
///
/// # Example
///
/// ```
/// # use h2flow::rt::Executor;
/// # use std::future::Future;
/// #[derive(Clone)]
/// struct TokioExecutor;
///
/// impl<F> Executor<F> for TokioExecutor
/// where
///     F: Future + Send + 'static,
///     F::Output: Send + 'static,
/// {
///     fn execute(&self, fut: F) {
///         tokio::spawn(fut);
///     }
/// }
/// ```
pub trait Executor<Fut> {
    /// Place the future into the executor to be run.
    fn execute(&self, fut: Fut);
}

/// An [`Executor`] backed by a `tokio::runtime::Handle`, used as the default
/// timer context and protocol I/O executor when the embedder doesn't supply
/// one of its own.
#[derive(Clone, Debug)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    /// Capture the handle of the currently running tokio runtime.
    pub fn current() -> Self {
        TokioExecutor {
            handle: tokio::runtime::Handle::current(),
        }
    }

    /// Wrap an explicit runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioExecutor { handle }
    }

    pub(crate) fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

impl<F> Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        self.handle.spawn(fut);
    }
}
