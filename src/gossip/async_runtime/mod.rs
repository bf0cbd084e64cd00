//! Bootstraps the `tokio` runtime used by the whole node: the HTTP/WS
//! server, every link session's read loop, write serializer and ping
//! ticker, the connection manager's dial/prune loops and the discovery
//! loop all run as tasks on this runtime.

use crate::gossip::error::*;

pub type JoinHandle<T> = ::tokio::task::JoinHandle<T>;

pub type Runtime = ::tokio::runtime::Runtime;

/// Builds a multi-threaded runtime with `num_threads` worker threads.
///
/// A value of `0` lets `tokio` pick the number of worker threads
/// (one per available core).
pub fn build(num_threads: usize) -> Result<Runtime> {
    let mut builder = ::tokio::runtime::Builder::new_multi_thread();
    if num_threads > 0 {
        builder.worker_threads(num_threads);
    }
    builder
        .thread_name("gossipmesh-worker")
        .enable_all()
        .build()
        .simple(ErrorKind::Config)
}

/// Spawns a future onto the ambient `tokio` runtime.
///
/// Must be called from within a runtime context (i.e. from a task
/// already running on a `Runtime` built with [`build`]).
#[inline]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    ::tokio::spawn(future)
}
