use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;

use futures::FutureExt;

use crate::error::Error;

/// Spawn a background tokio task. The task must return a `Result<T, Error>`.
/// When the task exits, the provided cleanup fn is called with a reference to
/// the returned result. If the task panics, the cleanup fn is called with
/// `Err(Error::BackgroundTaskPanic)`.
pub(crate) fn spawn_bg_task<F, T, C>(
    handle: &tokio::runtime::Handle,
    cleanup_fn: C,
    future: F,
) -> tokio::task::JoinHandle<Result<T, Error>>
where
    F: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
    C: FnOnce(&Result<T, Error>) + Send + 'static,
{
    // The future must live as long as the cleanup_fn; otherwise everything
    // owned by the future is dropped before the cleanup runs and observers
    // could see released resources without the terminal state being set.
    let wrapped = AssertUnwindSafe(future).catch_unwind().map(move |outcome| {
        let result = match outcome {
            Ok(Ok(val)) => Ok(val),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::BackgroundTaskPanic),
        };
        cleanup_fn(&result);
        result
    });
    handle.spawn(wrapped)
}

/// Monotonically increasing sequence, used for FIFO tie-breaking in the
/// executor priority queues.
#[derive(Debug)]
pub(crate) struct MonotonicSeq {
    val: AtomicU64,
}

impl MonotonicSeq {
    pub fn new(initial_value: u64) -> Self {
        Self {
            val: AtomicU64::new(initial_value),
        }
    }

    pub fn next(&self) -> u64 {
        self.val.fetch_add(1, SeqCst) + 1
    }
}
