//! In-process compaction executors.
//!
//! Each compaction service owns a set of internal executors, one per worker
//! group its planner declared. An executor holds a priority queue of jobs
//! and runs at most `num_threads` of them concurrently as tokio tasks.
//! Tasks are pumped on demand: submission and completion both try to start
//! work, so there are no idle worker loops and shrinking the thread count
//! takes effect as running jobs finish.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::compactable::{Compactable, CompletionNotifier};
use crate::error::Error;
use crate::rate_limiter::RateLimiter;
use crate::types::{CompactionJob, ExecutorId, ServiceId, TabletExtent};
use crate::utils::{spawn_bg_task, MonotonicSeq};

struct QueuedJob {
    priority: i16,
    seq: u64,
    job: CompactionJob,
    compactable: Arc<dyn Compactable>,
    notifier: CompletionNotifier,
    canceled: Arc<AtomicBool>,
}

impl QueuedJob {
    fn is_canceled(&self) -> bool {
        self.canceled.load(SeqCst)
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // max-heap: highest priority first, FIFO within a priority
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct ExecState {
    queue: BinaryHeap<QueuedJob>,
    running: usize,
    num_threads: usize,
    stopped: bool,
}

pub(crate) struct InternalExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    id: ExecutorId,
    service: ServiceId,
    handle: tokio::runtime::Handle,
    rate_limiter: Arc<RateLimiter>,
    seq: MonotonicSeq,
    state: Mutex<ExecState>,
}

impl InternalExecutor {
    pub(crate) fn new(
        id: ExecutorId,
        service: ServiceId,
        num_threads: usize,
        handle: tokio::runtime::Handle,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                service,
                handle,
                rate_limiter,
                seq: MonotonicSeq::new(0),
                state: Mutex::new(ExecState {
                    queue: BinaryHeap::new(),
                    running: 0,
                    num_threads,
                    stopped: false,
                }),
            }),
        }
    }

    pub(crate) fn submit(
        &self,
        job: CompactionJob,
        compactable: Arc<dyn Compactable>,
        notifier: CompletionNotifier,
    ) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.queue.push(QueuedJob {
            priority: job.priority,
            seq: self.inner.seq.next(),
            job,
            compactable,
            notifier,
            canceled: Arc::new(AtomicBool::new(false)),
        });
        self.inner.pump(&mut state);
    }

    /// Applies a new thread count. Growth starts queued work immediately;
    /// shrinking lets excess running jobs finish.
    pub(crate) fn reconfigure(&self, num_threads: usize) {
        let mut state = self.inner.state.lock();
        state.num_threads = num_threads;
        self.inner.pump(&mut state);
    }

    /// Idempotent. Queued jobs are dropped; running jobs finish.
    pub(crate) fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        state.queue.clear();
    }

    pub(crate) fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    pub(crate) fn queued(&self) -> usize {
        self.inner
            .state
            .lock()
            .queue
            .iter()
            .filter(|j| !j.is_canceled())
            .count()
    }

    pub(crate) fn is_queued(&self, extent: &TabletExtent) -> bool {
        self.inner
            .state
            .lock()
            .queue
            .iter()
            .any(|j| !j.is_canceled() && j.job.extent == *extent)
    }

    pub(crate) fn cancel_for_extent(&self, extent: &TabletExtent) {
        for entry in self.inner.state.lock().queue.iter() {
            if entry.job.extent == *extent {
                entry.canceled.store(true, SeqCst);
            }
        }
    }
}

impl Inner {
    /// Starts queued jobs while worker capacity remains. Callers hold the
    /// state lock; spawned tasks re-enter through their completion cleanup.
    fn pump(self: &Arc<Self>, state: &mut ExecState) {
        while state.running < state.num_threads {
            let next = loop {
                match state.queue.pop() {
                    None => return,
                    Some(entry) if entry.is_canceled() => continue,
                    Some(entry) => break entry,
                }
            };
            state.running += 1;

            let QueuedJob {
                job,
                compactable,
                notifier,
                ..
            } = next;
            let extent = job.extent.clone();
            let executor_id = self.id.clone();
            let this = self.clone();
            let finished_compactable = compactable.clone();
            let service = self.service.clone();
            let rate_limiter = self.rate_limiter.clone();
            debug!(
                "Starting internal compaction [executor={}] [extent={}]",
                executor_id, extent
            );
            // detached; completion is observed through the cleanup fn
            let _ = spawn_bg_task(
                &self.handle,
                move |result: &Result<(), Error>| {
                    if let Err(e) = result {
                        warn!(
                            "Internal compaction failed [executor={}] [extent={}] [error={}]",
                            executor_id, extent, e
                        );
                    }
                    {
                        let mut state = this.state.lock();
                        state.running -= 1;
                        this.pump(&mut state);
                    }
                    (notifier)(finished_compactable);
                },
                async move { compactable.compact(service, job, rate_limiter).await },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{await_condition, TestCompactable};
    use crate::types::CompactionKind;
    use crate::clock::DefaultSystemClock;

    fn executor(num_threads: usize) -> InternalExecutor {
        let service = ServiceId::new("default");
        InternalExecutor::new(
            ExecutorId::internal(service.clone(), "e1"),
            service,
            num_threads,
            tokio::runtime::Handle::current(),
            Arc::new(RateLimiter::new(0, Arc::new(DefaultSystemClock::new()))),
        )
    }

    fn job(compactable: &TestCompactable, priority: i16) -> CompactionJob {
        CompactionJob {
            kind: CompactionKind::System,
            extent: compactable.extent_value(),
            priority,
            executor: ExecutorId::internal(ServiceId::new("default"), "e1"),
            files: Vec::new(),
        }
    }

    fn noop_notifier() -> CompletionNotifier {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_submit_runs_job_and_notifies() {
        let executor = executor(1);
        let compactable = Arc::new(TestCompactable::new("t1"));
        let notified = Arc::new(AtomicBool::new(false));
        let notified_flag = notified.clone();

        executor.submit(
            job(&compactable, 1),
            compactable.clone(),
            Arc::new(move |_| notified_flag.store(true, SeqCst)),
        );

        await_condition(Duration::from_secs(5), || {
            notified.load(SeqCst) && executor.running() == 0
        })
        .await;
        assert_eq!(compactable.compacted().len(), 1);
        assert_eq!(executor.queued(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_num_threads() {
        let executor = executor(1);
        let slow = Arc::new(TestCompactable::new("t1"));
        slow.hold_compactions();
        let other = Arc::new(TestCompactable::new("t2"));

        executor.submit(job(&slow, 5), slow.clone(), noop_notifier());
        executor.submit(job(&other, 1), other.clone(), noop_notifier());

        await_condition(Duration::from_secs(5), || executor.running() == 1).await;
        assert_eq!(executor.queued(), 1);
        assert!(executor.is_queued(&other.extent_value()));

        slow.release_compactions();
        await_condition(Duration::from_secs(5), || {
            other.compacted().len() == 1 && executor.running() == 0
        })
        .await;
    }

    #[tokio::test]
    async fn test_reconfigure_grows_capacity() {
        let executor = executor(1);
        let a = Arc::new(TestCompactable::new("t1"));
        let b = Arc::new(TestCompactable::new("t2"));
        a.hold_compactions();
        b.hold_compactions();

        executor.submit(job(&a, 1), a.clone(), noop_notifier());
        executor.submit(job(&b, 1), b.clone(), noop_notifier());
        await_condition(Duration::from_secs(5), || executor.running() == 1).await;

        executor.reconfigure(2);
        await_condition(Duration::from_secs(5), || executor.running() == 2).await;

        a.release_compactions();
        b.release_compactions();
        await_condition(Duration::from_secs(5), || executor.running() == 0).await;
    }

    #[tokio::test]
    async fn test_canceled_jobs_are_not_run() {
        let executor = executor(1);
        let slow = Arc::new(TestCompactable::new("t1"));
        slow.hold_compactions();
        let canceled = Arc::new(TestCompactable::new("t2"));

        executor.submit(job(&slow, 5), slow.clone(), noop_notifier());
        executor.submit(job(&canceled, 1), canceled.clone(), noop_notifier());
        await_condition(Duration::from_secs(5), || executor.running() == 1).await;

        executor.cancel_for_extent(&canceled.extent_value());
        assert_eq!(executor.queued(), 0);

        slow.release_compactions();
        await_condition(Duration::from_secs(5), || executor.running() == 0).await;
        assert!(canceled.compacted().is_empty());
    }

    #[tokio::test]
    async fn test_stop_drops_queued_work() {
        let executor = executor(1);
        let slow = Arc::new(TestCompactable::new("t1"));
        slow.hold_compactions();
        let queued = Arc::new(TestCompactable::new("t2"));

        executor.submit(job(&slow, 5), slow.clone(), noop_notifier());
        executor.submit(job(&queued, 1), queued.clone(), noop_notifier());
        await_condition(Duration::from_secs(5), || executor.running() == 1).await;

        executor.stop();
        executor.stop();
        assert_eq!(executor.queued(), 0);

        // stopped executors reject new work
        executor.submit(job(&queued, 1), queued.clone(), noop_notifier());
        assert_eq!(executor.queued(), 0);

        slow.release_compactions();
        await_condition(Duration::from_secs(5), || executor.running() == 0).await;
        assert!(queued.compacted().is_empty());
    }
}
