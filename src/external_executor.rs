//! External compaction executors.
//!
//! An external executor is a named queue of job offers drained by
//! out-of-process compactor workers. Workers discover depth through queue
//! summaries and take work through reservation: the highest-priority live
//! offer at or above the requested priority is bound to the worker's
//! external compaction id.
//!
//! Executors are shared process-wide in an [`ExternalExecutorRegistry`];
//! services hold references to the ones their planner routes to, and the
//! registry drops executors no surviving service references after a reload.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::compactable::Compactable;
use crate::types::{
    CompactionJob, ExecutorId, ExternalCompactionId, ExternalCompactionJob, QueueSummary,
    ServiceId, TabletExtent,
};
use crate::utils::MonotonicSeq;

struct QueuedExternalJob {
    priority: i16,
    seq: u64,
    job: CompactionJob,
    service: ServiceId,
    compactable: Arc<dyn Compactable>,
    canceled: Arc<AtomicBool>,
}

impl QueuedExternalJob {
    fn is_canceled(&self) -> bool {
        self.canceled.load(SeqCst)
    }
}

impl PartialEq for QueuedExternalJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedExternalJob {}

impl PartialOrd for QueuedExternalJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedExternalJob {
    // max-heap: highest priority first, FIFO within a priority
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

pub(crate) struct ExternalCompactionExecutor {
    id: ExecutorId,
    seq: MonotonicSeq,
    queue: Mutex<std::collections::BinaryHeap<QueuedExternalJob>>,
}

impl ExternalCompactionExecutor {
    pub(crate) fn new(id: ExecutorId) -> Self {
        debug_assert!(id.is_external());
        Self {
            id,
            seq: MonotonicSeq::new(0),
            queue: Mutex::new(std::collections::BinaryHeap::new()),
        }
    }

    pub(crate) fn id(&self) -> &ExecutorId {
        &self.id
    }

    pub(crate) fn submit(
        &self,
        service: ServiceId,
        job: CompactionJob,
        compactable: Arc<dyn Compactable>,
    ) {
        let queued = QueuedExternalJob {
            priority: job.priority,
            seq: self.seq.next(),
            job,
            service,
            compactable,
            canceled: Arc::new(AtomicBool::new(false)),
        };
        self.queue.lock().push(queued);
    }

    /// Dequeues the best live offer with priority at or above `priority` and
    /// asks its tablet to bind `ecid`. Offers the tablet declines (files
    /// changed underneath, tablet closing) are discarded.
    pub(crate) fn reserve(
        &self,
        priority: i16,
        compactor_id: &str,
        ecid: ExternalCompactionId,
    ) -> Option<ExternalCompactionJob> {
        loop {
            let entry = {
                let mut queue = self.queue.lock();
                match queue.pop() {
                    None => return None,
                    Some(entry) if entry.priority < priority => {
                        queue.push(entry);
                        return None;
                    }
                    Some(entry) => entry,
                }
            };
            if entry.is_canceled() {
                continue;
            }
            match entry.compactable.reserve_external_compaction(
                &entry.service,
                &entry.job,
                compactor_id,
                ecid,
            ) {
                Some(job) => return Some(job),
                None => {
                    debug!(
                        "Discarding stale external job offer [executor={}] [extent={}]",
                        self.id, entry.job.extent
                    );
                }
            }
        }
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().iter().filter(|e| !e.is_canceled()).count()
    }

    pub(crate) fn is_queued(&self, extent: &TabletExtent) -> bool {
        self.queue
            .lock()
            .iter()
            .any(|e| !e.is_canceled() && e.job.extent == *extent)
    }

    pub(crate) fn cancel_for_extent(&self, extent: &TabletExtent) {
        for entry in self.queue.lock().iter() {
            if entry.job.extent == *extent {
                entry.canceled.store(true, SeqCst);
            }
        }
    }

    /// Live queue depth grouped by priority, for remote worker discovery.
    pub(crate) fn summaries(&self) -> Vec<QueueSummary> {
        let queue_name: Arc<str> = match &self.id {
            ExecutorId::External { queue } => queue.clone(),
            ExecutorId::Internal { .. } => unreachable!("external executor with internal id"),
        };
        let mut by_priority: BTreeMap<i16, usize> = BTreeMap::new();
        for entry in self.queue.lock().iter() {
            if !entry.is_canceled() {
                *by_priority.entry(entry.priority).or_default() += 1;
            }
        }
        by_priority
            .into_iter()
            .map(|(priority, queued)| QueueSummary {
                queue: queue_name.clone(),
                priority,
                queued,
            })
            .collect()
    }
}

/// Process-wide mapping from external executor id to executor, created on
/// first reference and retained while any service routes to it.
pub(crate) struct ExternalExecutorRegistry {
    executors: Mutex<HashMap<ExecutorId, Arc<ExternalCompactionExecutor>>>,
}

impl ExternalExecutorRegistry {
    pub(crate) fn new() -> Self {
        Self {
            executors: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get_or_create(&self, queue: &str) -> Arc<ExternalCompactionExecutor> {
        let id = ExecutorId::external(queue);
        self.executors
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ExternalCompactionExecutor::new(id)))
            .clone()
    }

    pub(crate) fn all(&self) -> Vec<Arc<ExternalCompactionExecutor>> {
        self.executors.lock().values().cloned().collect()
    }

    /// Drops executors not in `active`, called after a reload recomputes
    /// which executors surviving services still reference.
    pub(crate) fn retain(&self, active: &HashSet<ExecutorId>) {
        self.executors.lock().retain(|id, _| active.contains(id));
    }
}
