//! Boundary traits between the scheduler and the storage engine.
//!
//! A [`Compactable`] is a tablet's view of itself as a participant in
//! compaction scheduling. The engine owns file sets, merging, and commit
//! semantics; the scheduler only decides when to ask, where to route, and
//! tracks what is running externally.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::rate_limiter::RateLimiter;
use crate::types::{
    CompactableFile, CompactionJob, CompactionKind, ExternalCompactionId, ExternalCompactionJob,
    ServiceId, TabletExtent,
};

/// Snapshot of a tablet's files relevant to planning one compaction kind.
#[derive(Clone, Debug, Default)]
pub struct CompactionFiles {
    /// Files eligible to be compacted right now.
    pub candidates: Vec<CompactableFile>,
    /// Files already being compacted, for planners that size against load.
    pub compacting: Vec<CompactableFile>,
}

/// Invoked when a job finishes so the manager re-evaluates the tablet
/// promptly instead of waiting for the next full sweep.
pub(crate) type CompletionNotifier = Arc<dyn Fn(Arc<dyn Compactable>) + Send + Sync>;

/// A tablet as seen by the compaction scheduler.
///
/// Fallible methods feed the scheduler loop's backoff when they fail; the
/// loop never terminates on a misbehaving tablet.
#[async_trait]
pub trait Compactable: Send + Sync {
    fn extent(&self) -> TabletExtent;

    /// Which compaction service this tablet routes the given kind to.
    fn configured_service(&self, kind: CompactionKind) -> Result<ServiceId, Error>;

    /// Candidate files for `(service, kind)`, or `None` when the tablet has
    /// nothing to offer (e.g. everything is already being compacted).
    /// Callers may ask repeatedly for the same kind; the tablet is the
    /// authority on what is still available.
    fn files(
        &self,
        service: &ServiceId,
        kind: CompactionKind,
    ) -> Result<Option<CompactionFiles>, Error>;

    /// Runs an internal compaction job to completion. Called from an
    /// internal executor worker; heavy I/O should throttle through the
    /// provided rate limiter.
    async fn compact(
        &self,
        service: ServiceId,
        job: CompactionJob,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<(), Error>;

    /// Binds a queued job to an external compaction id, returning the job
    /// descriptor for the remote compactor. Returns `None` when the job is
    /// no longer valid (files changed, tablet closing).
    fn reserve_external_compaction(
        &self,
        service: &ServiceId,
        job: &CompactionJob,
        compactor_id: &str,
        ecid: ExternalCompactionId,
    ) -> Option<ExternalCompactionJob>;

    /// Reports every external compaction id this tablet currently
    /// acknowledges as running.
    fn external_compaction_ids(&self, sink: &mut dyn FnMut(ExternalCompactionId));

    fn commit_external_compaction(&self, ecid: ExternalCompactionId, file_size: u64, entries: u64);

    fn external_compaction_failed(&self, ecid: ExternalCompactionId);
}

/// The live population of tablets on this server.
///
/// `compactables` returns a point-in-time snapshot; tablets loaded or
/// unloaded during a sweep are picked up by the next one.
pub trait CompactableSource: Send + Sync {
    fn compactables(&self) -> Vec<Arc<dyn Compactable>>;
}
