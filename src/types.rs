use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

/// Name of a configured compaction service. Tablets choose one per
/// compaction kind; the manager owns one [`crate::service::CompactionService`]
/// per id.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceId(Arc<str>);

/// The service every tablet falls back to when its configured service does
/// not exist.
pub const DEFAULT_SERVICE: &str = "default";

impl ServiceId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn default_service() -> Self {
        Self::new(DEFAULT_SERVICE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a worker group that runs compactions. Internal executors are
/// in-process thread groups owned by a service; external executors are named
/// queues drained by out-of-process compactors through reservation.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum ExecutorId {
    Internal { service: ServiceId, name: Arc<str> },
    External { queue: Arc<str> },
}

impl ExecutorId {
    pub fn internal(service: ServiceId, name: impl AsRef<str>) -> Self {
        Self::Internal {
            service,
            name: Arc::from(name.as_ref()),
        }
    }

    pub fn external(queue: impl AsRef<str>) -> Self {
        Self::External {
            queue: Arc::from(queue.as_ref()),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::External { .. })
    }

    /// Queue name for external ids, `None` for internal ones.
    pub fn queue(&self) -> Option<&str> {
        match self {
            Self::External { queue } => Some(queue),
            Self::Internal { .. } => None,
        }
    }
}

impl Display for ExecutorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal { service, name } => write!(f, "i:{}.{}", service, name),
            Self::External { queue } => write!(f, "e:{}", queue),
        }
    }
}

/// The closed set of reasons a compaction occurs. The manager evaluates
/// every kind for every tablet it checks.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CompactionKind {
    /// Routine maintenance driven by the planner.
    System,
    /// Driven by a configured selector (e.g. periodic re-selection).
    Selector,
    /// User-initiated.
    User,
    /// Splitting cleanup that chops files spanning tablet boundaries.
    Chop,
}

impl CompactionKind {
    pub const ALL: [CompactionKind; 4] = [
        CompactionKind::System,
        CompactionKind::Selector,
        CompactionKind::User,
        CompactionKind::Chop,
    ];
}

impl Display for CompactionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::Selector => "selector",
            Self::User => "user",
            Self::Chop => "chop",
        };
        write!(f, "{}", name)
    }
}

/// Whether a counter refers to in-process or reservation-queue executors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorKind {
    Internal,
    External,
}

/// Unique token identifying one external compaction. Minted by the remote
/// compactor that reserves the job and carried through commit/fail.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ExternalCompactionId(Uuid);

impl ExternalCompactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for ExternalCompactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ECID:{}", self.0)
    }
}

/// Identity of a tablet: a table plus the half-open row range the tablet
/// covers. Owned by the storage engine; referenced here by value.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TabletExtent {
    table: Arc<str>,
    prev_end_row: Option<Bytes>,
    end_row: Option<Bytes>,
}

impl TabletExtent {
    pub fn new(table: impl AsRef<str>, prev_end_row: Option<Bytes>, end_row: Option<Bytes>) -> Self {
        Self {
            table: Arc::from(table.as_ref()),
            prev_end_row,
            end_row,
        }
    }

    /// The whole-table extent, useful when a table has a single tablet.
    pub fn whole_table(table: impl AsRef<str>) -> Self {
        Self::new(table, None, None)
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Display for TabletExtent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn row(r: &Option<Bytes>) -> String {
            r.as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_else(|| "-inf/+inf".to_string())
        }
        write!(
            f,
            "{};({},{}]",
            self.table,
            row(&self.prev_end_row),
            row(&self.end_row)
        )
    }
}

/// One immutable data file of a tablet, as seen by planners. The engine owns
/// the file; planners only need identity and size.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CompactableFile {
    pub name: Arc<str>,
    pub size: u64,
}

impl CompactableFile {
    pub fn new(name: impl AsRef<str>, size: u64) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            size,
        }
    }
}

/// A compaction the planner decided to run: which files, at what priority,
/// on which executor.
#[derive(Clone, Debug)]
pub struct CompactionJob {
    pub kind: CompactionKind,
    pub extent: TabletExtent,
    pub priority: i16,
    pub executor: ExecutorId,
    pub files: Vec<CompactableFile>,
}

impl Display for CompactionJob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} files:{} priority:{} executor:{}",
            self.kind,
            self.extent,
            self.files.len(),
            self.priority,
            self.executor
        )
    }
}

/// Descriptor handed to a remote compactor when it reserves a job. Produced
/// by the tablet at reservation time so file lists are current.
#[derive(Clone, Debug)]
pub struct ExternalCompactionJob {
    pub ecid: ExternalCompactionId,
    pub extent: TabletExtent,
    pub kind: CompactionKind,
    pub priority: i16,
    pub files: Vec<CompactableFile>,
}

/// Queue depth at one priority level of an external executor, for remote
/// compactor discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSummary {
    pub queue: Arc<str>,
    pub priority: i16,
    pub queued: usize,
}

/// Per-external-executor counts returned by
/// [`crate::manager::CompactionManager::external_metrics`].
#[derive(Clone, Debug)]
pub struct ExternalExecutorMetric {
    pub executor: ExecutorId,
    pub queued: usize,
    pub running: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_id_display() {
        let internal = ExecutorId::internal(ServiceId::new("default"), "small");
        assert_eq!(format!("{}", internal), "i:default.small");
        let external = ExecutorId::external("q1");
        assert_eq!(format!("{}", external), "e:q1");
        assert!(external.is_external());
        assert_eq!(external.queue(), Some("q1"));
        assert_eq!(internal.queue(), None);
    }

    #[test]
    fn test_all_kinds_are_distinct() {
        for (i, a) in CompactionKind::ALL.iter().enumerate() {
            for b in CompactionKind::ALL.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_extent_equality_is_by_value() {
        let a = TabletExtent::new("t1", None, Some(Bytes::from_static(b"m")));
        let b = TabletExtent::new("t1", None, Some(Bytes::from_static(b"m")));
        let c = TabletExtent::new("t1", Some(Bytes::from_static(b"m")), None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
