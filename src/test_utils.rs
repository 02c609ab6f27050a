use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::clock::SystemClock;
use crate::compactable::{Compactable, CompactableSource, CompactionFiles};
use crate::config::ConfigSource;
use crate::error::Error;
use crate::rate_limiter::RateLimiter;
use crate::types::{
    CompactableFile, CompactionJob, CompactionKind, ExternalCompactionId, ExternalCompactionJob,
    ServiceId, TabletExtent,
};

/// Polls `condition` until it holds, panicking after `timeout`.
pub(crate) async fn await_condition(timeout: Duration, condition: impl Fn() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Manual clock. `sleep` records the request, advances time, and returns
/// immediately, so backoff and rate-limit math is observable without
/// real waiting.
pub(crate) struct TestClock {
    now: Mutex<SystemTime>,
    sleeps: Mutex<Vec<Duration>>,
}

impl TestClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Mutex::new(UNIX_EPOCH),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += duration;
    }

    pub(crate) fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl SystemClock for TestClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Map-backed [`ConfigSource`] with interior mutability so tests can change
/// properties between reload checks.
pub(crate) struct TestConfigSource {
    props: Mutex<BTreeMap<String, String>>,
    defaults: Mutex<BTreeMap<String, String>>,
}

impl TestConfigSource {
    pub(crate) fn new() -> Self {
        Self {
            props: Mutex::new(BTreeMap::new()),
            defaults: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn with(self, key: &str, val: &str) -> Self {
        self.props.lock().insert(key.to_string(), val.to_string());
        self
    }

    /// Adds a property that is present with a default value but not
    /// explicitly set.
    pub(crate) fn with_default(self, key: &str, val: &str) -> Self {
        self.defaults
            .lock()
            .insert(key.to_string(), val.to_string());
        self
    }

    pub(crate) fn set(&self, key: &str, val: &str) {
        self.props.lock().insert(key.to_string(), val.to_string());
    }

    pub(crate) fn remove(&self, key: &str) {
        self.props.lock().remove(key);
    }
}

impl ConfigSource for TestConfigSource {
    fn properties_with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        let mut merged: BTreeMap<String, String> = self
            .defaults
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        merged.extend(
            self.props
                .lock()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }

    fn get(&self, key: &str) -> Option<String> {
        if let Some(val) = self.props.lock().get(key) {
            return Some(val.clone());
        }
        self.defaults.lock().get(key).cloned()
    }

    fn is_set(&self, key: &str) -> bool {
        self.props.lock().contains_key(key)
    }
}

struct TabletFiles {
    available: Vec<CompactableFile>,
    checked_out: bool,
}

/// A scriptable tablet. Files are handed out once per checkout so duplicate
/// change signals do not produce duplicate jobs, the way a real tablet
/// tracks files reserved for compaction.
pub(crate) struct TestCompactable {
    extent: TabletExtent,
    services: Mutex<HashMap<CompactionKind, ServiceId>>,
    kinds_with_files: Mutex<HashSet<CompactionKind>>,
    files: Mutex<TabletFiles>,
    external_ids: Mutex<HashSet<ExternalCompactionId>>,
    committed: Mutex<Vec<(ExternalCompactionId, u64, u64)>>,
    failed: Mutex<Vec<ExternalCompactionId>>,
    compacted: Mutex<Vec<CompactionJob>>,
    files_calls: AtomicUsize,
    decline: AtomicBool,
    fail_files: AtomicBool,
    held: watch::Sender<bool>,
}

impl TestCompactable {
    pub(crate) fn new(table: &str) -> Self {
        let mut kinds = HashSet::new();
        kinds.insert(CompactionKind::System);
        let (held, _) = watch::channel(false);
        Self {
            extent: TabletExtent::whole_table(table),
            services: Mutex::new(HashMap::new()),
            kinds_with_files: Mutex::new(kinds),
            files: Mutex::new(TabletFiles {
                available: Vec::new(),
                checked_out: false,
            }),
            external_ids: Mutex::new(HashSet::new()),
            committed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            compacted: Mutex::new(Vec::new()),
            files_calls: AtomicUsize::new(0),
            decline: AtomicBool::new(false),
            fail_files: AtomicBool::new(false),
            held,
        }
    }

    pub(crate) fn with_candidates(self, sizes: &[u64]) -> Self {
        self.set_candidates(sizes);
        self
    }

    pub(crate) fn with_service(self, kind: CompactionKind, service: &str) -> Self {
        self.services.lock().insert(kind, ServiceId::new(service));
        self
    }

    pub(crate) fn set_candidates(&self, sizes: &[u64]) {
        let mut files = self.files.lock();
        files.available = sizes
            .iter()
            .enumerate()
            .map(|(i, s)| CompactableFile::new(format!("f{}", i), *s))
            .collect();
        files.checked_out = false;
    }

    pub(crate) fn extent_value(&self) -> TabletExtent {
        self.extent.clone()
    }

    pub(crate) fn compacted(&self) -> Vec<CompactionJob> {
        self.compacted.lock().clone()
    }

    pub(crate) fn committed(&self) -> Vec<(ExternalCompactionId, u64, u64)> {
        self.committed.lock().clone()
    }

    pub(crate) fn failed(&self) -> Vec<ExternalCompactionId> {
        self.failed.lock().clone()
    }

    pub(crate) fn files_calls(&self) -> usize {
        self.files_calls.load(SeqCst)
    }

    pub(crate) fn decline_reservations(&self) {
        self.decline.store(true, SeqCst);
    }

    pub(crate) fn fail_files_calls(&self, fail: bool) {
        self.fail_files.store(fail, SeqCst);
    }

    pub(crate) fn add_external_id(&self, ecid: ExternalCompactionId) {
        self.external_ids.lock().insert(ecid);
    }

    /// Makes `compact` block until released.
    pub(crate) fn hold_compactions(&self) {
        self.held.send_replace(true);
    }

    pub(crate) fn release_compactions(&self) {
        self.held.send_replace(false);
    }
}

#[async_trait]
impl Compactable for TestCompactable {
    fn extent(&self) -> TabletExtent {
        self.extent.clone()
    }

    fn configured_service(&self, kind: CompactionKind) -> Result<ServiceId, Error> {
        Ok(self
            .services
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_else(ServiceId::default_service))
    }

    fn files(
        &self,
        _service: &ServiceId,
        kind: CompactionKind,
    ) -> Result<Option<CompactionFiles>, Error> {
        self.files_calls.fetch_add(1, SeqCst);
        if self.fail_files.load(SeqCst) {
            return Err(Error::Tablet {
                msg: "tablet unavailable".to_string(),
            });
        }
        if !self.kinds_with_files.lock().contains(&kind) {
            return Ok(None);
        }
        let mut files = self.files.lock();
        if files.checked_out || files.available.is_empty() {
            return Ok(None);
        }
        files.checked_out = true;
        Ok(Some(CompactionFiles {
            candidates: files.available.clone(),
            compacting: Vec::new(),
        }))
    }

    async fn compact(
        &self,
        _service: ServiceId,
        job: CompactionJob,
        _rate_limiter: Arc<RateLimiter>,
    ) -> Result<(), Error> {
        let mut rx = self.held.subscribe();
        rx.wait_for(|held| !*held).await.expect("watch closed");
        let mut files = self.files.lock();
        let compacted_names: HashSet<_> = job.files.iter().map(|f| f.name.clone()).collect();
        files.available.retain(|f| !compacted_names.contains(&f.name));
        files.checked_out = false;
        drop(files);
        self.compacted.lock().push(job);
        Ok(())
    }

    fn reserve_external_compaction(
        &self,
        _service: &ServiceId,
        job: &CompactionJob,
        _compactor_id: &str,
        ecid: ExternalCompactionId,
    ) -> Option<ExternalCompactionJob> {
        if self.decline.load(SeqCst) {
            return None;
        }
        self.external_ids.lock().insert(ecid);
        Some(ExternalCompactionJob {
            ecid,
            extent: self.extent.clone(),
            kind: job.kind,
            priority: job.priority,
            files: job.files.clone(),
        })
    }

    fn external_compaction_ids(&self, sink: &mut dyn FnMut(ExternalCompactionId)) {
        for ecid in self.external_ids.lock().iter() {
            sink(*ecid);
        }
    }

    fn commit_external_compaction(&self, ecid: ExternalCompactionId, file_size: u64, entries: u64) {
        self.committed.lock().push((ecid, file_size, entries));
        self.external_ids.lock().remove(&ecid);
        let mut files = self.files.lock();
        files.available.clear();
        files.checked_out = false;
    }

    fn external_compaction_failed(&self, ecid: ExternalCompactionId) {
        self.failed.lock().push(ecid);
        self.external_ids.lock().remove(&ecid);
        self.files.lock().checked_out = false;
    }
}

/// Mutable set of live tablets.
pub(crate) struct TestCompactableSource {
    tablets: Mutex<Vec<Arc<dyn Compactable>>>,
}

impl TestCompactableSource {
    pub(crate) fn new() -> Self {
        Self {
            tablets: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, compactable: Arc<dyn Compactable>) {
        self.tablets.lock().push(compactable);
    }
}

impl CompactableSource for TestCompactableSource {
    fn compactables(&self) -> Vec<Arc<dyn Compactable>> {
        self.tablets.lock().clone()
    }
}
