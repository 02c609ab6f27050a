//! The compaction manager.
//!
//! One manager runs per tablet-server process. It owns the scheduler loop
//! that decides when each tablet is offered for compaction, the set of
//! [`CompactionService`]s tablets route to, the registry of external
//! executors, and the authoritative table of external compactions this
//! server believes are running.
//!
//! The loop alternates between draining tablet change signals and a full
//! sweep of all tablets every `compaction.major.delay`. The sweep doubles as
//! reconciliation: external compaction ids no tablet still acknowledges are
//! orphans and are dropped. Every pass ends with a cheap configuration
//! check so property changes take effect without a restart; every failure
//! feeds a capped backoff so the loop never terminates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::instrument;

use crate::clock::SystemClock;
use crate::compactable::{Compactable, CompactableSource, CompletionNotifier};
use crate::config::{check_delay, CompactionConfig, ConfigSource, DeprecationWarner};
use crate::error::Error;
use crate::external_executor::ExternalExecutorRegistry;
use crate::manager::stats::ManagerStats;
use crate::planner::PlannerRegistry;
use crate::retry::RetryPolicy;
use crate::service::{CompactionService, ExternalExecutorLookup};
use crate::stats::StatRegistry;
use crate::types::{
    CompactionKind, ExecutorId, ExecutorKind, ExternalCompactionId, ExternalCompactionJob,
    ExternalExecutorMetric, QueueSummary, ServiceId, TabletExtent,
};
use crate::utils::spawn_bg_task;

/// Change signals tolerate duplicates and the sweep re-covers every tablet,
/// so overflow drops are safe.
const CHECK_QUEUE_CAPACITY: usize = 10_000;

/// Reload checks are rate limited to once a second unless forced.
const MIN_RELOAD_SPACING: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct RunningExternal {
    extent: TabletExtent,
    executor: ExecutorId,
}

struct ReloadState {
    current: CompactionConfig,
    last_check: std::time::SystemTime,
}

pub(crate) struct ManagerInner {
    compactables: Arc<dyn CompactableSource>,
    config_source: Arc<dyn ConfigSource>,
    planner_registry: Arc<PlannerRegistry>,
    clock: Arc<dyn SystemClock>,
    handle: tokio::runtime::Handle,
    services: RwLock<Arc<HashMap<ServiceId, Arc<CompactionService>>>>,
    external: Arc<ExternalExecutorRegistry>,
    running_external: Mutex<HashMap<ExternalCompactionId, RunningExternal>>,
    notifier: CompletionNotifier,
    max_time_between_checks: Duration,
    reload: Mutex<ReloadState>,
    warner: DeprecationWarner,
    stats: ManagerStats,
}

/// Handle owned by the tablet server. All remote-compactor entry points and
/// metric reads go through here; the scheduler loop runs as a background
/// task once [`CompactionManager::start`] is called.
pub struct CompactionManager {
    inner: Arc<ManagerInner>,
    check_rx: Mutex<Option<mpsc::Receiver<Arc<dyn Compactable>>>>,
}

impl CompactionManager {
    /// Builds the manager and its initial service set. A malformed startup
    /// configuration is fatal; an individual service that fails to construct
    /// is logged and skipped so one bad service does not prevent the others
    /// from starting.
    pub fn new(
        compactables: Arc<dyn CompactableSource>,
        config_source: Arc<dyn ConfigSource>,
        planner_registry: Arc<PlannerRegistry>,
        stat_registry: &StatRegistry,
        handle: tokio::runtime::Handle,
        clock: Arc<dyn SystemClock>,
    ) -> Result<Self, Error> {
        let warner = DeprecationWarner::new();
        let config = CompactionConfig::parse(config_source.as_ref(), &warner)?;
        let max_time_between_checks = check_delay(config_source.as_ref())?;

        let external = Arc::new(ExternalExecutorRegistry::new());
        let lookup: ExternalExecutorLookup = {
            let external = external.clone();
            Arc::new(move |queue| external.get_or_create(queue))
        };

        let mut services = HashMap::new();
        for (name, planner_name) in &config.planners {
            match CompactionService::new(
                ServiceId::new(name),
                planner_name,
                config.rate_limit(name),
                config.options_for(name),
                &planner_registry,
                handle.clone(),
                clock.clone(),
                lookup.clone(),
            ) {
                Ok(service) => {
                    services.insert(ServiceId::new(name), Arc::new(service));
                }
                Err(e) => error!(
                    "Failed to create compaction service {} with planner:{} options:{:?} [error={}]",
                    name,
                    planner_name,
                    config.options_for(name),
                    e
                ),
            }
        }

        let (check_tx, check_rx) = mpsc::channel(CHECK_QUEUE_CAPACITY);
        let notifier: CompletionNotifier = Arc::new(move |compactable: Arc<dyn Compactable>| {
            if check_tx.try_send(compactable).is_err() {
                debug!("Compactables check queue full, dropping signal");
            }
        });

        let last_check = clock.now();
        let inner = Arc::new(ManagerInner {
            compactables,
            config_source,
            planner_registry,
            clock,
            handle,
            services: RwLock::new(Arc::new(services)),
            external,
            running_external: Mutex::new(HashMap::new()),
            notifier,
            max_time_between_checks,
            reload: Mutex::new(ReloadState {
                current: config,
                last_check,
            }),
            warner,
            stats: ManagerStats::new(stat_registry),
        });
        stats::register_aggregates(stat_registry, &inner);

        Ok(Self {
            inner,
            check_rx: Mutex::new(Some(check_rx)),
        })
    }

    /// Launches the scheduler loop. Call once; the loop runs for the life of
    /// the process.
    pub fn start(&self) {
        let rx = self
            .check_rx
            .lock()
            .take()
            .expect("compaction manager already started");
        let inner = self.inner.clone();
        debug!("Started compaction manager");
        let _ = spawn_bg_task(
            &self.inner.handle,
            |result| {
                if let Err(e) = result {
                    error!("Compaction manager loop exited [error={}]", e);
                }
            },
            async move { run_loop(inner, rx).await },
        );
    }

    /// Signals that a tablet changed and should be re-evaluated promptly.
    pub fn compactable_changed(&self, compactable: Arc<dyn Compactable>) {
        (self.inner.notifier)(compactable);
    }

    /// Ids of the currently configured services.
    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.inner.services.read().keys().cloned().collect()
    }

    pub fn is_compaction_queued(&self, extent: &TabletExtent, services_used: &[ServiceId]) -> bool {
        let services = self.inner.services.read().clone();
        services_used
            .iter()
            .filter_map(|id| services.get(id))
            .any(|service| service.is_compaction_queued(extent))
    }

    pub fn compactions_running(&self) -> usize {
        self.inner.compactions_running()
    }

    pub fn compactions_queued(&self) -> usize {
        self.inner.compactions_queued()
    }

    /// Finds or creates the external executor for `queue` and tries to
    /// reserve its best offer at or above `priority` for the calling
    /// compactor. A successful reservation is recorded in the
    /// running-external table.
    pub fn reserve_external_compaction(
        &self,
        queue: &str,
        priority: i16,
        compactor_id: &str,
        ecid: ExternalCompactionId,
    ) -> Option<ExternalCompactionJob> {
        debug!(
            "Attempting to reserve external compaction [queue={}] [priority={}] [compactor={}]",
            queue, priority, compactor_id
        );
        let executor = self.inner.external.get_or_create(queue);
        let job = executor.reserve(priority, compactor_id, ecid)?;
        self.inner.running_external.lock().insert(
            job.ecid,
            RunningExternal {
                extent: job.extent.clone(),
                executor: executor.id().clone(),
            },
        );
        self.inner.stats.external_reservations.inc();
        debug!("Reserved external compaction [ecid={}]", job.ecid);
        Some(job)
    }

    /// Records an external compaction this server learned about through
    /// another path (e.g. tablet metadata on load).
    pub fn register_external_compaction(
        &self,
        ecid: ExternalCompactionId,
        extent: TabletExtent,
        executor: ExecutorId,
    ) {
        self.inner
            .running_external
            .lock()
            .insert(ecid, RunningExternal { extent, executor });
    }

    /// Forwards a completed external compaction to its tablet and drops the
    /// running entry. Unknown ids are a no-op; an extent that does not match
    /// the stored one is an invariant violation and nothing is mutated.
    #[instrument(level = "debug", skip_all, fields(ecid = %ecid))]
    pub fn commit_external_compaction(
        &self,
        ecid: ExternalCompactionId,
        extent: &TabletExtent,
        current_tablets: &HashMap<TabletExtent, Arc<dyn Compactable>>,
        file_size: u64,
        entries: u64,
    ) -> Result<(), Error> {
        let info = self.inner.checked_running_entry(ecid, extent)?;
        let Some(info) = info else {
            return Ok(());
        };
        if let Some(tablet) = current_tablets.get(&info.extent) {
            tablet.commit_external_compaction(ecid, file_size, entries);
            (self.inner.notifier)(tablet.clone());
        }
        self.inner.running_external.lock().remove(&ecid);
        self.inner.stats.external_commits.inc();
        Ok(())
    }

    /// Symmetric to [`Self::commit_external_compaction`] for failed jobs.
    #[instrument(level = "debug", skip_all, fields(ecid = %ecid))]
    pub fn external_compaction_failed(
        &self,
        ecid: ExternalCompactionId,
        extent: &TabletExtent,
        current_tablets: &HashMap<TabletExtent, Arc<dyn Compactable>>,
    ) -> Result<(), Error> {
        let info = self.inner.checked_running_entry(ecid, extent)?;
        let Some(info) = info else {
            return Ok(());
        };
        if let Some(tablet) = current_tablets.get(&info.extent) {
            tablet.external_compaction_failed(ecid);
            (self.inner.notifier)(tablet.clone());
        }
        self.inner.running_external.lock().remove(&ecid);
        self.inner.stats.external_failures.inc();
        Ok(())
    }

    /// Drops all scheduler state for a vanished tablet: its running-external
    /// entries and any work queued on the services it used.
    pub fn compactable_closed(
        &self,
        extent: &TabletExtent,
        services_used: &[ServiceId],
        ecids: &[ExternalCompactionId],
    ) {
        {
            let mut running = self.inner.running_external.lock();
            for ecid in ecids {
                running.remove(ecid);
            }
        }
        let services = self.inner.services.read().clone();
        for id in services_used {
            if let Some(service) = services.get(id) {
                service.compactable_closed(extent);
            }
        }
    }

    /// Queue depth by priority for every external executor, for remote
    /// compactor discovery.
    pub fn compaction_queue_summaries(&self) -> Vec<QueueSummary> {
        self.inner
            .external
            .all()
            .iter()
            .flat_map(|executor| executor.summaries())
            .collect()
    }

    /// One record per external executor that is registered or referenced by
    /// a running entry.
    pub fn external_metrics(&self) -> Vec<ExternalExecutorMetric> {
        self.inner.external_metrics()
    }

    #[cfg(test)]
    pub(crate) fn test_inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }
}

impl ManagerInner {
    /// Looks up a running entry and verifies the caller's extent matches the
    /// stored one. `Ok(None)` means the id is unknown.
    fn checked_running_entry(
        &self,
        ecid: ExternalCompactionId,
        extent: &TabletExtent,
    ) -> Result<Option<RunningExternal>, Error> {
        let info = self.running_external.lock().get(&ecid).cloned();
        match info {
            None => Ok(None),
            Some(info) if info.extent == *extent => Ok(Some(info)),
            Some(info) => Err(Error::ExtentMismatch {
                ecid,
                stored: info.extent,
                provided: extent.clone(),
            }),
        }
    }

    /// Sweeps every tablet: submit for all kinds and reconcile the
    /// running-external table. The snapshot of running ids is taken before
    /// the tablets are polled, so an id reserved mid-sweep is never treated
    /// as an orphan.
    pub(crate) fn check_all(&self, last: &mut Option<Arc<dyn Compactable>>) -> Result<(), Error> {
        let mut pending: HashSet<ExternalCompactionId> =
            self.running_external.lock().keys().copied().collect();
        for compactable in self.compactables.compactables() {
            *last = Some(compactable.clone());
            self.submit_compaction(&compactable)?;
            compactable.external_compaction_ids(&mut |ecid| {
                pending.remove(&ecid);
            });
        }
        // anything left is unknown to every tablet and can be dropped
        if !pending.is_empty() {
            let mut running = self.running_external.lock();
            for ecid in &pending {
                if running.remove(ecid).is_some() {
                    debug!("Removed orphaned external compaction [ecid={}]", ecid);
                }
            }
        }
        Ok(())
    }

    /// Submits one tablet to each of its configured services, one per
    /// compaction kind. An unknown service forces a config check (the
    /// tablet's choice may be newly added); if still unknown the tablet
    /// falls back to the default service, and if that is also absent the
    /// kind is skipped.
    pub(crate) fn submit_compaction(&self, compactable: &Arc<dyn Compactable>) -> Result<(), Error> {
        for kind in CompactionKind::ALL {
            let csid = compactable.configured_service(kind)?;
            let mut services = self.services.read().clone();
            let mut service = services.get(&csid).cloned();
            if service.is_none() {
                self.check_for_config_changes(true);
                services = self.services.read().clone();
                service = services.get(&csid).cloned();
                if service.is_none() {
                    error!(
                        "Tablet {} returned non-existent compaction service {} for kind {}. Check \
                         the table compaction dispatcher configuration. Attempting to fall back \
                         to the default service.",
                        compactable.extent(),
                        csid,
                        kind
                    );
                    service = services.get(&ServiceId::default_service()).cloned();
                }
            }
            if let Some(service) = service {
                service.submit(kind, compactable.clone(), self.notifier.clone())?;
            }
        }
        Ok(())
    }

    /// Rebuilds the configuration and applies any change. Guarded by the
    /// reload mutex; skipped unless forced or a second has passed. On
    /// failure the previous configuration stays in effect: either the whole
    /// new service map is published or none of it.
    pub(crate) fn check_for_config_changes(&self, force: bool) {
        let mut reload = self.reload.lock();
        let now = self.clock.now();
        let since_last = now
            .duration_since(reload.last_check)
            .unwrap_or_default();
        if !force && since_last < MIN_RELOAD_SPACING {
            return;
        }
        reload.last_check = now;

        if let Err(e) = self.reload_config(&mut reload) {
            error!("Failed to reconfigure compaction services [error={}]", e);
        }
    }

    fn reload_config(&self, reload: &mut ReloadState) -> Result<(), Error> {
        let new_config = CompactionConfig::parse(self.config_source.as_ref(), &self.warner)?;
        if new_config == reload.current {
            return Ok(());
        }
        debug!("Compaction service configuration changed, reconfiguring");

        let lookup: ExternalExecutorLookup = {
            let external = self.external.clone();
            Arc::new(move |queue| external.get_or_create(queue))
        };

        let old_services = self.services.read().clone();
        let mut new_services = HashMap::new();
        for (name, planner_name) in &new_config.planners {
            let csid = ServiceId::new(name);
            match old_services.get(&csid) {
                Some(service) => {
                    service
                        .configuration_changed(
                            planner_name,
                            new_config.rate_limit(name),
                            &new_config.options_for(name),
                            &self.planner_registry,
                        )
                        .map_err(|e| {
                            Error::config(format!(
                                "Failed to update compaction service {} with planner:{}: {}",
                                name, planner_name, e
                            ))
                        })?;
                    new_services.insert(csid, service.clone());
                }
                None => {
                    let service = CompactionService::new(
                        csid.clone(),
                        planner_name,
                        new_config.rate_limit(name),
                        new_config.options_for(name),
                        &self.planner_registry,
                        self.handle.clone(),
                        self.clock.clone(),
                        lookup.clone(),
                    )
                    .map_err(|e| {
                        Error::config(format!(
                            "Failed to create compaction service {} with planner:{}: {}",
                            name, planner_name, e
                        ))
                    })?;
                    new_services.insert(csid, Arc::new(service));
                }
            }
        }

        for name in reload.current.planners.keys() {
            if !new_config.planners.contains_key(name) {
                if let Some(service) = old_services.get(&ServiceId::new(name)) {
                    service.stop();
                }
            }
        }

        *self.services.write() = Arc::new(new_services);

        // drop external executors no surviving service references
        let mut active = HashSet::new();
        for service in self.services.read().values() {
            service.external_executors_in_use(&mut |id| {
                active.insert(id.clone());
            });
        }
        self.external.retain(&active);

        reload.current = new_config;
        Ok(())
    }

    pub(crate) fn compactions_running(&self) -> usize {
        let services = self.services.read().clone();
        let internal: usize = services
            .values()
            .map(|s| s.compactions_running(ExecutorKind::Internal))
            .sum();
        internal + self.running_external.lock().len()
    }

    pub(crate) fn compactions_queued(&self) -> usize {
        let services = self.services.read().clone();
        let internal: usize = services
            .values()
            .map(|s| s.compactions_queued(ExecutorKind::Internal))
            .sum();
        let external: usize = self.external.all().iter().map(|e| e.queued()).sum();
        internal + external
    }

    pub(crate) fn external_metrics(&self) -> Vec<ExternalExecutorMetric> {
        let mut metrics: HashMap<ExecutorId, ExternalExecutorMetric> = self
            .external
            .all()
            .iter()
            .map(|executor| {
                (
                    executor.id().clone(),
                    ExternalExecutorMetric {
                        executor: executor.id().clone(),
                        queued: executor.queued(),
                        running: 0,
                    },
                )
            })
            .collect();
        for info in self.running_external.lock().values() {
            metrics
                .entry(info.executor.clone())
                .or_insert_with(|| ExternalExecutorMetric {
                    executor: info.executor.clone(),
                    queued: 0,
                    running: 0,
                })
                .running += 1;
        }
        metrics.into_values().collect()
    }
}

async fn run_loop(
    inner: Arc<ManagerInner>,
    mut rx: mpsc::Receiver<Arc<dyn Compactable>>,
) -> Result<(), Error> {
    let mut last_check_all = inner.clock.now();
    let increment = std::cmp::max(
        Duration::from_millis(1),
        inner.max_time_between_checks / 10,
    );
    let mut retry = RetryPolicy::new(increment, increment, inner.max_time_between_checks);
    let mut last: Option<Arc<dyn Compactable>> = None;

    loop {
        let pass: Result<(), Error> = {
            let elapsed = inner
                .clock
                .now()
                .duration_since(last_check_all)
                .unwrap_or_default();
            if elapsed >= inner.max_time_between_checks {
                let result = inner.check_all(&mut last);
                if result.is_ok() {
                    last_check_all = inner.clock.now();
                }
                result
            } else {
                let remaining = inner.max_time_between_checks - elapsed;
                tokio::select! {
                    biased;
                    received = rx.recv() => match received {
                        Some(compactable) => {
                            last = Some(compactable.clone());
                            inner.submit_compaction(&compactable)
                        }
                        // the manager holds a sender, so this only happens
                        // if it is dropped mid-shutdown
                        None => {
                            warn!("Compactables check queue closed");
                            inner.clock.sleep(remaining).await;
                            Ok(())
                        }
                    },
                    _ = inner.clock.sleep(remaining) => Ok(()),
                }
            }
        };

        match pass {
            Ok(()) => {
                last = None;
                if retry.has_retried() {
                    retry = RetryPolicy::new(increment, increment, inner.max_time_between_checks);
                }
                inner.check_for_config_changes(false);
            }
            Err(e) => {
                retry.use_retry();
                let extent = last.as_ref().map(|c| c.extent());
                retry
                    .wait_for_next_attempt(inner.clock.as_ref(), extent.as_ref(), &e)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::DefaultSystemClock;
    use crate::config::{COMPACTION_CHECK_DELAY, DEPRECATED_MAX_CONCURRENT};
    use crate::stats::StatRegistry;
    use crate::test_utils::{
        await_condition, TestCompactable, TestCompactableSource, TestConfigSource,
    };

    struct Fixture {
        manager: CompactionManager,
        tablets: Arc<TestCompactableSource>,
        config: Arc<TestConfigSource>,
        registry: Arc<StatRegistry>,
    }

    fn fixture(config: TestConfigSource) -> Fixture {
        let tablets = Arc::new(TestCompactableSource::new());
        let config = Arc::new(config);
        let registry = Arc::new(StatRegistry::new());
        let manager = CompactionManager::new(
            tablets.clone(),
            config.clone(),
            Arc::new(PlannerRegistry::new()),
            &registry,
            tokio::runtime::Handle::current(),
            Arc::new(DefaultSystemClock::new()),
        )
        .unwrap();
        Fixture {
            manager,
            tablets,
            config,
            registry,
        }
    }

    fn internal_config() -> TestConfigSource {
        TestConfigSource::new()
            .with("compaction.service.default.planner", "default")
            .with(
                "compaction.service.default.planner.opts.executors",
                "[{\"name\":\"e1\",\"numThreads\":2}]",
            )
    }

    fn external_config() -> TestConfigSource {
        TestConfigSource::new()
            .with("compaction.service.default.planner", "default")
            .with(
                "compaction.service.default.planner.opts.executors",
                "[{\"name\":\"big\",\"queue\":\"q1\"}]",
            )
    }

    fn add_service(config: &TestConfigSource, name: &str) {
        config.set(
            &format!("compaction.service.{}.planner", name),
            "default",
        );
        config.set(
            &format!("compaction.service.{}.planner.opts.executors", name),
            "[{\"name\":\"e1\",\"numThreads\":1}]",
        );
    }

    fn as_compactable(tablet: &Arc<TestCompactable>) -> Arc<dyn Compactable> {
        tablet.clone()
    }

    fn tablet_map(tablet: &Arc<TestCompactable>) -> HashMap<TabletExtent, Arc<dyn Compactable>> {
        let mut map = HashMap::new();
        map.insert(tablet.extent_value(), as_compactable(tablet));
        map
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_change_signal_routes_and_runs() {
        // given: a default service with one internal executor
        let fixture = fixture(internal_config().with(COMPACTION_CHECK_DELAY, "60s"));
        let tablet = Arc::new(TestCompactable::new("t1").with_candidates(&[10, 10, 10]));
        fixture.tablets.add(as_compactable(&tablet));
        fixture.manager.start();

        // when: the tablet signals a change
        fixture.manager.compactable_changed(as_compactable(&tablet));

        // then: the job runs on the internal executor and the tablet is
        // re-checked promptly after completion. One submission checks files
        // for every kind, so a second round of calls is the completion
        // notifier at work (the next sweep is a minute away).
        await_condition(Duration::from_secs(5), || tablet.compacted().len() == 1).await;
        let kinds = CompactionKind::ALL.len();
        await_condition(Duration::from_secs(5), || {
            tablet.files_calls() >= 2 * kinds && fixture.manager.compactions_running() == 0
        })
        .await;
        assert_eq!(fixture.manager.compactions_queued(), 0);
        assert_eq!(
            fixture
                .registry
                .lookup(stats::QUEUED_COMPACTIONS)
                .unwrap()
                .get(),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_service_falls_back_to_default() {
        let fixture = fixture(internal_config());
        let tablet = Arc::new(
            TestCompactable::new("t1")
                .with_service(CompactionKind::System, "custom")
                .with_candidates(&[10, 10, 10]),
        );

        fixture
            .manager
            .test_inner()
            .submit_compaction(&as_compactable(&tablet))
            .unwrap();

        await_condition(Duration::from_secs(5), || tablet.compacted().len() == 1).await;
    }

    #[tokio::test]
    async fn test_external_reserve_commit_lifecycle() {
        let fixture = fixture(external_config());
        let tablet = Arc::new(TestCompactable::new("t1").with_candidates(&[10, 10, 10]));
        fixture
            .manager
            .test_inner()
            .submit_compaction(&as_compactable(&tablet))
            .unwrap();
        assert_eq!(fixture.manager.compactions_queued(), 1);

        // reserve binds the offer and records it as running
        let ecid = ExternalCompactionId::generate();
        let job = fixture
            .manager
            .reserve_external_compaction("q1", 0, "c-1", ecid)
            .unwrap();
        assert_eq!(job.extent, tablet.extent_value());
        assert_eq!(fixture.manager.compactions_queued(), 0);
        assert_eq!(fixture.manager.compactions_running(), 1);
        let metrics = fixture.manager.external_metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].executor, ExecutorId::external("q1"));
        assert_eq!(metrics[0].running, 1);

        // a mismatched extent is an invariant violation and mutates nothing
        let wrong = TabletExtent::whole_table("other");
        let result = fixture.manager.commit_external_compaction(
            ecid,
            &wrong,
            &tablet_map(&tablet),
            1024,
            10,
        );
        assert!(matches!(result, Err(Error::ExtentMismatch { .. })));
        assert_eq!(fixture.manager.compactions_running(), 1);
        assert!(tablet.committed().is_empty());

        // a matching commit forwards to the tablet and drops the entry
        fixture
            .manager
            .commit_external_compaction(
                ecid,
                &tablet.extent_value(),
                &tablet_map(&tablet),
                1024,
                10,
            )
            .unwrap();
        assert_eq!(tablet.committed(), vec![(ecid, 1024, 10)]);
        assert_eq!(fixture.manager.compactions_running(), 0);

        // unknown ids are a no-op
        fixture
            .manager
            .commit_external_compaction(
                ecid,
                &tablet.extent_value(),
                &tablet_map(&tablet),
                1024,
                10,
            )
            .unwrap();
        assert_eq!(tablet.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_external_failure_notifies_tablet() {
        let fixture = fixture(external_config());
        let tablet = Arc::new(TestCompactable::new("t1").with_candidates(&[10, 10, 10]));
        fixture
            .manager
            .test_inner()
            .submit_compaction(&as_compactable(&tablet))
            .unwrap();
        let ecid = ExternalCompactionId::generate();
        fixture
            .manager
            .reserve_external_compaction("q1", 0, "c-1", ecid)
            .unwrap();

        fixture
            .manager
            .external_compaction_failed(ecid, &tablet.extent_value(), &tablet_map(&tablet))
            .unwrap();

        assert_eq!(tablet.failed(), vec![ecid]);
        assert_eq!(fixture.manager.compactions_running(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reconciles_orphaned_externals() {
        let fixture = fixture(internal_config());
        let tablet = Arc::new(TestCompactable::new("t1"));
        fixture.tablets.add(as_compactable(&tablet));

        // orphan: no tablet acknowledges it
        let orphan = ExternalCompactionId::generate();
        fixture.manager.register_external_compaction(
            orphan,
            tablet.extent_value(),
            ExecutorId::external("q1"),
        );
        // claimed: the tablet reports it during the sweep
        let claimed = ExternalCompactionId::generate();
        tablet.add_external_id(claimed);
        fixture.manager.register_external_compaction(
            claimed,
            tablet.extent_value(),
            ExecutorId::external("q1"),
        );

        let mut last = None;
        fixture.manager.test_inner().check_all(&mut last).unwrap();

        assert_eq!(fixture.manager.compactions_running(), 1);
        let metrics = fixture.manager.external_metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].running, 1);
    }

    #[tokio::test]
    async fn test_hot_reload_adds_and_removes_services() {
        let config = internal_config();
        add_service(&config, "s1");
        let fixture = fixture(config);
        let mut ids = fixture.manager.service_ids();
        ids.sort();
        assert_eq!(ids, vec![ServiceId::new("default"), ServiceId::new("s1")]);

        let s1 = fixture
            .manager
            .test_inner()
            .services
            .read()
            .get(&ServiceId::new("s1"))
            .cloned()
            .unwrap();

        // an in-flight job on a surviving service must not be lost
        let tablet = Arc::new(TestCompactable::new("t1").with_candidates(&[10, 10, 10]));
        tablet.hold_compactions();
        fixture
            .manager
            .test_inner()
            .submit_compaction(&as_compactable(&tablet))
            .unwrap();
        await_condition(Duration::from_secs(5), || {
            fixture.manager.compactions_running() == 1
        })
        .await;

        fixture
            .config
            .remove("compaction.service.s1.planner");
        fixture
            .config
            .remove("compaction.service.s1.planner.opts.executors");
        add_service(&fixture.config, "s2");
        fixture.manager.test_inner().check_for_config_changes(true);

        let mut ids = fixture.manager.service_ids();
        ids.sort();
        assert_eq!(ids, vec![ServiceId::new("default"), ServiceId::new("s2")]);
        assert!(s1.is_stopped());
        assert_eq!(fixture.manager.compactions_running(), 1);

        tablet.release_compactions();
        await_condition(Duration::from_secs(5), || tablet.compacted().len() == 1).await;
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous_config() {
        let fixture = fixture(internal_config());

        fixture
            .config
            .set("compaction.service.s1.planner", "no-such-planner");
        fixture.manager.test_inner().check_for_config_changes(true);

        assert_eq!(
            fixture.manager.service_ids(),
            vec![ServiceId::new("default")]
        );

        // fixing the configuration recovers on the next check
        fixture.config.remove("compaction.service.s1.planner");
        add_service(&fixture.config, "s1");
        fixture.manager.test_inner().check_for_config_changes(true);
        let mut ids = fixture.manager.service_ids();
        ids.sort();
        assert_eq!(ids, vec![ServiceId::new("default"), ServiceId::new("s1")]);
    }

    #[tokio::test]
    async fn test_reload_retains_only_referenced_external_executors() {
        let fixture = fixture(external_config());
        let tablet = Arc::new(TestCompactable::new("t1").with_candidates(&[10, 10, 10]));
        fixture
            .manager
            .test_inner()
            .submit_compaction(&as_compactable(&tablet))
            .unwrap();
        assert_eq!(fixture.manager.compaction_queue_summaries().len(), 1);

        // reroute the default service to an internal executor; q1 is no
        // longer referenced by any service
        fixture.config.set(
            "compaction.service.default.planner.opts.executors",
            "[{\"name\":\"e1\",\"numThreads\":1}]",
        );
        fixture.manager.test_inner().check_for_config_changes(true);

        assert!(fixture.manager.compaction_queue_summaries().is_empty());
        assert!(fixture.manager.external_metrics().is_empty());
    }

    #[tokio::test]
    async fn test_deprecated_max_concurrent_bootstraps_default_service() {
        let fixture = fixture(TestConfigSource::new().with(DEPRECATED_MAX_CONCURRENT, "4"));
        assert_eq!(
            fixture.manager.service_ids(),
            vec![ServiceId::new("default")]
        );

        let tablet = Arc::new(TestCompactable::new("t1").with_candidates(&[10, 10, 10]));
        fixture
            .manager
            .test_inner()
            .submit_compaction(&as_compactable(&tablet))
            .unwrap();
        await_condition(Duration::from_secs(5), || tablet.compacted().len() == 1).await;
    }

    #[tokio::test]
    async fn test_startup_rejects_malformed_config() {
        let tablets = Arc::new(TestCompactableSource::new());
        let config = Arc::new(TestConfigSource::new().with("compaction.service.x.bogus", "1"));
        let registry = Arc::new(StatRegistry::new());
        let result = CompactionManager::new(
            tablets,
            config,
            Arc::new(PlannerRegistry::new()),
            &registry,
            tokio::runtime::Handle::current(),
            Arc::new(DefaultSystemClock::new()),
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_survives_failing_tablet() {
        // short delay so retry sleeps stay small
        let fixture = fixture(internal_config().with(COMPACTION_CHECK_DELAY, "500ms"));
        let tablet = Arc::new(TestCompactable::new("t1").with_candidates(&[10, 10, 10]));
        tablet.fail_files_calls(true);
        fixture.tablets.add(as_compactable(&tablet));
        fixture.manager.start();

        fixture.manager.compactable_changed(as_compactable(&tablet));
        // let the loop hit the failure and back off at least once
        await_condition(Duration::from_secs(5), || tablet.files_calls() >= 1).await;

        tablet.fail_files_calls(false);
        fixture.manager.compactable_changed(as_compactable(&tablet));
        await_condition(Duration::from_secs(10), || tablet.compacted().len() == 1).await;
    }

    #[tokio::test]
    async fn test_compactable_closed_drops_state() {
        let fixture = fixture(external_config());
        let tablet = Arc::new(TestCompactable::new("t1").with_candidates(&[10, 10, 10]));
        fixture
            .manager
            .test_inner()
            .submit_compaction(&as_compactable(&tablet))
            .unwrap();
        let ecid = ExternalCompactionId::generate();
        fixture.manager.register_external_compaction(
            ecid,
            tablet.extent_value(),
            ExecutorId::external("q1"),
        );

        fixture.manager.compactable_closed(
            &tablet.extent_value(),
            &[ServiceId::default_service()],
            &[ecid],
        );

        assert_eq!(fixture.manager.compactions_running(), 0);
        assert_eq!(fixture.manager.compactions_queued(), 0);
        assert!(!fixture
            .manager
            .is_compaction_queued(&tablet.extent_value(), &[ServiceId::default_service()]));
    }
}

pub mod stats {
    //! Manager metrics, registered in the process [`StatRegistry`].

    use std::sync::Arc;

    use crate::stats::{Counter, StatRegistry, SuppliedStat};

    use super::ManagerInner;

    macro_rules! manager_stat_name {
        ($suffix:expr) => {
            crate::stat_name!("compaction_manager", $suffix)
        };
    }

    /// Internal compactions running plus the size of the running-external
    /// table, computed at read time.
    pub const RUNNING_COMPACTIONS: &str = manager_stat_name!("running_compactions");
    /// Jobs queued on internal executors plus external queues, computed at
    /// read time.
    pub const QUEUED_COMPACTIONS: &str = manager_stat_name!("queued_compactions");
    pub const EXTERNAL_RESERVATIONS: &str = manager_stat_name!("external_reservations");
    pub const EXTERNAL_COMMITS: &str = manager_stat_name!("external_commits");
    pub const EXTERNAL_FAILURES: &str = manager_stat_name!("external_failures");

    pub(crate) struct ManagerStats {
        pub(crate) external_reservations: Arc<Counter>,
        pub(crate) external_commits: Arc<Counter>,
        pub(crate) external_failures: Arc<Counter>,
    }

    impl ManagerStats {
        pub(crate) fn new(registry: &StatRegistry) -> Self {
            let stats = Self {
                external_reservations: Arc::new(Counter::default()),
                external_commits: Arc::new(Counter::default()),
                external_failures: Arc::new(Counter::default()),
            };
            registry.register(EXTERNAL_RESERVATIONS, stats.external_reservations.clone());
            registry.register(EXTERNAL_COMMITS, stats.external_commits.clone());
            registry.register(EXTERNAL_FAILURES, stats.external_failures.clone());
            stats
        }
    }

    /// Registers the pull-model aggregates. They hold a weak reference so a
    /// dropped manager reads as zero rather than keeping the world alive.
    pub(crate) fn register_aggregates(registry: &StatRegistry, inner: &Arc<ManagerInner>) {
        let weak = Arc::downgrade(inner);
        registry.register(
            RUNNING_COMPACTIONS,
            Arc::new(SuppliedStat::new(move || {
                weak.upgrade().map_or(0, |i| i.compactions_running() as i64)
            })),
        );
        let weak = Arc::downgrade(inner);
        registry.register(
            QUEUED_COMPACTIONS,
            Arc::new(SuppliedStat::new(move || {
                weak.upgrade().map_or(0, |i| i.compactions_queued() as i64)
            })),
        );
    }
}
