//! Compaction services.
//!
//! A service is a named grouping of a planner, the internal executors the
//! planner declared, references to the external executors it routes to, and
//! a byte-rate limit shared by its internal workers. The manager owns one
//! service per configured name and replaces the set atomically on reload;
//! individual services reconfigure in place so in-flight work survives.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::RwLock;

use crate::compactable::{Compactable, CompletionNotifier};
use crate::error::Error;
use crate::external_executor::ExternalCompactionExecutor;
use crate::internal_executor::InternalExecutor;
use crate::planner::{
    CompactionPlanner, PlannerExecutorManager, PlannerInitParams, PlannerRegistry, PlanningParams,
};
use crate::rate_limiter::RateLimiter;
use crate::clock::SystemClock;
use crate::types::{CompactionKind, ExecutorId, ExecutorKind, ServiceId, TabletExtent};

/// Resolves an external queue name to the shared process-wide executor.
pub(crate) type ExternalExecutorLookup =
    Arc<dyn Fn(&str) -> Arc<ExternalCompactionExecutor> + Send + Sync>;

/// Executors requested by a planner during `init`, before the service
/// materializes them.
#[derive(Default)]
struct RequestedExecutors {
    service: Option<ServiceId>,
    internal: Vec<(String, usize)>,
    external: Vec<String>,
}

impl PlannerExecutorManager for RequestedExecutors {
    fn create_internal_executor(&mut self, name: &str, num_threads: usize) -> ExecutorId {
        self.internal.push((name.to_string(), num_threads));
        ExecutorId::internal(self.service.clone().expect("service set"), name)
    }

    fn external_executor(&mut self, queue: &str) -> ExecutorId {
        self.external.push(queue.to_string());
        ExecutorId::external(queue)
    }
}

struct PlannerState {
    planner: Box<dyn CompactionPlanner>,
    planner_name: String,
    options: BTreeMap<String, String>,
}

struct Executors {
    internal: HashMap<ExecutorId, Arc<InternalExecutor>>,
    external: Vec<Arc<ExternalCompactionExecutor>>,
}

pub(crate) struct CompactionService {
    id: ServiceId,
    handle: tokio::runtime::Handle,
    rate_limiter: Arc<RateLimiter>,
    external_lookup: ExternalExecutorLookup,
    planner: RwLock<PlannerState>,
    executors: RwLock<Executors>,
    stopped: AtomicBool,
}

impl CompactionService {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ServiceId,
        planner_name: &str,
        rate_limit: u64,
        options: BTreeMap<String, String>,
        registry: &PlannerRegistry,
        handle: tokio::runtime::Handle,
        clock: Arc<dyn SystemClock>,
        external_lookup: ExternalExecutorLookup,
    ) -> Result<Self, Error> {
        let rate_limiter = Arc::new(RateLimiter::new(rate_limit, clock));
        let service = Self {
            id,
            handle,
            rate_limiter,
            external_lookup,
            // replaced by rebuild_planner below, before anything can observe it
            planner: RwLock::new(PlannerState {
                planner: registry.create(planner_name)?,
                planner_name: planner_name.to_string(),
                options: BTreeMap::new(),
            }),
            executors: RwLock::new(Executors {
                internal: HashMap::new(),
                external: Vec::new(),
            }),
            stopped: AtomicBool::new(false),
        };
        service.rebuild_planner(planner_name, &options, registry)?;
        debug!(
            "Created compaction service [service={}] [planner={}]",
            service.id, planner_name
        );
        Ok(service)
    }

    /// Asks the planner for jobs for this kind and routes them. The notifier
    /// fires when an internal job finishes so the manager re-checks the
    /// tablet promptly.
    pub(crate) fn submit(
        &self,
        kind: CompactionKind,
        compactable: Arc<dyn Compactable>,
        notifier: CompletionNotifier,
    ) -> Result<(), Error> {
        if self.stopped.load(SeqCst) {
            return Ok(());
        }
        let extent = compactable.extent();
        let Some(files) = compactable.files(&self.id, kind)? else {
            return Ok(());
        };
        if files.candidates.is_empty() {
            return Ok(());
        }

        let plan = {
            let planner = self.planner.read();
            planner.planner.make_plan(PlanningParams {
                service: &self.id,
                kind,
                extent: &extent,
                candidates: &files.candidates,
                compacting: &files.compacting,
            })?
        };

        let executors = self.executors.read();
        for job in plan.jobs {
            match &job.executor {
                ExecutorId::Internal { .. } => match executors.internal.get(&job.executor) {
                    Some(executor) => {
                        debug!(
                            "Queued internal compaction [service={}] [extent={}] [job={}]",
                            self.id, extent, job
                        );
                        executor.submit(job, compactable.clone(), notifier.clone());
                    }
                    None => error!(
                        "Planner for service {} routed job to unknown executor {}, dropping it",
                        self.id, job.executor
                    ),
                },
                ExecutorId::External { .. } => {
                    match executors.external.iter().find(|e| *e.id() == job.executor) {
                        Some(executor) => {
                            debug!(
                                "Queued external compaction [service={}] [extent={}] [job={}]",
                                self.id, extent, job
                            );
                            executor.submit(self.id.clone(), job, compactable.clone());
                        }
                        None => error!(
                            "Planner for service {} routed job to unknown executor {}, dropping it",
                            self.id, job.executor
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies new configuration in place. The rate limit always propagates;
    /// a planner or options change rebuilds the planner and reconciles the
    /// executor set, reusing executors that kept their name.
    pub(crate) fn configuration_changed(
        &self,
        planner_name: &str,
        rate_limit: u64,
        options: &BTreeMap<String, String>,
        registry: &PlannerRegistry,
    ) -> Result<(), Error> {
        self.rate_limiter.set_rate(rate_limit);
        {
            let planner = self.planner.read();
            if planner.planner_name == planner_name && planner.options == *options {
                return Ok(());
            }
        }
        self.rebuild_planner(planner_name, options, registry)
    }

    fn rebuild_planner(
        &self,
        planner_name: &str,
        options: &BTreeMap<String, String>,
        registry: &PlannerRegistry,
    ) -> Result<(), Error> {
        let mut planner = registry.create(planner_name)?;
        let mut requested = RequestedExecutors {
            service: Some(self.id.clone()),
            ..Default::default()
        };
        planner.init(PlannerInitParams {
            service: &self.id,
            options,
            executors: &mut requested,
        })?;

        let mut executors = self.executors.write();

        let mut internal = HashMap::with_capacity(requested.internal.len());
        for (name, num_threads) in requested.internal {
            let id = ExecutorId::internal(self.id.clone(), &name);
            let executor = match executors.internal.remove(&id) {
                Some(existing) => {
                    existing.reconfigure(num_threads);
                    existing
                }
                None => Arc::new(InternalExecutor::new(
                    id.clone(),
                    self.id.clone(),
                    num_threads,
                    self.handle.clone(),
                    self.rate_limiter.clone(),
                )),
            };
            internal.insert(id, executor);
        }
        // whatever is left was not requested by the new planner
        for removed in executors.internal.values() {
            removed.stop();
        }
        executors.internal = internal;
        executors.external = requested
            .external
            .iter()
            .map(|queue| (self.external_lookup)(queue))
            .collect();
        drop(executors);

        let mut state = self.planner.write();
        state.planner = planner;
        state.planner_name = planner_name.to_string();
        state.options = options.clone();
        Ok(())
    }

    /// Idempotent. Queued internal work is dropped and running jobs drain;
    /// references to shared external executors are released.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, SeqCst) {
            return;
        }
        let mut executors = self.executors.write();
        for executor in executors.internal.values() {
            executor.stop();
        }
        executors.external.clear();
        debug!("Stopped compaction service [service={}]", self.id);
    }

    pub(crate) fn is_compaction_queued(&self, extent: &TabletExtent) -> bool {
        let executors = self.executors.read();
        executors.internal.values().any(|e| e.is_queued(extent))
            || executors.external.iter().any(|e| e.is_queued(extent))
    }

    pub(crate) fn compactions_running(&self, kind: ExecutorKind) -> usize {
        match kind {
            ExecutorKind::Internal => {
                let executors = self.executors.read();
                executors.internal.values().map(|e| e.running()).sum()
            }
            // running externals are accounted by the manager's running table
            ExecutorKind::External => 0,
        }
    }

    pub(crate) fn compactions_queued(&self, kind: ExecutorKind) -> usize {
        let executors = self.executors.read();
        match kind {
            ExecutorKind::Internal => executors.internal.values().map(|e| e.queued()).sum(),
            ExecutorKind::External => executors.external.iter().map(|e| e.queued()).sum(),
        }
    }

    pub(crate) fn external_executors_in_use(&self, sink: &mut dyn FnMut(&ExecutorId)) {
        for executor in self.executors.read().external.iter() {
            sink(executor.id());
        }
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(SeqCst)
    }

    /// Drops pending state for a vanished tablet on every executor this
    /// service routes to.
    pub(crate) fn compactable_closed(&self, extent: &TabletExtent) {
        let executors = self.executors.read();
        for executor in executors.internal.values() {
            executor.cancel_for_extent(extent);
        }
        for executor in executors.external.iter() {
            executor.cancel_for_extent(extent);
        }
    }
}
