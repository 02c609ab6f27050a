//! Planner hosting.
//!
//! The manager hosts planners, it does not define their policies. A planner
//! is registered under a name in a [`PlannerRegistry`]; a service's
//! `planner` property selects one by that name. At service (re)construction
//! the planner's `init` declares the executors it will route to through a
//! [`PlannerExecutorManager`], and from then on `make_plan` may only emit
//! jobs onto those executor ids.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::default_planner::DefaultPlanner;
use crate::error::Error;
use crate::types::{
    CompactableFile, CompactionJob, CompactionKind, ExecutorId, ServiceId, TabletExtent,
};

/// Registered name of the built-in planner, referenced by the deprecated
/// property synthesis.
pub const DEFAULT_PLANNER: &str = "default";

/// Lets a planner declare its executors during `init`. Internal executors
/// are created and owned by the service; external executors are shared
/// process-wide queues resolved by name.
pub trait PlannerExecutorManager {
    fn create_internal_executor(&mut self, name: &str, num_threads: usize) -> ExecutorId;

    fn external_executor(&mut self, queue: &str) -> ExecutorId;
}

pub struct PlannerInitParams<'a> {
    pub service: &'a ServiceId,
    pub options: &'a BTreeMap<String, String>,
    pub executors: &'a mut dyn PlannerExecutorManager,
}

pub struct PlanningParams<'a> {
    pub service: &'a ServiceId,
    pub kind: CompactionKind,
    pub extent: &'a TabletExtent,
    pub candidates: &'a [CompactableFile],
    pub compacting: &'a [CompactableFile],
}

/// What the planner decided: zero or more jobs, each routed to one of the
/// executors declared at `init`.
#[derive(Debug, Default)]
pub struct CompactionPlan {
    pub jobs: Vec<CompactionJob>,
}

/// Pluggable policy that selects files to merge. Implementations must be
/// cheap: `make_plan` runs on the scheduler loop.
pub trait CompactionPlanner: Send + Sync {
    fn init(&mut self, params: PlannerInitParams<'_>) -> Result<(), Error>;

    fn make_plan(&self, params: PlanningParams<'_>) -> Result<CompactionPlan, Error>;
}

pub type PlannerFactory = Arc<dyn Fn() -> Box<dyn CompactionPlanner> + Send + Sync>;

/// Maps registered planner names to factories. The built-in
/// [`DefaultPlanner`] is pre-registered under [`DEFAULT_PLANNER`].
pub struct PlannerRegistry {
    factories: RwLock<HashMap<String, PlannerFactory>>,
}

impl Default for PlannerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PlannerRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register(DEFAULT_PLANNER, Arc::new(|| Box::new(DefaultPlanner::new())));
        registry
    }

    pub fn register(&self, name: impl Into<String>, factory: PlannerFactory) {
        self.factories.write().insert(name.into(), factory);
    }

    pub(crate) fn create(&self, name: &str) -> Result<Box<dyn CompactionPlanner>, Error> {
        let factories = self.factories.read();
        let factory = factories.get(name).ok_or_else(|| Error::PlannerNotFound {
            name: name.to_string(),
        })?;
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_planner_is_preregistered() {
        let registry = PlannerRegistry::new();
        assert!(registry.create(DEFAULT_PLANNER).is_ok());
    }

    #[test]
    fn test_unknown_planner_is_an_error() {
        let registry = PlannerRegistry::new();
        assert!(matches!(
            registry.create("nope"),
            Err(Error::PlannerNotFound { .. })
        ));
    }
}
