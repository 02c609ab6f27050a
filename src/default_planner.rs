//! The built-in compaction planner.
//!
//! Routes ratio-selected file sets onto a configured ladder of executors.
//! Options:
//!
//! * `executors` (required): JSON array of executor definitions, each either
//!   in-process (`{"name":"small","numThreads":4,"maxSize":"32M"}`) or an
//!   external queue (`{"name":"big","queue":"dc1q","maxSize":"1G"}`). At
//!   most one entry may omit `maxSize`; it takes everything the sized ones
//!   do not.
//! * `ratio` (default `3.0`): a system compaction is planned when the sum of
//!   a size-ascending prefix of candidates is at least `ratio` times its
//!   largest member, which keeps rewrite amplification logarithmic.

use serde::Deserialize;

use crate::config::parse_memory_bytes;
use crate::error::Error;
use crate::planner::{
    CompactionPlan, CompactionPlanner, PlannerInitParams, PlanningParams,
};
use crate::types::{CompactableFile, CompactionJob, CompactionKind, ExecutorId};

const DEFAULT_RATIO: f64 = 3.0;
const MIN_FILES_TO_COMPACT: usize = 2;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecutorDef {
    name: String,
    #[serde(rename = "numThreads")]
    num_threads: Option<usize>,
    queue: Option<String>,
    #[serde(rename = "maxSize")]
    max_size: Option<String>,
}

#[derive(Debug)]
struct PlannedExecutor {
    id: ExecutorId,
    max_size: Option<u64>,
}

pub struct DefaultPlanner {
    executors: Vec<PlannedExecutor>,
    ratio: f64,
}

impl Default for DefaultPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultPlanner {
    pub fn new() -> Self {
        Self {
            executors: Vec::new(),
            ratio: DEFAULT_RATIO,
        }
    }

    /// Size-ascending prefix selection: the largest prefix whose sum
    /// dominates its biggest file by `ratio`.
    fn select(&self, candidates: &[CompactableFile]) -> Vec<CompactableFile> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by_key(|f| f.size);

        let mut sum = 0u64;
        let mut best = 0;
        for (i, file) in sorted.iter().enumerate() {
            sum += file.size;
            if sum as f64 >= file.size as f64 * self.ratio {
                best = i + 1;
            }
        }
        if best < MIN_FILES_TO_COMPACT {
            return Vec::new();
        }
        sorted.truncate(best);
        sorted
    }

    /// Smallest executor whose cap fits the job, else the unbounded one.
    fn route(&self, job_size: u64) -> Option<&PlannedExecutor> {
        self.executors
            .iter()
            .filter(|e| e.max_size.map_or(true, |max| job_size <= max))
            .min_by_key(|e| e.max_size.unwrap_or(u64::MAX))
    }
}

impl CompactionPlanner for DefaultPlanner {
    fn init(&mut self, params: PlannerInitParams<'_>) -> Result<(), Error> {
        let raw = params.options.get("executors").ok_or_else(|| {
            Error::planner(format!(
                "Compaction service {} is missing the executors option",
                params.service
            ))
        })?;
        let defs: Vec<ExecutorDef> = serde_json::from_str(raw)
            .map_err(|e| Error::planner(format!("Invalid executors option {}: {}", raw, e)))?;
        if defs.is_empty() {
            return Err(Error::planner("executors option is empty".to_string()));
        }

        let mut executors = Vec::with_capacity(defs.len());
        for def in defs {
            let max_size = def.max_size.as_deref().map(parse_memory_bytes).transpose()?;
            let id = match (def.num_threads, def.queue) {
                (Some(num_threads), None) => params
                    .executors
                    .create_internal_executor(&def.name, num_threads),
                (None, Some(queue)) => params.executors.external_executor(&queue),
                _ => {
                    return Err(Error::planner(format!(
                        "Executor {} must set exactly one of numThreads or queue",
                        def.name
                    )));
                }
            };
            executors.push(PlannedExecutor { id, max_size });
        }
        if executors.iter().filter(|e| e.max_size.is_none()).count() > 1 {
            return Err(Error::planner(
                "At most one executor may omit maxSize".to_string(),
            ));
        }

        self.executors = executors;
        self.ratio = match params.options.get("ratio") {
            Some(r) => r
                .parse()
                .map_err(|_| Error::planner(format!("Invalid ratio {}", r)))?,
            None => DEFAULT_RATIO,
        };
        Ok(())
    }

    fn make_plan(&self, params: PlanningParams<'_>) -> Result<CompactionPlan, Error> {
        let selected = match params.kind {
            CompactionKind::System => self.select(params.candidates),
            // user, selector and chop compactions rewrite whatever the
            // tablet offered
            _ => params.candidates.to_vec(),
        };
        if selected.is_empty() {
            return Ok(CompactionPlan::default());
        }

        let job_size = selected.iter().map(|f| f.size).sum();
        let Some(executor) = self.route(job_size) else {
            return Ok(CompactionPlan::default());
        };

        // more accumulated files means the tablet is further behind
        let priority = (params.candidates.len() + params.compacting.len()).min(i16::MAX as usize);
        let job = CompactionJob {
            kind: params.kind,
            extent: params.extent.clone(),
            priority: priority as i16,
            executor: executor.id.clone(),
            files: selected,
        };
        Ok(CompactionPlan { jobs: vec![job] })
    }
}
