//! Compaction service configuration.
//!
//! The tablet server's property store is exposed through [`ConfigSource`];
//! this module parses the `compaction.service.` keyspace into an immutable
//! [`CompactionConfig`] snapshot. Snapshots support value equality so the
//! manager can detect changes cheaply on its reload cadence.
//!
//! Key grammar under the prefix:
//!
//! ```text
//! compaction.service.<service>.planner = <registered planner name>
//! compaction.service.<service>.planner.opts.<opt> = <value>
//! compaction.service.<service>.rate.limit = <bytes, memory notation>
//! ```
//!
//! Any other shape under the prefix is a configuration error.
//!
//! Two deprecated properties are still honored: a "max concurrent" thread
//! count that synthesizes a default-service planner when no explicit default
//! service is configured, and a global throughput that provides the default
//! rate limit. The synthesis is isolated here so it can be deleted cleanly
//! when the deprecation cycle completes.

use std::collections::BTreeMap;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;

use crate::error::Error;
use crate::planner::DEFAULT_PLANNER;
use crate::types::DEFAULT_SERVICE;

/// Prefix of all compaction service properties.
pub const COMPACTION_SERVICE_PREFIX: &str = "compaction.service.";

/// Deprecated: maximum concurrent major compactions. Replaced by per-service
/// executor configuration.
pub const DEPRECATED_MAX_CONCURRENT: &str = "compaction.major.concurrent.max";

/// Deprecated: global compaction throughput. Replaced by per-service
/// `rate.limit`.
pub const DEPRECATED_THROUGHPUT: &str = "compaction.major.throughput";

/// Longest time between full sweeps of all tablets.
pub const COMPACTION_CHECK_DELAY: &str = "compaction.major.delay";

pub(crate) const DEFAULT_CHECK_DELAY: Duration = Duration::from_secs(10);

/// Rate limit applied to services with no explicit `rate.limit` when the
/// deprecated throughput is also unset. Zero means unlimited.
const DEFAULT_RATE_LIMIT: u64 = 0;

/// Read-only view of the process property store.
///
/// `properties_with_prefix` includes properties that only carry a default
/// value; `is_set` reports whether the property was explicitly set.
pub trait ConfigSource: Send + Sync {
    fn properties_with_prefix(&self, prefix: &str) -> BTreeMap<String, String>;

    fn get(&self, key: &str) -> Option<String>;

    fn is_set(&self, key: &str) -> bool;
}

/// Deduplicates deprecation warnings by message text so a warning is emitted
/// once per distinct condition rather than once per reload.
pub(crate) struct DeprecationWarner {
    last: Mutex<String>,
}

impl DeprecationWarner {
    pub(crate) fn new() -> Self {
        Self {
            last: Mutex::new(String::new()),
        }
    }

    fn warn_once(&self, msg: String) {
        let mut last = self.last.lock();
        if *last != msg {
            warn!("{}", msg);
            *last = msg;
        }
    }
}

/// Immutable snapshot of the compaction service configuration.
///
/// Equality compares `(planners, options, rate_limits)`; the default rate
/// limit is a fallback and deliberately excluded.
#[derive(Clone, Debug)]
pub(crate) struct CompactionConfig {
    pub(crate) planners: BTreeMap<String, String>,
    pub(crate) options: BTreeMap<String, BTreeMap<String, String>>,
    pub(crate) rate_limits: BTreeMap<String, u64>,
    pub(crate) default_rate_limit: u64,
}

impl PartialEq for CompactionConfig {
    fn eq(&self, other: &Self) -> bool {
        self.planners == other.planners
            && self.options == other.options
            && self.rate_limits == other.rate_limits
    }
}

impl Eq for CompactionConfig {}

impl CompactionConfig {
    pub(crate) fn parse(
        source: &dyn ConfigSource,
        warner: &DeprecationWarner,
    ) -> Result<Self, Error> {
        let configs = Self::effective_properties(source, warner);

        let mut planners = BTreeMap::new();
        let mut options: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut rate_limits = BTreeMap::new();

        for (prop, val) in &configs {
            let suffix = &prop[COMPACTION_SERVICE_PREFIX.len()..];
            let tokens: Vec<&str> = suffix.split('.').collect();
            match tokens[..] {
                [service, "planner"] => {
                    planners.insert(service.to_string(), val.clone());
                }
                [service, "planner", "opts", opt] => {
                    options
                        .entry(service.to_string())
                        .or_default()
                        .insert(opt.to_string(), val.clone());
                }
                [service, "rate", "limit"] => {
                    // An explicitly set limit always applies. A limit that is
                    // only present as a property default is dropped while the
                    // deprecated global throughput is set, so the throughput
                    // keeps providing the fallback.
                    if source.is_set(prop) || !source.is_set(DEPRECATED_THROUGHPUT) {
                        rate_limits.insert(service.to_string(), parse_memory_bytes(val)?);
                    }
                }
                _ => {
                    return Err(Error::config(format!(
                        "Malformed compaction service property {}",
                        prop
                    )));
                }
            }
        }

        let default_rate_limit = match source.get(DEPRECATED_THROUGHPUT) {
            Some(val) if source.is_set(DEPRECATED_THROUGHPUT) => parse_memory_bytes(&val)?,
            _ => DEFAULT_RATE_LIMIT,
        };

        let missing: Vec<&String> = options
            .keys()
            .filter(|svc| !planners.contains_key(*svc))
            .collect();
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "Incomplete compaction service definitions, missing planner for {:?}",
                missing
            )));
        }

        Ok(Self {
            planners,
            options,
            rate_limits,
            default_rate_limit,
        })
    }

    /// Returns the raw properties with the deprecated max-concurrent
    /// property mapped onto the default service when nothing was configured
    /// for it explicitly.
    fn effective_properties(
        source: &dyn ConfigSource,
        warner: &DeprecationWarner,
    ) -> BTreeMap<String, String> {
        let mut configs = source.properties_with_prefix(COMPACTION_SERVICE_PREFIX);

        if source.is_set(DEPRECATED_MAX_CONCURRENT) {
            let default_prefix = format!("{}{}.", COMPACTION_SERVICE_PREFIX, DEFAULT_SERVICE);
            let default_props_set = configs
                .keys()
                .any(|key| key.starts_with(&default_prefix) && source.is_set(key));

            if default_props_set {
                warner.warn_once(format!(
                    "The deprecated property {} was set. Properties with the prefix {} \
                     were also set, which replace the deprecated properties. The deprecated \
                     property was therefore ignored.",
                    DEPRECATED_MAX_CONCURRENT, default_prefix
                ));
            } else {
                let num_threads = source.get(DEPRECATED_MAX_CONCURRENT).unwrap_or_default();
                let synthesized = [
                    (
                        format!("{}planner", default_prefix),
                        DEFAULT_PLANNER.to_string(),
                    ),
                    (
                        format!("{}planner.opts.executors", default_prefix),
                        format!("[{{\"name\":\"deprecated\",\"numThreads\":{}}}]", num_threads),
                    ),
                ];
                warner.warn_once(format!(
                    "The deprecated property {} was set. Properties with the prefix {} \
                     were not set, these should replace the deprecated properties. The old \
                     properties were automatically mapped to the new properties in process \
                     creating : {:?}.",
                    DEPRECATED_MAX_CONCURRENT, default_prefix, synthesized
                ));
                configs.extend(synthesized);
            }
        }

        configs
    }

    pub(crate) fn rate_limit(&self, service: &str) -> u64 {
        self.rate_limits
            .get(service)
            .copied()
            .unwrap_or(self.default_rate_limit)
    }

    pub(crate) fn options_for(&self, service: &str) -> BTreeMap<String, String> {
        self.options.get(service).cloned().unwrap_or_default()
    }
}

/// Reads the full-sweep delay, falling back to the default when the property
/// is unset.
pub(crate) fn check_delay(source: &dyn ConfigSource) -> Result<Duration, Error> {
    match source.get(COMPACTION_CHECK_DELAY) {
        Some(val) => duration_str::parse(&val)
            .map_err(|e| Error::config(format!("Invalid {}: {}", COMPACTION_CHECK_DELAY, e))),
        None => Ok(DEFAULT_CHECK_DELAY),
    }
}

/// Parses memory notation: a non-negative integer with an optional B/K/M/G/T
/// suffix (binary multiples).
pub(crate) fn parse_memory_bytes(val: &str) -> Result<u64, Error> {
    let val = val.trim();
    if val.is_empty() {
        return Err(Error::config("Empty memory value".to_string()));
    }
    let (digits, multiplier) = match val.chars().last() {
        Some('B' | 'b') => (&val[..val.len() - 1], 1u64),
        Some('K' | 'k') => (&val[..val.len() - 1], 1u64 << 10),
        Some('M' | 'm') => (&val[..val.len() - 1], 1u64 << 20),
        Some('G' | 'g') => (&val[..val.len() - 1], 1u64 << 30),
        Some('T' | 't') => (&val[..val.len() - 1], 1u64 << 40),
        _ => (val, 1u64),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| Error::config(format!("Invalid memory value {}", val)))?;
    base.checked_mul(multiplier)
        .ok_or_else(|| Error::config(format!("Memory value overflows: {}", val)))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_utils::TestConfigSource;

    #[rstest]
    #[case("0", 0)]
    #[case("1024", 1024)]
    #[case("4B", 4)]
    #[case("2K", 2048)]
    #[case("3M", 3 * (1 << 20))]
    #[case("1G", 1 << 30)]
    #[case("1T", 1u64 << 40)]
    #[case("100m", 100 * (1 << 20))]
    fn test_parse_memory_bytes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_memory_bytes(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("ten")]
    #[case("1Q")]
    #[case("-5")]
    fn test_parse_memory_bytes_rejects(#[case] input: &str) {
        assert!(parse_memory_bytes(input).is_err());
    }

    #[test]
    fn test_parse_basic_service_definition() {
        let source = TestConfigSource::new()
            .with("compaction.service.default.planner", "default")
            .with(
                "compaction.service.default.planner.opts.executors",
                "[{\"name\":\"e1\",\"numThreads\":2}]",
            )
            .with("compaction.service.default.rate.limit", "100M");

        let cfg = CompactionConfig::parse(&source, &DeprecationWarner::new()).unwrap();

        assert_eq!(cfg.planners.get("default").unwrap(), "default");
        assert_eq!(
            cfg.options.get("default").unwrap().get("executors").unwrap(),
            "[{\"name\":\"e1\",\"numThreads\":2}]"
        );
        assert_eq!(cfg.rate_limit("default"), 100 * (1 << 20));
        assert_eq!(cfg.rate_limit("other"), 0);
    }

    #[test]
    fn test_malformed_property_is_rejected() {
        let source = TestConfigSource::new().with("compaction.service.default.bogus", "x");
        let result = CompactionConfig::parse(&source, &DeprecationWarner::new());
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_options_without_planner_are_rejected() {
        let source =
            TestConfigSource::new().with("compaction.service.cs1.planner.opts.executors", "[]");
        let result = CompactionConfig::parse(&source, &DeprecationWarner::new());
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_equality_ignores_default_rate_limit() {
        let source = TestConfigSource::new().with("compaction.service.cs1.planner", "default");
        let warner = DeprecationWarner::new();
        let a = CompactionConfig::parse(&source, &warner).unwrap();
        let b = CompactionConfig::parse(&source, &warner).unwrap();
        assert_eq!(a, b);

        let mut c = b.clone();
        c.default_rate_limit = 12345;
        assert_eq!(a, c);

        let different =
            TestConfigSource::new().with("compaction.service.cs2.planner", "default");
        let d = CompactionConfig::parse(&different, &warner).unwrap();
        assert_ne!(a, d);
    }

    #[test]
    fn test_deprecated_max_concurrent_synthesizes_default_service() {
        let source = TestConfigSource::new().with(DEPRECATED_MAX_CONCURRENT, "4");
        let cfg = CompactionConfig::parse(&source, &DeprecationWarner::new()).unwrap();

        assert_eq!(cfg.planners.get("default").unwrap(), DEFAULT_PLANNER);
        assert_eq!(
            cfg.options.get("default").unwrap().get("executors").unwrap(),
            "[{\"name\":\"deprecated\",\"numThreads\":4}]"
        );
    }

    #[test]
    fn test_explicit_default_service_wins_over_deprecated() {
        let source = TestConfigSource::new()
            .with(DEPRECATED_MAX_CONCURRENT, "4")
            .with("compaction.service.default.planner", "default")
            .with(
                "compaction.service.default.planner.opts.executors",
                "[{\"name\":\"e1\",\"numThreads\":8}]",
            );

        let cfg = CompactionConfig::parse(&source, &DeprecationWarner::new()).unwrap();

        assert_eq!(
            cfg.options.get("default").unwrap().get("executors").unwrap(),
            "[{\"name\":\"e1\",\"numThreads\":8}]"
        );
    }

    #[test]
    fn test_deprecated_throughput_provides_default_rate_limit() {
        let source = TestConfigSource::new()
            .with("compaction.service.cs1.planner", "default")
            .with(DEPRECATED_THROUGHPUT, "8M");
        let cfg = CompactionConfig::parse(&source, &DeprecationWarner::new()).unwrap();
        assert_eq!(cfg.default_rate_limit, 8 * (1 << 20));
        assert_eq!(cfg.rate_limit("cs1"), 8 * (1 << 20));
    }

    #[test]
    fn test_throughput_suppresses_defaulted_rate_limit() {
        // A rate limit present only as a property default is dropped while
        // the deprecated throughput is set; an explicitly set one survives.
        let source = TestConfigSource::new()
            .with("compaction.service.default.planner", "default")
            .with_default("compaction.service.default.rate.limit", "50M")
            .with(DEPRECATED_THROUGHPUT, "8M");
        let cfg = CompactionConfig::parse(&source, &DeprecationWarner::new()).unwrap();
        assert_eq!(cfg.rate_limit("default"), 8 * (1 << 20));

        let source = TestConfigSource::new()
            .with("compaction.service.default.planner", "default")
            .with("compaction.service.default.rate.limit", "50M")
            .with(DEPRECATED_THROUGHPUT, "8M");
        let cfg = CompactionConfig::parse(&source, &DeprecationWarner::new()).unwrap();
        assert_eq!(cfg.rate_limit("default"), 50 * (1 << 20));
    }

    #[test]
    fn test_check_delay_parses_duration() {
        let source = TestConfigSource::new().with(COMPACTION_CHECK_DELAY, "30s");
        assert_eq!(check_delay(&source).unwrap(), Duration::from_secs(30));
        assert_eq!(
            check_delay(&TestConfigSource::new()).unwrap(),
            DEFAULT_CHECK_DELAY
        );
    }
}
