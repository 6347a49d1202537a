use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};

use crate::aggregate::{MetricValues, TrendValues};

/// Tags attached to a sample, kept sorted so that equal tag sets compare and hash equally.
pub type Tags = BTreeMap<String, String>;

/// Names of the metrics that every run records.
pub mod builtin {
    use super::MetricKind;

    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const CHECKS: &str = "checks";
    pub const CHECK_FAILURE_RATE: &str = "check_failure_rate";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const AUTH_FLOW_DURATION: &str = "auth_flow_duration";

    pub const ALL: &[(&str, MetricKind)] = &[
        (HTTP_REQS, MetricKind::Counter),
        (HTTP_REQ_DURATION, MetricKind::Trend),
        (HTTP_REQ_FAILED, MetricKind::Rate),
        (CHECKS, MetricKind::Rate),
        (CHECK_FAILURE_RATE, MetricKind::Rate),
        (ITERATIONS, MetricKind::Counter),
        (ITERATION_DURATION, MetricKind::Trend),
        (AUTH_FLOW_DURATION, MetricKind::Trend),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic sum of increments.
    Counter,
    /// Ratio of non-zero samples to all samples.
    Rate,
    /// Distribution of values, such as durations in milliseconds.
    Trend,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Rate => write!(f, "rate"),
            MetricKind::Trend => write!(f, "trend"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("Metric [{name}] is already declared as a {existing}, cannot redeclare it as a {requested}")]
    KindConflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
}

/// Aggregated values for one metric across all of its tag sets.
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub values: MetricValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    tags: Tags,
}

#[derive(Debug)]
enum Samples {
    Counter(f64),
    Rate { non_zero: u64, total: u64 },
    Trend(TrendValues),
}

impl Samples {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Samples::Counter(0.0),
            MetricKind::Rate => Samples::Rate {
                non_zero: 0,
                total: 0,
            },
            MetricKind::Trend => Samples::Trend(TrendValues::new()),
        }
    }

    fn push(&mut self, value: f64) {
        match self {
            Samples::Counter(sum) => *sum += value,
            Samples::Rate { non_zero, total } => {
                *total += 1;
                if value != 0.0 {
                    *non_zero += 1;
                }
            }
            Samples::Trend(trend) => trend.record(value),
        }
    }
}

/// Merges shard samples for a metric before handing out a [MetricValues].
enum Accumulator {
    Counter(f64),
    Rate { non_zero: u64, total: u64 },
    Trend(TrendValues),
}

impl Accumulator {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Accumulator::Counter(0.0),
            MetricKind::Rate => Accumulator::Rate {
                non_zero: 0,
                total: 0,
            },
            MetricKind::Trend => Accumulator::Trend(TrendValues::new()),
        }
    }

    fn merge(&mut self, samples: &Samples) {
        match (self, samples) {
            (Accumulator::Counter(acc), Samples::Counter(sum)) => *acc += sum,
            (
                Accumulator::Rate { non_zero, total },
                Samples::Rate {
                    non_zero: n,
                    total: t,
                },
            ) => {
                *non_zero += n;
                *total += t;
            }
            (Accumulator::Trend(acc), Samples::Trend(trend)) => acc.merge(trend),
            _ => {}
        }
    }

    fn finish(self, elapsed_s: f64) -> MetricValues {
        match self {
            Accumulator::Counter(count) => MetricValues::Counter {
                count,
                rate: if elapsed_s > 0.0 {
                    count / elapsed_s
                } else {
                    0.0
                },
            },
            Accumulator::Rate { non_zero, total } => MetricValues::Rate {
                passes: non_zero,
                fails: total - non_zero,
            },
            Accumulator::Trend(trend) => MetricValues::Trend(trend),
        }
    }
}

const SHARD_COUNT: usize = 32;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn shard_index() -> usize {
    SHARD_HINT.with(|hint| match hint.get() {
        Some(index) => index,
        None => {
            let index = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
            hint.set(Some(index));
            index
        }
    })
}

/// Shared store for every sample recorded during a run.
///
/// Samples are appended to one of several shards, picked per thread, so workers recording at the
/// same time rarely wait on each other. Nothing is aggregated on the write path; readers merge the
/// shards when they ask for values.
#[derive(Debug)]
pub struct MetricsCollector {
    registry: RwLock<HashMap<String, MetricKind>>,
    shards: Vec<Mutex<HashMap<SeriesKey, Samples>>>,
    started: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// A collector with no declared metrics.
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            started: Instant::now(),
        }
    }

    /// A collector with the [builtin] metrics declared.
    pub fn with_builtin_metrics() -> Self {
        let collector = Self::new();
        {
            let mut registry = collector.registry.write();
            for (name, kind) in builtin::ALL {
                registry.insert(name.to_string(), *kind);
            }
        }
        collector
    }

    /// Declare a metric. Declaring the same metric twice with the same kind is allowed.
    pub fn declare(&self, name: &str, kind: MetricKind) -> Result<(), MetricError> {
        let mut registry = self.registry.write();
        match registry.get(name) {
            Some(existing) if *existing != kind => Err(MetricError::KindConflict {
                name: name.to_string(),
                existing: *existing,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                registry.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.registry.read().get(name).copied()
    }

    /// Record one sample. Samples for metrics that were never declared are dropped.
    pub fn add(&self, name: &str, value: f64, tags: &Tags) {
        let Some(kind) = self.kind_of(name) else {
            log::warn!("Dropping sample for undeclared metric [{name}]");
            return;
        };

        let key = SeriesKey {
            name: name.to_string(),
            tags: tags.clone(),
        };

        self.shards[shard_index()]
            .lock()
            .entry(key)
            .or_insert_with(|| Samples::empty(kind))
            .push(value);
    }

    pub fn add_counter(&self, name: &str, increment: f64, tags: &Tags) {
        self.add(name, increment, tags);
    }

    pub fn add_rate(&self, name: &str, hit: bool, tags: &Tags) {
        self.add(name, if hit { 1.0 } else { 0.0 }, tags);
    }

    pub fn add_trend(&self, name: &str, value: f64, tags: &Tags) {
        self.add(name, value, tags);
    }

    /// Aggregate the samples of `name` whose tags contain every entry of `filter`.
    ///
    /// Returns `None` if the metric was never declared.
    pub fn aggregate(&self, name: &str, filter: &Tags) -> Option<MetricValues> {
        let kind = self.kind_of(name)?;
        let mut acc = Accumulator::new(kind);

        for shard in &self.shards {
            let shard = shard.lock();
            shard
                .iter()
                .filter(|(key, _)| key.name == name && tags_match(&key.tags, filter))
                .for_each(|(_, samples)| acc.merge(samples));
        }

        Some(acc.finish(self.started.elapsed().as_secs_f64()))
    }

    /// Values for every declared metric that has at least one sample, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let recorded = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .keys()
                    .map(|key| key.name.clone())
                    .collect::<Vec<_>>()
            })
            .unique()
            .sorted()
            .collect::<Vec<_>>();

        recorded
            .into_iter()
            .filter_map(|name| {
                let kind = self.kind_of(&name)?;
                let values = self.aggregate(&name, &Tags::new())?;
                Some(MetricSnapshot { name, kind, values })
            })
            .collect()
    }
}

fn tags_match(tags: &Tags, filter: &Tags) -> bool {
    filter.iter().all(|(k, v)| tags.get(k) == Some(v))
}
