use std::fmt::{Display, Formatter};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, LazyLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use squall_core::prelude::AbortSignal;

use crate::aggregate::Aggregation;
use crate::metrics::{MetricKind, MetricsCollector, Tags};

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<agg>avg|min|max|med|count|rate|p\(\s*(?P<pct>[^\s()]+)\s*\))\s*(?P<op><=|>=|==|!=|<|>)\s*(?P<bound>\S+)\s*$",
    )
    .expect("threshold expression pattern is valid")
});

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThresholdError {
    #[error("Invalid metric selector [{0}], expected `name` or `name{{tag:value,...}}`")]
    InvalidSelector(String),
    #[error("Invalid threshold expression [{0}], expected something like `p(95)<500` or `rate<=0.05`")]
    InvalidExpression(String),
    #[error("Threshold refers to metric [{0}] which is not declared")]
    UnknownMetric(String),
    #[error("Aggregation [{aggregation}] cannot be used with metric [{metric}] of kind {kind}")]
    UnsupportedAggregation {
        metric: String,
        kind: MetricKind,
        aggregation: Aggregation,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdPolicy {
    /// Breaches are reported but the run carries on.
    Advisory,
    /// A breach stops the run early.
    Abort,
}

/// Metric name plus an optional tag filter, written as `name` or `name{tag:value,...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSelector {
    pub name: String,
    pub tags: Tags,
}

impl MetricSelector {
    pub fn parse(input: &str) -> Result<Self, ThresholdError> {
        let invalid = || ThresholdError::InvalidSelector(input.to_string());
        let input_trimmed = input.trim();

        let (name, tags) = match input_trimmed.split_once('{') {
            None => (input_trimmed, Tags::new()),
            Some((name, rest)) => {
                let inner = rest.strip_suffix('}').ok_or_else(invalid)?;
                let tags = inner
                    .split(',')
                    .filter(|pair| !pair.trim().is_empty())
                    .map(|pair| {
                        pair.split_once(':')
                            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                            .filter(|(k, _)| !k.is_empty())
                            .ok_or_else(invalid)
                    })
                    .collect::<Result<Tags, _>>()?;
                (name.trim(), tags)
            }
        };

        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            tags,
        })
    }
}

impl Display for MetricSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.tags.is_empty() {
            let tags = self
                .tags
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "{{{tags}}}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

impl Display for Comparison {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        };
        write!(f, "{op}")
    }
}

/// A condition that must hold for the threshold to pass, e.g. `p(95)<500`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpression {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
}

impl ThresholdExpression {
    pub fn parse(input: &str) -> Result<Self, ThresholdError> {
        let invalid = || ThresholdError::InvalidExpression(input.to_string());
        let caps = EXPRESSION.captures(input).ok_or_else(invalid)?;

        let aggregation = match &caps["agg"] {
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            "count" => Aggregation::Count,
            "rate" => Aggregation::Rate,
            _ => {
                let pct = caps
                    .name("pct")
                    .and_then(|p| p.as_str().parse::<f64>().ok())
                    .filter(|p| (0.0..=100.0).contains(p))
                    .ok_or_else(invalid)?;
                Aggregation::Percentile(pct)
            }
        };

        let comparison = match &caps["op"] {
            "<" => Comparison::Lt,
            "<=" => Comparison::Le,
            ">" => Comparison::Gt,
            ">=" => Comparison::Ge,
            "==" => Comparison::Eq,
            _ => Comparison::Ne,
        };

        // Numbers follow Rust float syntax, so `.05` and `1e3` are fine but `inf` is not.
        let bound = caps["bound"]
            .parse::<f64>()
            .ok()
            .filter(|b| b.is_finite())
            .ok_or_else(invalid)?;

        Ok(Self {
            aggregation,
            comparison,
            bound,
        })
    }
}

impl Display for ThresholdExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparison, self.bound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdState {
    /// Nothing has been recorded for the selector yet.
    NoData,
    Passed(f64),
    Breached(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub selector: MetricSelector,
    pub expression: ThresholdExpression,
    pub policy: ThresholdPolicy,
}

impl Threshold {
    pub fn parse(
        selector: &str,
        expression: &str,
        policy: ThresholdPolicy,
    ) -> Result<Self, ThresholdError> {
        Ok(Self {
            selector: MetricSelector::parse(selector)?,
            expression: ThresholdExpression::parse(expression)?,
            policy,
        })
    }

    /// Check that the metric exists and that the aggregation makes sense for it.
    pub fn validate(&self, collector: &MetricsCollector) -> Result<(), ThresholdError> {
        let kind = collector
            .kind_of(&self.selector.name)
            .ok_or_else(|| ThresholdError::UnknownMetric(self.selector.name.clone()))?;

        let supported = match kind {
            MetricKind::Counter => {
                matches!(self.expression.aggregation, Aggregation::Count | Aggregation::Rate)
            }
            MetricKind::Rate => matches!(self.expression.aggregation, Aggregation::Rate),
            MetricKind::Trend => matches!(
                self.expression.aggregation,
                Aggregation::Avg
                    | Aggregation::Min
                    | Aggregation::Max
                    | Aggregation::Med
                    | Aggregation::Percentile(_)
            ),
        };

        if supported {
            Ok(())
        } else {
            Err(ThresholdError::UnsupportedAggregation {
                metric: self.selector.name.clone(),
                kind,
                aggregation: self.expression.aggregation,
            })
        }
    }

    pub fn evaluate(&self, collector: &MetricsCollector) -> ThresholdState {
        let observed = collector
            .aggregate(&self.selector.name, &self.selector.tags)
            .and_then(|values| values.get(self.expression.aggregation));

        match observed {
            None => ThresholdState::NoData,
            Some(value) if self.expression.comparison.holds(value, self.expression.bound) => {
                ThresholdState::Passed(value)
            }
            Some(value) => ThresholdState::Breached(value),
        }
    }
}

impl Display for Threshold {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.selector, self.expression)
    }
}

/// Final verdict for one threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdResult {
    pub selector: String,
    pub expression: String,
    pub policy: ThresholdPolicy,
    pub passed: bool,
    pub breached_during_run: bool,
    pub observed: Option<f64>,
}

/// Evaluates thresholds against the live metrics on a fixed cadence.
///
/// The first breach of an [ThresholdPolicy::Abort] threshold raises the [AbortSignal]. Advisory
/// breaches are logged and remembered for the final results but never abort.
#[derive(Debug)]
pub struct ThresholdMonitor {
    thresholds: Vec<Threshold>,
    collector: Arc<MetricsCollector>,
    abort: AbortSignal,
    breached: Mutex<Vec<bool>>,
}

impl ThresholdMonitor {
    pub fn new(
        thresholds: Vec<Threshold>,
        collector: Arc<MetricsCollector>,
        abort: AbortSignal,
    ) -> Self {
        let breached = Mutex::new(vec![false; thresholds.len()]);
        Self {
            thresholds,
            collector,
            abort,
            breached,
        }
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub fn validate(&self) -> Result<(), ThresholdError> {
        self.thresholds
            .iter()
            .try_for_each(|t| t.validate(&self.collector))
    }

    /// Run one evaluation round over every threshold.
    pub fn evaluate(&self) -> Vec<ThresholdState> {
        let states = self
            .thresholds
            .iter()
            .map(|t| t.evaluate(&self.collector))
            .collect::<Vec<_>>();

        let mut breached = self.breached.lock();
        for (index, (threshold, state)) in self.thresholds.iter().zip(&states).enumerate() {
            let ThresholdState::Breached(observed) = state else {
                continue;
            };

            if !breached[index] {
                breached[index] = true;
                match threshold.policy {
                    ThresholdPolicy::Advisory => {
                        log::warn!("Threshold [{threshold}] breached with value {observed:.4}")
                    }
                    ThresholdPolicy::Abort => log::error!(
                        "Abort threshold [{threshold}] breached with value {observed:.4}"
                    ),
                }
            }

            if threshold.policy == ThresholdPolicy::Abort {
                self.abort
                    .abort(format!("threshold [{threshold}] breached"));
            }
        }

        states
    }

    /// Evaluate one last time and report the verdict for each threshold.
    pub fn results(&self) -> Vec<ThresholdResult> {
        let states = self.evaluate();
        let breached = self.breached.lock();

        self.thresholds
            .iter()
            .zip(states)
            .enumerate()
            .map(|(index, (threshold, state))| {
                let (passed, observed) = match state {
                    ThresholdState::NoData => (true, None),
                    ThresholdState::Passed(v) => (true, Some(v)),
                    ThresholdState::Breached(v) => (false, Some(v)),
                };

                ThresholdResult {
                    selector: threshold.selector.to_string(),
                    expression: threshold.expression.to_string(),
                    policy: threshold.policy,
                    passed,
                    breached_during_run: breached[index],
                    observed,
                }
            })
            .collect()
    }

    /// Evaluate on a background thread every `interval` until the returned handle is stopped.
    pub fn start(self: &Arc<Self>, interval: Duration) -> std::io::Result<ThresholdMonitorHandle> {
        let (stop, stop_receiver) = mpsc::channel::<()>();
        let monitor = self.clone();

        let handle = std::thread::Builder::new()
            .name("threshold-monitor".to_string())
            .spawn(move || loop {
                match stop_receiver.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        monitor.evaluate();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        log::trace!("Threshold monitor shutting down");
                        break;
                    }
                }
            })?;

        Ok(ThresholdMonitorHandle { stop, handle })
    }
}

pub struct ThresholdMonitorHandle {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl ThresholdMonitorHandle {
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            log::error!("Threshold monitor thread panicked");
        }
    }
}
