mod aggregate;
mod metrics;
pub mod report;
mod threshold;

pub use aggregate::{Aggregation, MetricValues, TrendValues};
pub use metrics::{builtin, MetricError, MetricKind, MetricSnapshot, MetricsCollector, Tags};
pub use threshold::{
    Comparison, MetricSelector, Threshold, ThresholdError, ThresholdExpression,
    ThresholdMonitor, ThresholdMonitorHandle, ThresholdPolicy, ThresholdResult, ThresholdState,
};

/// Build a tag set from string pairs.
///
/// ```rust
/// let tags = squall_instruments::tags([("staticAsset", "yes")]);
/// assert_eq!(tags.get("staticAsset").map(String::as_str), Some("yes"));
/// ```
pub fn tags<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
