use std::fmt::{Display, Formatter};

use hdrhistogram::Histogram;

/// A statistic that can be derived from the samples of one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Sum of a counter.
    Count,
    /// Fraction of non-zero samples for a rate, or increments per second for a counter.
    Rate,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in the range `0..=100`.
    Percentile(f64),
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Aggregation::Count => write!(f, "count"),
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

/// Trend samples are recorded in thousandths of their unit, so millisecond durations keep
/// microsecond resolution.
const TREND_SCALE: f64 = 1000.0;

/// Relative error of percentiles is bounded by 0.1%.
const TREND_SIGNIFICANT_FIGURES: u8 = 3;

/// The distribution of a trend metric.
///
/// Percentiles come from an HDR histogram so that memory and the cost of reading them stay flat
/// however long a run goes on. Count, sum, min and max are tracked exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendValues {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for TrendValues {
    fn default() -> Self {
        Self::new()
    }
}

impl TrendValues {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new(TREND_SIGNIFICANT_FIGURES)
                .expect("3 significant figures is a supported histogram precision"),
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    pub fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;

        // Negative values only affect the exact statistics, the histogram floors them at zero.
        self.histogram
            .saturating_record((value.max(0.0) * TREND_SCALE).round() as u64);
    }

    pub fn merge(&mut self, other: &TrendValues) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        if let Err(e) = self.histogram.add(&other.histogram) {
            log::warn!("Failed to merge trend samples: {e:?}");
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Percentile in the range `0..=100`. The ends are the exact min and max, values in between
    /// are within the histogram's precision and never outside the observed range.
    pub fn percentile(&self, pct: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }

        let pct = pct.clamp(0.0, 100.0);
        if pct == 0.0 {
            return Some(self.min);
        }
        if pct == 100.0 {
            return Some(self.max);
        }

        let value = self.histogram.value_at_quantile(pct / 100.0) as f64 / TREND_SCALE;
        Some(value.clamp(self.min, self.max))
    }
}

/// Aggregated view over the samples of one metric, possibly narrowed by a tag filter.
///
/// Every value here is independent of the order in which samples were recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValues {
    Counter { count: f64, rate: f64 },
    Rate { passes: u64, fails: u64 },
    Trend(TrendValues),
}

impl MetricValues {
    /// Number of samples behind the values, `None` for counters where only the sum is kept.
    pub fn sample_count(&self) -> Option<u64> {
        match self {
            MetricValues::Counter { .. } => None,
            MetricValues::Rate { passes, fails } => Some(passes + fails),
            MetricValues::Trend(trend) => Some(trend.count()),
        }
    }

    /// Compute an aggregation. Returns `None` when the aggregation does not apply to this kind of
    /// metric or when there are no samples to compute it from.
    pub fn get(&self, aggregation: Aggregation) -> Option<f64> {
        match (self, aggregation) {
            (MetricValues::Counter { count, .. }, Aggregation::Count) => Some(*count),
            (MetricValues::Counter { rate, .. }, Aggregation::Rate) => Some(*rate),
            (MetricValues::Rate { passes, fails }, Aggregation::Rate) => {
                let total = passes + fails;
                (total > 0).then(|| *passes as f64 / total as f64)
            }
            (MetricValues::Trend(trend), aggregation) => match aggregation {
                Aggregation::Avg => trend.avg(),
                Aggregation::Min => trend.min(),
                Aggregation::Max => trend.max(),
                Aggregation::Med => trend.percentile(50.0),
                Aggregation::Percentile(p) => trend.percentile(p),
                Aggregation::Count | Aggregation::Rate => None,
            },
            _ => None,
        }
    }

    /// The aggregations reported for this kind of metric in the end-of-run summary.
    pub fn summary(&self) -> Vec<(String, f64)> {
        let aggregations: &[Aggregation] = match self {
            MetricValues::Counter { .. } => &[Aggregation::Count, Aggregation::Rate],
            MetricValues::Rate { passes, fails } => {
                return [
                    ("rate".to_string(), self.get(Aggregation::Rate)),
                    ("passes".to_string(), Some(*passes as f64)),
                    ("fails".to_string(), Some(*fails as f64)),
                ]
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect();
            }
            MetricValues::Trend(_) => &[
                Aggregation::Avg,
                Aggregation::Min,
                Aggregation::Med,
                Aggregation::Max,
                Aggregation::Percentile(90.0),
                Aggregation::Percentile(95.0),
            ],
        };

        aggregations
            .iter()
            .filter_map(|a| self.get(*a).map(|v| (a.to_string(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend(samples: &[f64]) -> TrendValues {
        let mut trend = TrendValues::new();
        for sample in samples {
            trend.record(*sample);
        }
        trend
    }

    #[test]
    fn percentiles_stay_within_histogram_precision() {
        let samples = (1..=1000).map(|i| i as f64).collect::<Vec<_>>();
        let values = MetricValues::Trend(trend(&samples));

        let p95 = values.get(Aggregation::Percentile(95.0)).unwrap();
        assert!((p95 - 950.0).abs() <= 950.0 * 0.001, "p(95) was {p95}");
        let med = values.get(Aggregation::Med).unwrap();
        assert!((med - 500.0).abs() <= 500.0 * 0.001, "med was {med}");

        assert_eq!(values.get(Aggregation::Min), Some(1.0));
        assert_eq!(values.get(Aggregation::Max), Some(1000.0));
        assert_eq!(values.get(Aggregation::Percentile(0.0)), Some(1.0));
        assert_eq!(values.get(Aggregation::Percentile(100.0)), Some(1000.0));
        assert_eq!(values.get(Aggregation::Avg), Some(500.5));
        assert_eq!(values.sample_count(), Some(1000));
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let values = MetricValues::Trend(trend(&[120.0]));

        for p in [1.0, 50.0, 95.0, 99.9] {
            assert_eq!(values.get(Aggregation::Percentile(p)), Some(120.0));
        }
    }

    #[test]
    fn empty_trend_has_no_values() {
        let values = MetricValues::Trend(TrendValues::new());

        assert_eq!(values.get(Aggregation::Avg), None);
        assert_eq!(values.get(Aggregation::Percentile(95.0)), None);
        assert_eq!(values.sample_count(), Some(0));
    }

    #[test]
    fn trend_values_do_not_depend_on_sample_order() {
        let samples = vec![12.0, 3.5, 99.0, 42.0, 7.25, 18.0, 3.5];
        let mut reversed = samples.clone();
        reversed.reverse();
        let mut rotated = samples.clone();
        rotated.rotate_left(3);

        let expected = MetricValues::Trend(trend(&samples));
        for other in [reversed, rotated] {
            let values = MetricValues::Trend(trend(&other));
            for aggregation in [
                Aggregation::Min,
                Aggregation::Max,
                Aggregation::Med,
                Aggregation::Percentile(95.0),
            ] {
                assert_eq!(values.get(aggregation), expected.get(aggregation));
            }
            let avg = values.get(Aggregation::Avg).unwrap();
            assert!((avg - expected.get(Aggregation::Avg).unwrap()).abs() < 1e-9);
        }
    }

    #[test]
    fn merged_shards_match_one_series() {
        let mut left = trend(&[1.0, 2.0, 3.0]);
        let right = trend(&[400.0, 5.0]);
        left.merge(&right);
        left.merge(&TrendValues::new());

        let all = trend(&[1.0, 2.0, 3.0, 400.0, 5.0]);
        assert_eq!(left.count(), 5);
        assert_eq!(left.min(), Some(1.0));
        assert_eq!(left.max(), Some(400.0));
        assert_eq!(left.percentile(50.0), all.percentile(50.0));
        assert_eq!(left.percentile(90.0), all.percentile(90.0));
    }

    #[test]
    fn rate_without_samples_has_no_value() {
        let values = MetricValues::Rate {
            passes: 0,
            fails: 0,
        };
        assert_eq!(values.get(Aggregation::Rate), None);
    }

    #[test]
    fn aggregation_must_suit_metric() {
        let values = MetricValues::Counter {
            count: 4.0,
            rate: 2.0,
        };
        assert_eq!(values.get(Aggregation::Count), Some(4.0));
        assert_eq!(values.get(Aggregation::Percentile(95.0)), None);
    }
}
