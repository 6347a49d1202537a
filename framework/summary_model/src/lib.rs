use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// How a run ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage ran to the end
    Completed,
    /// An abort-policy threshold was breached and the run was cut short
    AbortedByThreshold { reason: String },
    /// The run was stopped from outside, for example with Ctrl-C
    Interrupted,
}

/// One stage of the configured concurrency curve
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSummary {
    pub target: u32,
    pub duration_ms: u64,
}

/// Aggregated values for one metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSummary {
    pub name: String,
    /// One of `counter`, `rate` or `trend`
    pub kind: String,
    /// Aggregation name, such as `p(95)` or `rate`, to its value
    pub values: BTreeMap<String, f64>,
}

/// The verdict for one threshold
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdSummary {
    pub selector: String,
    pub expression: String,
    /// Whether a breach of this threshold aborts the run
    pub abort_on_fail: bool,
    pub passed: bool,
    /// Set if the threshold was breached at any evaluation, even if it passed at the end
    pub breached_during_run: bool,
    pub observed: Option<f64>,
}

/// Summary of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// The unique run id
    ///
    /// Chosen by the runner. Unique for each run.
    pub run_id: String,
    /// The name of the scenario that was run
    pub scenario_name: String,
    /// The time the run started
    ///
    /// This is a Unix timestamp in seconds.
    pub started_at: i64,
    /// Wall clock time from the first worker starting to the last one finishing
    pub run_duration_ms: u64,
    pub outcome: RunStatus,
    /// The highest number of workers that were active at the same time
    pub peak_workers: usize,
    /// Number of completed scenario iterations across all workers
    pub total_iterations: u64,
    pub stages: Vec<StageSummary>,
    pub metrics: Vec<MetricSummary>,
    pub thresholds: Vec<ThresholdSummary>,
    /// The version of Squall that was used for this run
    pub squall_version: String,
}

impl RunSummary {
    /// True if the run completed and every threshold passed.
    pub fn is_success(&self) -> bool {
        self.outcome == RunStatus::Completed && self.thresholds.iter().all(|t| t.passed)
    }
}

/// Serialize the run summary to a writer
pub fn store_run_summary<W: Write>(run_summary: &RunSummary, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer(writer, run_summary)?;
    Ok(())
}

/// Load a run summary from a reader
pub fn load_run_summary<R: Read>(reader: R) -> anyhow::Result<RunSummary> {
    let reader = std::io::BufReader::new(reader);
    let run_summary: RunSummary = serde_json::from_reader(reader)?;
    Ok(run_summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> RunSummary {
        RunSummary {
            run_id: "abc".to_string(),
            scenario_name: "travel_draft_lifecycle".to_string(),
            started_at: 1_700_000_000,
            run_duration_ms: 300_000,
            outcome: RunStatus::AbortedByThreshold {
                reason: "threshold [check_failure_rate rate<=0.05] breached".to_string(),
            },
            peak_workers: 10,
            total_iterations: 420,
            stages: vec![StageSummary {
                target: 10,
                duration_ms: 60_000,
            }],
            metrics: vec![MetricSummary {
                name: "checks".to_string(),
                kind: "rate".to_string(),
                values: BTreeMap::from([("rate".to_string(), 0.9)]),
            }],
            thresholds: vec![ThresholdSummary {
                selector: "check_failure_rate".to_string(),
                expression: "rate<=0.05".to_string(),
                abort_on_fail: true,
                passed: false,
                breached_during_run: true,
                observed: Some(0.1),
            }],
            squall_version: "0.1.0".to_string(),
        }
    }

    #[test]
    fn summary_survives_json() {
        let summary = sample();
        let mut buf = Vec::new();
        store_run_summary(&summary, &mut buf).unwrap();

        let json = String::from_utf8(buf.clone()).unwrap();
        assert!(json.contains(r#""status":"aborted_by_threshold""#));

        let loaded = load_run_summary(buf.as_slice()).unwrap();
        assert_eq!(loaded, summary);
    }

    #[test]
    fn aborted_run_is_not_a_success() {
        let mut summary = sample();
        assert!(!summary.is_success());

        summary.outcome = RunStatus::Completed;
        summary.thresholds[0].passed = true;
        assert!(summary.is_success());
    }
}
