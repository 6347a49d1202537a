use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::metrics::MetricSnapshot;
use crate::threshold::{ThresholdPolicy, ThresholdResult};

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Values")]
    values: String,
}

#[derive(Tabled)]
struct ThresholdRow {
    #[tabled(rename = "Threshold")]
    threshold: String,
    #[tabled(rename = "Policy")]
    policy: String,
    #[tabled(rename = "Observed", display = "observed")]
    observed: Option<f64>,
    #[tabled(rename = "Result")]
    result: String,
}

fn observed(value: &Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.4}"),
        None => "-".to_string(),
    }
}

/// Render the aggregated metrics as a table.
pub fn metrics_table(snapshots: &[MetricSnapshot]) -> String {
    let rows = snapshots.iter().map(|snapshot| MetricRow {
        name: snapshot.name.clone(),
        kind: snapshot.kind.to_string(),
        values: snapshot
            .values
            .summary()
            .into_iter()
            .map(|(k, v)| format!("{k}={v:.2}"))
            .collect::<Vec<_>>()
            .join(" "),
    });

    let mut table = Table::new(rows);
    table.with(Style::modern());
    table.to_string()
}

/// Render the threshold verdicts as a table.
pub fn thresholds_table(results: &[ThresholdResult]) -> String {
    let rows = results.iter().map(|result| ThresholdRow {
        threshold: format!("{} {}", result.selector, result.expression),
        policy: match result.policy {
            ThresholdPolicy::Advisory => "advisory".to_string(),
            ThresholdPolicy::Abort => "abort".to_string(),
        },
        observed: result.observed,
        result: if result.passed { "pass" } else { "FAIL" }.to_string(),
    });

    let mut table = Table::new(rows);
    table.with(Style::modern());
    table.to_string()
}

/// Print the end-of-run summary to stdout.
pub fn print_summary(snapshots: &[MetricSnapshot], results: &[ThresholdResult]) {
    println!("\nSummary of metrics");
    println!("{}", metrics_table(snapshots));

    if !results.is_empty() {
        println!("\nThresholds");
        println!("{}", thresholds_table(results));
    }
}
