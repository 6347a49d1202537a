use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use squall_core::prelude::{AbortSignal, ShutdownSignalError, WorkerBailError};
use squall_instruments::report::print_summary;
use squall_instruments::{builtin, MetricsCollector, Tags, ThresholdMonitor, ThresholdPolicy};
use squall_summary_model::{
    store_run_summary, MetricSummary, RunStatus, RunSummary, StageSummary, ThresholdSummary,
};

use crate::config::ConfigError;
use crate::monitor::start_monitor;
use crate::progress::start_progress;
use crate::scheduler::{RunOutcome, StagePlan, StageScheduler, WorkerToken};
use crate::{
    context::{RunnerContext, UserValuesConstraint, WorkerContext},
    definition::ScenarioDefinitionBuilder,
    executor::Executor,
    shutdown::start_shutdown_listener,
};

/// Run a scenario to the end of its stages, or until it is aborted or interrupted.
///
/// Configuration errors and a failing setup hook are returned as errors before any worker starts.
/// Everything that happens once workers are running, including threshold aborts, is reported in
/// the returned [RunSummary].
pub fn run<RV: UserValuesConstraint, V: UserValuesConstraint>(
    definition: ScenarioDefinitionBuilder<RV, V>,
) -> anyhow::Result<RunSummary> {
    let definition = definition.build()?;

    log::info!("Running scenario: {}", definition.name);

    let metrics = Arc::new(MetricsCollector::with_builtin_metrics());
    for (name, kind) in &definition.metrics {
        metrics.declare(name, *kind).map_err(ConfigError::from)?;
    }

    let abort = AbortSignal::new();
    let threshold_monitor = Arc::new(ThresholdMonitor::new(
        definition.settings.thresholds.clone(),
        metrics.clone(),
        abort.clone(),
    ));
    threshold_monitor.validate().map_err(ConfigError::from)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let shutdown_handle = start_shutdown_listener(&runtime);
    let executor = Arc::new(Executor::new(runtime, shutdown_handle.clone()));

    let mut runner_context = RunnerContext::new(
        executor,
        metrics.clone(),
        abort.clone(),
        shutdown_handle.clone(),
        definition.connection_string.clone(),
        definition.runner_value,
    );

    if let Some(setup_fn) = definition.setup_fn {
        if let Err(e) = setup_fn(&mut runner_context) {
            shutdown_handle.shutdown();
            return Err(e);
        }
    }

    let started_at = chrono::Utc::now();
    let plan = StagePlan::new(
        definition.settings.initial_workers,
        definition.settings.stages.clone(),
    );

    if !definition.no_progress {
        start_progress(plan.total_duration(), shutdown_handle.new_listener());
    }

    // Ready to start spawning workers so start the resource monitor to report high usage by the
    // load generator, which would make the latency numbers misleading.
    start_monitor(shutdown_handle.new_listener());

    let threshold_handle = match threshold_monitor.start(definition.settings.evaluation_interval) {
        Ok(handle) => handle,
        Err(e) => {
            shutdown_handle.shutdown();
            return Err(e).context("Failed to start threshold monitor");
        }
    };

    let runner_context = Arc::new(runner_context);
    let total_iterations = Arc::new(AtomicU64::new(0));

    let worker = {
        let runner_context = runner_context.clone();
        let total_iterations = total_iterations.clone();
        let setup_worker_fn = definition.setup_worker_fn;
        let worker_behaviour = definition.worker_behaviour;
        let teardown_worker_fn = definition.teardown_worker_fn;

        move |token: WorkerToken| {
            let worker_id = format!("worker-{}", token.id());
            let mut context = WorkerContext::<RV, V>::new(
                worker_id.clone(),
                runner_context.clone(),
                token.shutdown_listener(),
            );

            if let Some(setup_worker_fn) = setup_worker_fn {
                if let Err(e) = setup_worker_fn(&mut context) {
                    log::error!("Worker setup failed for {worker_id}: {e:?}");
                    return;
                }
            }

            if let Some(behaviour) = worker_behaviour {
                let metrics = runner_context.metrics();
                let no_tags = Tags::new();

                while !token.should_stop() {
                    let iteration_started = Instant::now();
                    match behaviour(&mut context) {
                        Ok(()) => {
                            metrics.add_counter(builtin::ITERATIONS, 1.0, &no_tags);
                            metrics.add_trend(
                                builtin::ITERATION_DURATION,
                                iteration_started.elapsed().as_secs_f64() * 1000.0,
                                &no_tags,
                            );
                            total_iterations.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) if e.is::<ShutdownSignalError>() => {
                            // Expected when the run is being hard stopped, the loop condition
                            // will catch it.
                        }
                        Err(e) if e.is::<WorkerBailError>() => {
                            log::warn!("Worker {worker_id} is bailing: {e}");
                            break;
                        }
                        Err(e) => {
                            log::error!("Worker behaviour failed for {worker_id}: {e:?}");
                        }
                    }
                }
            }

            log::debug!("Stopping {worker_id}");

            if let Some(teardown_worker_fn) = teardown_worker_fn {
                if let Err(e) = teardown_worker_fn(&mut context) {
                    log::error!("Worker teardown failed for {worker_id}: {e:?}");
                }
            }
        }
    };

    let scheduler = StageScheduler::new(
        plan,
        definition.settings.tick,
        definition.settings.grace_period,
        abort,
        shutdown_handle.clone(),
    );
    let report = scheduler.run(worker);

    threshold_handle.stop();

    if let Some(teardown_fn) = definition.teardown_fn {
        // Don't crash the runner if the teardown fails. We still want the reporting and runner
        // shutdown to happen cleanly. The hook is documented as 'best effort'.
        if let Err(e) = teardown_fn(runner_context.clone()) {
            log::error!("Teardown failed: {e:?}");
        }
    }

    // Stop the progress bar and the resource monitor.
    shutdown_handle.shutdown();

    let report = report?;
    let threshold_results = threshold_monitor.results();
    let snapshots = metrics.snapshot();

    print_summary(&snapshots, &threshold_results);

    let outcome = match report.outcome {
        RunOutcome::Completed => RunStatus::Completed,
        RunOutcome::AbortedByThreshold { reason } => RunStatus::AbortedByThreshold { reason },
        RunOutcome::Interrupted => RunStatus::Interrupted,
    };
    log::info!("Run finished: {outcome:?}");

    let summary = RunSummary {
        run_id: nanoid::nanoid!(),
        scenario_name: definition.name,
        started_at: started_at.timestamp(),
        run_duration_ms: report.elapsed.as_millis() as u64,
        outcome,
        peak_workers: report.peak_workers,
        total_iterations: total_iterations.load(Ordering::Relaxed),
        stages: definition
            .settings
            .stages
            .iter()
            .map(|stage| StageSummary {
                target: stage.target,
                duration_ms: stage.duration.as_millis() as u64,
            })
            .collect(),
        metrics: snapshots
            .iter()
            .map(|snapshot| MetricSummary {
                name: snapshot.name.clone(),
                kind: snapshot.kind.to_string(),
                values: snapshot.values.summary().into_iter().collect::<BTreeMap<_, _>>(),
            })
            .collect(),
        thresholds: threshold_results
            .into_iter()
            .map(|result| ThresholdSummary {
                selector: result.selector,
                expression: result.expression,
                abort_on_fail: result.policy == ThresholdPolicy::Abort,
                passed: result.passed,
                breached_during_run: result.breached_during_run,
                observed: result.observed,
            })
            .collect(),
        squall_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if definition.json_summary {
        let mut stdout = std::io::stdout();
        store_run_summary(&summary, &mut stdout).context("Failed to write the run summary")?;
        println!();
    }

    Ok(summary)
}
