use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use squall_runner::prelude::{
    run, HookResult, RunStatus, RunnerContext, ScenarioDefinitionBuilder, SquallScenarioCli,
    Stage, UserValuesConstraint, WorkerBailError, WorkerContext,
};

#[derive(Default, Debug)]
struct RunnerContextValue {}

impl UserValuesConstraint for RunnerContextValue {}

#[derive(Default, Debug)]
struct WorkerContextValue {
    value: i32,
}

impl UserValuesConstraint for WorkerContextValue {}

fn sample_cli_cfg() -> SquallScenarioCli {
    SquallScenarioCli {
        connection_string: Some("test_connection_string".to_string()),
        stage: vec![],
        threshold: vec![],
        abort_threshold: vec![],
        config: None,
        initial_workers: None,
        grace_period: Some(Duration::from_secs(2)),
        no_progress: true,
        json_summary: false,
    }
}

fn short_stages(workers: u32) -> Vec<Stage> {
    vec![
        Stage::new(Duration::ZERO, workers),
        Stage::new(Duration::from_millis(500), workers),
    ]
}

#[test]
fn propagate_error_in_setup_hook() {
    fn setup(_ctx: &mut RunnerContext<RunnerContextValue>) -> HookResult {
        Err(anyhow::anyhow!("Error in setup hook"))
    }

    fn worker_behaviour(
        _ctx: &mut WorkerContext<RunnerContextValue, WorkerContextValue>,
    ) -> HookResult {
        panic!("No worker should start when setup fails");
    }

    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "propagate_error_in_setup_hook",
        sample_cli_cfg(),
    )
    .with_default_stages(short_stages(1))
    .use_setup(setup)
    .use_worker_behaviour(worker_behaviour);

    let result = run(scenario);

    assert!(result.is_err());
    assert_eq!(result.unwrap_err().to_string(), "Error in setup hook");
}

#[test]
fn reject_threshold_on_undeclared_metric() {
    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "reject_threshold_on_undeclared_metric",
        sample_cli_cfg(),
    )
    .with_default_stages(short_stages(1))
    .with_threshold("no_such_metric", "rate<0.1");

    let result = run(scenario);

    assert!(result.is_err());
}

#[test]
fn capture_error_in_worker_setup() {
    fn worker_setup(_ctx: &mut WorkerContext<RunnerContextValue, WorkerContextValue>) -> HookResult {
        Err(anyhow::anyhow!("Error in worker setup hook"))
    }

    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "capture_error_in_worker_setup",
        sample_cli_cfg(),
    )
    .with_default_stages(short_stages(1))
    .use_worker_setup(worker_setup);

    let result = run(scenario);

    assert!(result.is_ok());
}

#[test]
fn capture_error_in_worker_behaviour_and_continue() {
    fn worker_behaviour(
        ctx: &mut WorkerContext<RunnerContextValue, WorkerContextValue>,
    ) -> HookResult {
        if ctx.get().value < 5 {
            ctx.get_mut().value += 1;
        } else {
            // Save time running this test by shutting down once this has run a few times.
            ctx.runner_context().force_stop_scenario();
        }

        Err(anyhow::anyhow!("Error in worker behaviour hook"))
    }

    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "capture_error_in_worker_behaviour_and_continue",
        sample_cli_cfg(),
    )
    .with_default_stages(vec![
        Stage::new(Duration::ZERO, 1),
        Stage::new(Duration::from_secs(10), 1),
    ])
    .use_worker_behaviour(worker_behaviour);

    let summary = run(scenario).unwrap();

    assert_eq!(summary.outcome, RunStatus::Interrupted);
}

#[test]
fn bail_error_stops_worker_behaviour() {
    static WORKERS_STARTED: AtomicUsize = AtomicUsize::new(0);

    fn worker_setup(_ctx: &mut WorkerContext<RunnerContextValue, WorkerContextValue>) -> HookResult {
        WORKERS_STARTED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn worker_behaviour(
        ctx: &mut WorkerContext<RunnerContextValue, WorkerContextValue>,
    ) -> HookResult {
        if ctx.worker_id() == "worker-0" {
            return Err(WorkerBailError::default().into());
        }

        std::thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "bail_error_stops_worker_behaviour",
        sample_cli_cfg(),
    )
    .with_default_stages(short_stages(2))
    .use_worker_setup(worker_setup)
    .use_worker_behaviour(worker_behaviour);

    let summary = run(scenario).unwrap();

    assert_eq!(summary.outcome, RunStatus::Completed);
    // The bailed worker keeps its slot and is not replaced.
    assert_eq!(summary.peak_workers, 2);
    assert_eq!(WORKERS_STARTED.load(Ordering::SeqCst), 2);
    assert!(summary.total_iterations > 0);
}

#[test]
fn failed_checks_trip_abort_threshold() {
    fn worker_behaviour(
        ctx: &mut WorkerContext<RunnerContextValue, WorkerContextValue>,
    ) -> HookResult {
        ctx.check("always fails", false);
        std::thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    let mut cli = sample_cli_cfg();
    cli.abort_threshold = vec![("check_failure_rate".to_string(), "rate<=0.05".to_string())];

    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "failed_checks_trip_abort_threshold",
        cli,
    )
    .with_default_stages(vec![
        Stage::new(Duration::ZERO, 2),
        Stage::new(Duration::from_secs(30), 2),
    ])
    .use_worker_behaviour(worker_behaviour);

    let summary = run(scenario).unwrap();

    assert!(matches!(summary.outcome, RunStatus::AbortedByThreshold { .. }));
    assert!(summary.run_duration_ms < 10_000);
    assert!(!summary.thresholds[0].passed);
    assert!(summary.thresholds[0].abort_on_fail);
}

#[test]
fn advisory_breach_does_not_abort() {
    fn worker_behaviour(
        ctx: &mut WorkerContext<RunnerContextValue, WorkerContextValue>,
    ) -> HookResult {
        ctx.check("always fails", false);
        std::thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    let mut cli = sample_cli_cfg();
    cli.threshold = vec![("check_failure_rate".to_string(), "rate<0.01".to_string())];

    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "advisory_breach_does_not_abort",
        cli,
    )
    .with_default_stages(vec![
        Stage::new(Duration::ZERO, 1),
        Stage::new(Duration::from_millis(1500), 1),
    ])
    .use_worker_behaviour(worker_behaviour);

    let summary = run(scenario).unwrap();

    assert_eq!(summary.outcome, RunStatus::Completed);
    assert!(!summary.thresholds[0].passed);
    assert!(summary.thresholds[0].breached_during_run);
    assert!(!summary.is_success());
}

#[test]
fn capture_error_in_worker_teardown() {
    fn worker_teardown(
        _ctx: &mut WorkerContext<RunnerContextValue, WorkerContextValue>,
    ) -> HookResult {
        Err(anyhow::anyhow!("Error in worker teardown hook"))
    }

    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "capture_error_in_worker_teardown",
        sample_cli_cfg(),
    )
    .with_default_stages(short_stages(1))
    .use_worker_teardown(worker_teardown);

    let result = run(scenario);

    assert!(result.is_ok());
}

#[test]
fn capture_error_in_teardown() {
    fn teardown(_ctx: Arc<RunnerContext<RunnerContextValue>>) -> HookResult {
        Err(anyhow::anyhow!("Error in teardown hook"))
    }

    let scenario = ScenarioDefinitionBuilder::<RunnerContextValue, WorkerContextValue>::new(
        "capture_error_in_teardown",
        sample_cli_cfg(),
    )
    .with_default_stages(short_stages(1))
    .use_teardown(teardown);

    let result = run(scenario);

    assert!(result.is_ok());
}
