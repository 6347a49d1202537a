use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sso_squall_runner::prelude::*;

mod lifecycle;

use lifecycle::TravelLifecycle;

fn setup(ctx: &mut RunnerContext<SsoRunnerContext>) -> HookResult {
    establish_session(ctx)?;
    Ok(())
}

fn worker_setup(ctx: &mut WorkerContext<SsoRunnerContext, SsoWorkerContext>) -> HookResult {
    configure_worker_client(ctx)?;
    Ok(())
}

fn worker_behaviour(ctx: &mut WorkerContext<SsoRunnerContext, SsoWorkerContext>) -> HookResult {
    let runner_context = ctx.runner_context().clone();
    let base_url = runner_context
        .get()
        .base_url()
        .context("No application URL, was the session established?")?
        .clone();
    let client = ctx
        .get_mut()
        .client
        .as_mut()
        .context("No HTTP client for this worker")?;

    let checks = runner_context.executor().execute_in_place(async move {
        let lifecycle = TravelLifecycle::new(client, &base_url)?;
        Ok(lifecycle.run().await)
    })?;

    for check in checks {
        ctx.check(check.label, check.passed);
    }

    Ok(())
}

fn teardown(ctx: Arc<RunnerContext<SsoRunnerContext>>) -> HookResult {
    log::info!(
        "Tearing down the scenario after {} iterations",
        ctx.metrics()
            .aggregate(builtin::ITERATIONS, &Tags::new())
            .and_then(|v| v.get(Aggregation::Count))
            .unwrap_or_default()
    );

    Ok(())
}

fn main() -> SquallResult<()> {
    let cli = init();
    let runner_values = SsoRunnerContext::from_cli(&cli)?;

    let builder = ScenarioDefinitionBuilder::<SsoRunnerContext, SsoWorkerContext>::new(
        env!("CARGO_PKG_NAME"),
        cli.squall,
    )
    .with_runner_value(runner_values)
    .with_default_stages(vec![
        Stage::new(Duration::from_secs(60), 10),
        Stage::new(Duration::from_secs(210), 10),
        Stage::new(Duration::from_secs(30), 0),
    ])
    .with_threshold("http_req_duration", "p(95)<500")
    .with_threshold("http_req_duration{staticAsset:yes}", "p(99)<250")
    .with_threshold("check_failure_rate", "rate<0.01")
    .with_abort_threshold("check_failure_rate", "rate<=0.05")
    .use_setup(setup)
    .use_worker_setup(worker_setup)
    .use_worker_behaviour(worker_behaviour)
    .use_teardown(teardown);

    let summary = run(builder)?;
    if !summary.is_success() {
        let failed = summary.thresholds.iter().filter(|t| !t.passed).count();
        anyhow::bail!(
            "Run did not pass, outcome {:?} with {failed} failed thresholds",
            summary.outcome
        );
    }

    Ok(())
}
