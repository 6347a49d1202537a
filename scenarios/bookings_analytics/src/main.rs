use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sso_squall_runner::prelude::*;

mod bookings;

use bookings::load_bookings;

fn setup(ctx: &mut RunnerContext<SsoRunnerContext>) -> HookResult {
    establish_token(ctx)?;
    Ok(())
}

fn worker_setup(ctx: &mut WorkerContext<SsoRunnerContext, SsoWorkerContext>) -> HookResult {
    configure_worker_client(ctx)?;
    Ok(())
}

fn worker_behaviour(ctx: &mut WorkerContext<SsoRunnerContext, SsoWorkerContext>) -> HookResult {
    let runner_context = ctx.runner_context().clone();
    let values = runner_context.get();
    let base_url = values
        .base_url()
        .context("No application URL, did setup run?")?
        .clone();
    let token = values
        .token()
        .context("No access token, did setup run?")?
        .clone();
    let client = ctx
        .get_mut()
        .client
        .as_mut()
        .context("No HTTP client for this worker")?;

    let loaded = runner_context
        .executor()
        .execute_in_place(async move { Ok(load_bookings(client, &base_url, &token).await) })?;
    ctx.check("Bookings loaded", loaded);

    Ok(())
}

fn teardown(ctx: Arc<RunnerContext<SsoRunnerContext>>) -> HookResult {
    log::info!(
        "Bookings requested {} times",
        ctx.metrics()
            .aggregate(builtin::HTTP_REQS, &tags([("name", "bookings")]))
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
    .with_abort_threshold("check_failure_rate", "rate<=0.05")
    .use_setup(setup)
    .use_worker_setup(worker_setup)
    .use_worker_behaviour(worker_behaviour)
    .use_teardown(teardown);

    let summary = run(builder)?;
    if !summary.is_success() {
        anyhow::bail!("Run did not pass, outcome {:?}", summary.outcome);
    }

    Ok(())
}
