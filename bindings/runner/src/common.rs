use std::sync::Arc;

use anyhow::Context;
use http_client_instrumented::prelude::{build_client, CookieJar, HttpClientInstrumented, Url};
use squall_runner::prelude::{HookResult, RunnerContext, UserValuesConstraint, WorkerContext};

use crate::auth::AuthFlowSimulator;
use crate::context::{SsoRunnerContext, SsoWorkerContext};
use crate::credentials::Credential;

/// Log in once for the whole run and keep the resulting session in the [SsoRunnerContext].
///
/// Use this as the scenario's setup hook:
/// ```rust
/// use sso_squall_runner::prelude::*;
///
/// fn setup(ctx: &mut RunnerContext<SsoRunnerContext>) -> HookResult {
///     establish_session(ctx)?;
///     Ok(())
/// }
/// ```
///
/// Method:
/// - Reads the application base URL from the connection string.
/// - Picks one credential at random from the pool that was loaded from the CLI.
/// - Runs the [AuthFlowSimulator] against the base URL.
/// - Stores the base URL, the shared HTTP client and the session.
///
/// Failing to log in is fatal, nothing is retried.
pub fn establish_session(ctx: &mut RunnerContext<SsoRunnerContext>) -> HookResult {
    let base_url = application_url(ctx)?;
    let credential = choose_credential(ctx)?;
    log::info!("Logging in to {base_url} as {}", credential.username);

    let client = build_client(ctx.get().http_timeout())?;
    let simulator = AuthFlowSimulator::new(
        client.clone(),
        ctx.metrics().clone(),
        ctx.get().auth_config().clone(),
    )
    .context("Invalid token pattern")?
    .with_trace(AuthFlowSimulator::trace_from_env());

    let entry_url = base_url.clone();
    let session = ctx.executor().execute_in_place(async move {
        let session = simulator
            .establish(&entry_url, &credential)
            .await
            .context("Failed to log in")?;
        Ok(session)
    })?;
    log::info!(
        "Session established with {} cookies for {}",
        session.cookies().len(),
        session.origin()
    );

    let values = ctx.get_mut();
    values.base_url = Some(base_url);
    values.client = Some(client);
    values.session = Some(Arc::new(session));

    Ok(())
}

/// Get a bearer token for the whole run with the OAuth2 password grant, for services that are
/// called directly rather than through the browser login.
///
/// Use this as the setup hook instead of [establish_session]. The token endpoint and client come
/// from `--token-url`, `--client-id` and `--client-secret`. Scenarios send the token with
/// [SsoRunnerContext::token]:
/// ```rust
/// use sso_squall_runner::prelude::*;
///
/// fn setup(ctx: &mut RunnerContext<SsoRunnerContext>) -> HookResult {
///     establish_token(ctx)?;
///     Ok(())
/// }
/// ```
///
/// Failing to get a token is fatal, nothing is retried.
pub fn establish_token(ctx: &mut RunnerContext<SsoRunnerContext>) -> HookResult {
    let base_url = application_url(ctx)?;
    let grant = ctx
        .get()
        .password_grant()
        .context("No token endpoint configured, set it with --token-url")?
        .clone();
    let credential = choose_credential(ctx)?;
    log::info!(
        "Requesting a token from {} as {}",
        grant.token_url,
        credential.username
    );

    let client = build_client(ctx.get().http_timeout())?;
    let mut token_client = HttpClientInstrumented::new(client.clone(), ctx.metrics().clone());
    let token = ctx.executor().execute_in_place(async move {
        let token = grant
            .request_token(&mut token_client, &credential)
            .await
            .context("Failed to get an access token")?;
        Ok(token)
    })?;
    log::info!("Access token issued for {base_url}");

    let values = ctx.get_mut();
    values.base_url = Some(base_url);
    values.client = Some(client);
    values.token = Some(token);

    Ok(())
}

/// Give the worker its own HTTP client. With a browser session the cookie jar is seeded from it,
/// with a bearer token the jar starts empty.
///
/// Requires [establish_session] or [establish_token] to have run in the setup hook.
pub fn configure_worker_client<SV: UserValuesConstraint>(
    ctx: &mut WorkerContext<SsoRunnerContext, SsoWorkerContext<SV>>,
) -> HookResult {
    let runner_values = ctx.runner_context().get();
    let jar = match (runner_values.session(), runner_values.token()) {
        (Some(session), _) => session.to_jar(),
        (None, Some(_)) => CookieJar::default(),
        (None, None) => anyhow::bail!(
            "Not logged in, call 'establish_session' or 'establish_token' in the scenario setup"
        ),
    };
    let client = runner_values
        .client()
        .context("No HTTP client available, was the scenario setup run?")?
        .clone();

    let client =
        HttpClientInstrumented::new(client, ctx.runner_context().metrics().clone()).with_jar(jar);
    log::debug!("Configured HTTP client for {}", ctx.worker_id());

    ctx.get_mut().client = Some(client);

    Ok(())
}

fn application_url(ctx: &RunnerContext<SsoRunnerContext>) -> anyhow::Result<Url> {
    let base_url = ctx
        .connection_string()
        .context("The application URL is required, set it with --connection-string")?;
    Url::parse(base_url).with_context(|| format!("Invalid application URL [{base_url}]"))
}

fn choose_credential(ctx: &RunnerContext<SsoRunnerContext>) -> anyhow::Result<Credential> {
    ctx.get()
        .credentials()
        .context("No credentials were configured")?
        .choose()
        .cloned()
        .context("The credential pool is empty")
}
