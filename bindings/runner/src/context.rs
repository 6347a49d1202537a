use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http_client_instrumented::prelude::{HttpClientInstrumented, Url};
use squall_runner::prelude::UserValuesConstraint;

use crate::auth::{AuthFlowConfig, Session};
use crate::cli::SsoScenarioCli;
use crate::credentials::CredentialPool;
use crate::token::{BearerToken, PasswordGrant};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Runner values for scenarios against an application behind single sign-on.
///
/// The credentials, timeout and optional password grant come from the CLI. The client, base URL
/// and either the session or the bearer token are filled in during setup, by
/// [crate::common::establish_session] or [crate::common::establish_token], and are read-only
/// afterwards.
#[derive(Debug)]
pub struct SsoRunnerContext {
    credentials: Option<CredentialPool>,
    http_timeout: Duration,
    auth_config: AuthFlowConfig,
    password_grant: Option<PasswordGrant>,
    pub(crate) base_url: Option<Url>,
    pub(crate) client: Option<reqwest::Client>,
    pub(crate) session: Option<Arc<Session>>,
    pub(crate) token: Option<BearerToken>,
}

impl Default for SsoRunnerContext {
    fn default() -> Self {
        Self {
            credentials: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            auth_config: AuthFlowConfig::default(),
            password_grant: None,
            base_url: None,
            client: None,
            session: None,
            token: None,
        }
    }
}

impl UserValuesConstraint for SsoRunnerContext {}

impl SsoRunnerContext {
    /// Load the credentials file named on the command line.
    pub fn from_cli(cli: &SsoScenarioCli) -> anyhow::Result<Self> {
        let credentials = CredentialPool::load(&cli.credentials)
            .with_context(|| format!("Failed to load credentials for {}", cli.credentials.display()))?;
        log::info!("Loaded {} credentials", credentials.len());

        let password_grant = match &cli.token_url {
            Some(token_url) => {
                let client_id = cli
                    .client_id
                    .clone()
                    .context("--client-id is required with --token-url")?;
                Some(PasswordGrant::new(
                    token_url.clone(),
                    client_id,
                    cli.client_secret.clone().unwrap_or_default(),
                ))
            }
            None => None,
        };

        Ok(Self {
            credentials: Some(credentials),
            http_timeout: cli.http_timeout,
            password_grant,
            ..Default::default()
        })
    }

    pub fn with_credentials(mut self, credentials: CredentialPool) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_auth_config(mut self, config: AuthFlowConfig) -> Self {
        self.auth_config = config;
        self
    }

    pub fn with_password_grant(mut self, grant: PasswordGrant) -> Self {
        self.password_grant = Some(grant);
        self
    }

    pub fn credentials(&self) -> Option<&CredentialPool> {
        self.credentials.as_ref()
    }

    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    pub fn auth_config(&self) -> &AuthFlowConfig {
        &self.auth_config
    }

    /// The application base URL, available once the session has been established.
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    pub fn client(&self) -> Option<&reqwest::Client> {
        self.client.as_ref()
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn password_grant(&self) -> Option<&PasswordGrant> {
        self.password_grant.as_ref()
    }

    /// The bearer token, available once [crate::common::establish_token] has run.
    pub fn token(&self) -> Option<&BearerToken> {
        self.token.as_ref()
    }
}

/// Default scenario values for [SsoWorkerContext], for scenarios that keep no state of their own.
#[derive(Default, Debug)]
pub struct DefaultScenarioValues {}

impl UserValuesConstraint for DefaultScenarioValues {}

/// Per worker values. Each worker gets its own client and cookie jar.
#[derive(Default, Debug)]
pub struct SsoWorkerContext<SV: UserValuesConstraint = DefaultScenarioValues> {
    pub client: Option<HttpClientInstrumented>,
    pub scenario_values: SV,
}

impl<SV: UserValuesConstraint> UserValuesConstraint for SsoWorkerContext<SV> {}
