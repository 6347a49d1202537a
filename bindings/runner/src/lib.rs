mod auth;
mod cli;
mod common;
mod context;
mod credentials;
mod extract;
mod token;

pub mod prelude {
    /// Common operations for scenarios behind single sign-on.
    ///
    /// This is a good place to start if you are getting started writing scenarios.
    pub use crate::common::*;

    pub use crate::auth::{
        AuthFlowConfig, AuthFlowError, AuthFlowSimulator, Session, DEFAULT_TOKEN_PATTERN,
        TRACE_AUTH_ENV,
    };
    pub use crate::cli::{init, SsoScenarioCli};
    pub use crate::context::{
        DefaultScenarioValues, SsoRunnerContext, SsoWorkerContext, DEFAULT_HTTP_TIMEOUT,
    };
    pub use crate::credentials::{Credential, CredentialPool};
    pub use crate::extract::{ExtractionError, Extracted, FromExtracted, PatternExtractor};
    pub use crate::token::{BearerToken, PasswordGrant, TokenError};

    /// Re-export of the `squall_runner` prelude.
    ///
    /// This is for convenience so that you can depend on a single crate for the runner in your scenarios.
    pub use squall_runner::prelude::*;

    /// Re-export of the instrumented client for convenience.
    pub use http_client_instrumented::prelude::*;
}
