use std::fmt::{Debug, Formatter};
use std::time::Instant;

use http_client_instrumented::prelude::{HttpClientInstrumented, HttpError, HttpRequest, Url};
use serde::Deserialize;
use squall_runner::prelude::{builtin, tags};

use crate::credentials::Credential;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token request failed: {0}")]
    Request(#[source] HttpError),
    #[error("Token endpoint [{url}] refused the grant with status {status}")]
    Rejected { url: String, status: u16 },
    #[error("Token endpoint [{url}] did not return an access token")]
    MissingToken { url: String },
}

/// The client side of an OAuth2 resource owner password grant.
///
/// Services that accept bearer tokens can be called without going through the browser login, as
/// long as the token endpoint allows this grant for the client.
#[derive(Clone, PartialEq)]
pub struct PasswordGrant {
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

impl Debug for PasswordGrant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordGrant")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

/// An access token to send as `Authorization: Bearer ...`.
#[derive(Clone, PartialEq)]
pub struct BearerToken(String);

impl Debug for BearerToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

impl PasswordGrant {
    pub fn new(token_url: Url, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            token_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: String::new(),
        }
    }

    /// Exchange `credential` for an access token.
    ///
    /// The time taken is recorded as `auth_flow_duration`, tagged with `flow:password_grant` and the
    /// outcome.
    pub async fn request_token(
        &self,
        client: &mut HttpClientInstrumented,
        credential: &Credential,
    ) -> Result<BearerToken, TokenError> {
        let started = Instant::now();
        let result = self.exchange(client, credential).await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        client.metrics().add_trend(
            builtin::AUTH_FLOW_DURATION,
            started.elapsed().as_secs_f64() * 1000.0,
            &tags([("flow", "password_grant"), ("outcome", outcome)]),
        );

        result
    }

    async fn exchange(
        &self,
        client: &mut HttpClientInstrumented,
        credential: &Credential,
    ) -> Result<BearerToken, TokenError> {
        let fields = [
            ("grant_type", "password"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
            ("username", credential.username.as_str()),
            ("password", credential.password.as_str()),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string()));

        let response = client
            .send(
                HttpRequest::post(self.token_url.as_str())
                    .form(&fields)
                    .name("auth_token"),
            )
            .await
            .map_err(TokenError::Request)?;

        if !response.status.is_success() {
            return Err(TokenError::Rejected {
                url: response.url.to_string(),
                status: response.status.as_u16(),
            });
        }

        let missing = || TokenError::MissingToken {
            url: response.url.to_string(),
        };
        response
            .json::<TokenResponse>()
            .map_err(|e| {
                log::debug!("Unreadable token response: {e}");
                missing()
            })?
            .access_token
            .filter(|t| !t.is_empty())
            .map(BearerToken::new)
            .ok_or_else(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_stay_out_of_debug_output() {
        let grant = PasswordGrant::new(
            Url::parse("https://auth.example.com/oauth/token").unwrap(),
            "sb-travel",
            "hunter2",
        );
        let token = BearerToken::new("eyJhbGciOi");

        assert!(!format!("{grant:?}").contains("hunter2"));
        assert!(!format!("{token:?}").contains("eyJhbGciOi"));
        assert_eq!(token.header_value(), "Bearer eyJhbGciOi");
    }
}
