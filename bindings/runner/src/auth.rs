use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use http_client_instrumented::prelude::{
    decode_uri, meta_content, CookieJar, HttpClientInstrumented, HttpError, HttpRequest, HttpResponse,
    Url,
};
use squall_runner::prelude::{builtin, tags, MetricsCollector};

use crate::credentials::Credential;
use crate::extract::{ExtractionError, Extracted, FromExtracted, PatternExtractor};

/// Environment variable that turns on step by step logging of the login flow.
pub const TRACE_AUTH_ENV: &str = "SQUALL_TRACE_AUTH";

/// Matches the script on the entry page that stores the signature cookie and then navigates to
/// the identity provider.
pub const DEFAULT_TOKEN_PATTERN: &str = r#"signature=(?P<signature>.*?);path=/;Secure;SameSite=None;";location="(?P<location>[^"]*)""#;

#[derive(Debug, thiserror::Error)]
pub enum AuthFlowError {
    #[error("The entry page did not contain the session token: {0}")]
    MissingToken(#[source] ExtractionError),
    #[error("Malformed redirect at [{url}]: {reason}")]
    MalformedRedirect { url: String, reason: String },
    #[error("No login form in the response from [{0}]")]
    MissingForm(String),
    #[error("Request failed during [{step}]: {source}")]
    Request {
        step: &'static str,
        #[source]
        source: HttpError,
    },
    #[error("Login did not produce a complete session: {0}")]
    IncompleteSession(String),
}

/// Names and fixed values used by the login flow.
#[derive(Debug, Clone)]
pub struct AuthFlowConfig {
    pub token_pattern: String,
    pub signature_cookie: String,
    pub fragment_cookie: String,
    pub location_cookie: String,
    /// Where the identity provider sends the user after login, already URL encoded.
    pub post_login_path: String,
    pub redirect_meta_name: String,
    /// Cookie that opts out of the passwordless device registration prompt.
    pub skip_device_cookie: String,
    pub username_field: String,
    pub password_field: String,
    pub session_cookie: String,
    pub affinity_cookie: String,
}

impl Default for AuthFlowConfig {
    fn default() -> Self {
        Self {
            token_pattern: DEFAULT_TOKEN_PATTERN.to_string(),
            signature_cookie: "signature".to_string(),
            fragment_cookie: "fragmentAfterLogin".to_string(),
            location_cookie: "locationAfterLogin".to_string(),
            post_login_path: "%2Fsite".to_string(),
            redirect_meta_name: "redirect".to_string(),
            skip_device_cookie: "skipPasswordlessAuthnDeviceConfig".to_string(),
            username_field: "j_username".to_string(),
            password_field: "j_password".to_string(),
            session_cookie: "JSESSIONID".to_string(),
            affinity_cookie: "__VCAP_ID__".to_string(),
        }
    }
}

/// The authenticated cookie state, scoped to the application origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    origin: Url,
    cookies: BTreeMap<String, String>,
}

impl Session {
    pub fn new(origin: Url, cookies: BTreeMap<String, String>) -> Self {
        Self { origin, cookies }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// A fresh cookie jar holding a copy of this session's cookies.
    pub fn to_jar(&self) -> CookieJar {
        let mut jar = CookieJar::new();
        for (name, value) in &self.cookies {
            jar.set(&self.origin, name, value);
        }
        jar
    }
}

struct EntryToken {
    signature: String,
    location: String,
}

impl FromExtracted for EntryToken {
    fn from_extracted(extracted: &Extracted) -> Result<Self, ExtractionError> {
        Ok(Self {
            signature: extracted.require("signature")?.to_string(),
            location: extracted.require("location")?.to_string(),
        })
    }
}

/// Drives the redirect, cookie and form exchange between the application and its identity
/// provider to log a user in.
///
/// Each call to [AuthFlowSimulator::establish] starts with an empty cookie jar, so calls are
/// independent of each other. Nothing is retried, any failure ends the attempt.
#[derive(Debug, Clone)]
pub struct AuthFlowSimulator {
    client: reqwest::Client,
    metrics: Arc<MetricsCollector>,
    config: AuthFlowConfig,
    extractor: PatternExtractor,
    log_level: log::Level,
}

impl AuthFlowSimulator {
    pub fn new(
        client: reqwest::Client,
        metrics: Arc<MetricsCollector>,
        config: AuthFlowConfig,
    ) -> Result<Self, regex::Error> {
        let extractor = PatternExtractor::new(&config.token_pattern)?;
        Ok(Self {
            client,
            metrics,
            config,
            extractor,
            log_level: log::Level::Debug,
        })
    }

    /// Log every step and redirect at `info` instead of `debug`.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.log_level = if trace {
            log::Level::Info
        } else {
            log::Level::Debug
        };
        self
    }

    /// Whether [TRACE_AUTH_ENV] asks for tracing.
    pub fn trace_from_env() -> bool {
        std::env::var(TRACE_AUTH_ENV)
            .map(|v| is_truthy(&v))
            .unwrap_or(false)
    }

    /// Log in as `credential`, starting from the application's `entry_url`.
    pub async fn establish(
        &self,
        entry_url: &Url,
        credential: &Credential,
    ) -> Result<Session, AuthFlowError> {
        let started = Instant::now();
        let result = self.run_flow(entry_url, credential).await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.metrics.add_trend(
            builtin::AUTH_FLOW_DURATION,
            started.elapsed().as_secs_f64() * 1000.0,
            &tags([("outcome", outcome)]),
        );

        result
    }

    async fn run_flow(
        &self,
        entry_url: &Url,
        credential: &Credential,
    ) -> Result<Session, AuthFlowError> {
        let config = &self.config;
        let mut client = HttpClientInstrumented::new(self.client.clone(), self.metrics.clone())
            .with_hop_log_level(self.log_level);

        self.step(1, "open the application", entry_url);
        let entry = client
            .send(HttpRequest::get(entry_url.as_str()).name("auth_entry"))
            .await
            .map_err(request_error("open the application"))?;

        let token: EntryToken = self
            .extractor
            .extract_as(&entry.body)
            .map_err(AuthFlowError::MissingToken)?;
        log::log!(self.log_level, "Auth step 2: found signature and redirect target");

        let jar = client.jar_mut();
        jar.set(entry_url, &config.signature_cookie, &token.signature);
        jar.set(entry_url, &config.fragment_cookie, "");
        jar.set(entry_url, &config.location_cookie, &config.post_login_path);
        log::log!(self.log_level, "Auth step 3: seeded bookkeeping cookies");

        let target = join(&entry.url, &token.location)?;
        self.step(4, "follow the token redirect", &target);
        let bridge = client
            .send(HttpRequest::get(target.as_str()).name("auth_bridge"))
            .await
            .map_err(request_error("follow the token redirect"))?;

        let redirect = meta_content(&bridge.body, &config.redirect_meta_name).ok_or_else(|| {
            AuthFlowError::MalformedRedirect {
                url: bridge.url.to_string(),
                reason: format!("no meta [{}] in the page", config.redirect_meta_name),
            }
        })?;
        let redirect = decode_uri(&redirect).map_err(|e| AuthFlowError::MalformedRedirect {
            url: bridge.url.to_string(),
            reason: format!("redirect is not valid UTF-8 once decoded: {e}"),
        })?;
        let redirect = join(&bridge.url, &redirect)?;

        self.step(5, "open the identity provider", &redirect);
        let landing = client
            .send(HttpRequest::get(redirect.as_str()).name("auth_idp"))
            .await
            .map_err(request_error("open the identity provider"))?;
        let login = submit(&mut client, &landing, &[], "continue to the login form").await?;

        self.step(6, "opt out of device registration", &login.url);
        client
            .jar_mut()
            .set(&login.url, &config.skip_device_cookie, "true");

        self.step(7, "submit credentials", &login.url);
        let done = submit(
            &mut client,
            &login,
            &[
                (config.username_field.as_str(), credential.username.as_str()),
                (config.password_field.as_str(), credential.password.as_str()),
            ],
            "submit credentials",
        )
        .await?;

        self.step(8, "validate the session", &done.url);
        self.validate(entry_url, &done, client.jar())
    }

    fn validate(
        &self,
        entry_url: &Url,
        done: &HttpResponse,
        jar: &CookieJar,
    ) -> Result<Session, AuthFlowError> {
        if done.status.as_u16() != 200 {
            return Err(AuthFlowError::IncompleteSession(format!(
                "landing page [{}] returned status {}",
                done.url, done.status
            )));
        }

        if done.url.origin() != entry_url.origin() {
            return Err(AuthFlowError::IncompleteSession(format!(
                "landed on [{}] which is outside of [{}]",
                done.url,
                entry_url.origin().ascii_serialization()
            )));
        }

        let cookies = jar.cookies_for_url(&done.url);
        for required in [&self.config.session_cookie, &self.config.affinity_cookie] {
            if cookies.get(required).map_or(true, |v| v.is_empty()) {
                return Err(AuthFlowError::IncompleteSession(format!(
                    "cookie [{required}] is missing"
                )));
            }
        }

        let mut origin = done.url.clone();
        origin.set_path("/");
        origin.set_query(None);
        origin.set_fragment(None);

        log::log!(
            self.log_level,
            "Auth step 9: session established for {origin} with {} cookies",
            cookies.len()
        );

        Ok(Session::new(origin, cookies))
    }

    fn step(&self, n: u8, what: &str, url: &Url) {
        log::log!(self.log_level, "Auth step {n}: {what} at {url}");
    }
}

async fn submit(
    client: &mut HttpClientInstrumented,
    page: &HttpResponse,
    overrides: &[(&str, &str)],
    step: &'static str,
) -> Result<HttpResponse, AuthFlowError> {
    match client.submit_form(page, overrides).await {
        Ok(response) => Ok(response),
        Err(HttpError::NoForm(url)) => Err(AuthFlowError::MissingForm(url)),
        Err(source) => Err(AuthFlowError::Request { step, source }),
    }
}

fn request_error(step: &'static str) -> impl Fn(HttpError) -> AuthFlowError {
    move |source| AuthFlowError::Request { step, source }
}

fn join(base: &Url, location: &str) -> Result<Url, AuthFlowError> {
    base.join(location)
        .map_err(|e| AuthFlowError::MalformedRedirect {
            url: base.to_string(),
            reason: format!("invalid redirect target [{location}]: {e}"),
        })
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(is_truthy(v), "{v}");
        }
        for v in ["", "0", "false", "off", "no", "debug"] {
            assert!(!is_truthy(v), "{v}");
        }
    }

    #[test]
    fn default_token_pattern_reads_entry_script() {
        let body = r#"<html><script>document.cookie="signature=Zm9v%2Bbar;path=/;Secure;SameSite=None;";location="https://idp.example.com/oauth/authorize?client_id=abc"</script></html>"#;
        let extractor = PatternExtractor::new(DEFAULT_TOKEN_PATTERN).unwrap();

        let token: EntryToken = extractor.extract_as(body).unwrap();

        assert_eq!(token.signature, "Zm9v%2Bbar");
        assert_eq!(
            token.location,
            "https://idp.example.com/oauth/authorize?client_id=abc"
        );
    }

    #[test]
    fn session_copies_into_independent_jars() {
        let origin = Url::parse("https://app.example.com/").unwrap();
        let session = Session::new(
            origin.clone(),
            BTreeMap::from([
                ("JSESSIONID".to_string(), "s1".to_string()),
                ("__VCAP_ID__".to_string(), "v1".to_string()),
            ]),
        );

        let mut first = session.to_jar();
        let second = session.to_jar();
        first.set(&origin, "JSESSIONID", "changed");

        assert_eq!(second.get(&origin, "JSESSIONID"), Some("s1".to_string()));
        assert_eq!(session.cookie("JSESSIONID"), Some("s1"));
    }
}
