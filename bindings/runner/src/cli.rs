use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use http_client_instrumented::prelude::Url;
use squall_runner::prelude::{init_logging, parse_duration, ConfigError, SquallScenarioCli};

/// Command line for scenarios that log in through single sign-on.
#[derive(Parser, Debug, Clone)]
#[command(about, long_about = None)]
pub struct SsoScenarioCli {
    #[command(flatten)]
    pub squall: SquallScenarioCli,

    /// JSON file with the users to log in as, `{"users": [{"username": "...", "password": "..."}]}`
    #[clap(long)]
    pub credentials: PathBuf,

    /// Timeout for each HTTP request, including each redirect hop
    #[clap(long, value_parser = parse_timeout, default_value = "60s")]
    pub http_timeout: Duration,

    /// OAuth2 token endpoint for scenarios that call the service with a bearer token
    #[clap(long, requires = "client_id")]
    pub token_url: Option<Url>,

    /// OAuth2 client id, used with --token-url
    #[clap(long)]
    pub client_id: Option<String>,

    /// OAuth2 client secret, used with --token-url
    #[clap(long)]
    pub client_secret: Option<String>,
}

fn parse_timeout(s: &str) -> Result<Duration, ConfigError> {
    parse_duration(s)
}

/// Initialise logging and parse the command line.
pub fn init() -> SsoScenarioCli {
    init_logging();

    SsoScenarioCli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_options_are_flattened() {
        let cli = SsoScenarioCli::try_parse_from([
            "travel",
            "--connection-string",
            "https://travel.example.com",
            "--credentials",
            "users.json",
            "--stage",
            "10s:2",
            "--http-timeout",
            "5s",
        ])
        .unwrap();

        assert_eq!(
            cli.squall.connection_string.as_deref(),
            Some("https://travel.example.com")
        );
        assert_eq!(cli.squall.stage.len(), 1);
        assert_eq!(cli.credentials, PathBuf::from("users.json"));
        assert_eq!(cli.http_timeout, Duration::from_secs(5));
    }

    #[test]
    fn http_timeout_defaults_to_a_minute() {
        let cli = SsoScenarioCli::try_parse_from(["travel", "--credentials", "users.json"]).unwrap();

        assert_eq!(cli.http_timeout, Duration::from_secs(60));
    }

    #[test]
    fn token_options_go_together() {
        let cli = SsoScenarioCli::try_parse_from([
            "bookings",
            "--credentials",
            "users.json",
            "--token-url",
            "https://auth.example.com/oauth/token",
            "--client-id",
            "sb-sflight",
            "--client-secret",
            "s3cret",
        ])
        .unwrap();

        assert_eq!(
            cli.token_url.as_ref().map(Url::as_str),
            Some("https://auth.example.com/oauth/token")
        );
        assert_eq!(cli.client_id.as_deref(), Some("sb-sflight"));
        assert_eq!(cli.client_secret.as_deref(), Some("s3cret"));

        assert!(SsoScenarioCli::try_parse_from([
            "bookings",
            "--credentials",
            "users.json",
            "--token-url",
            "https://auth.example.com/oauth/token",
        ])
        .is_err());
    }

    #[test]
    fn credentials_are_required() {
        assert!(SsoScenarioCli::try_parse_from(["travel"]).is_err());
    }
}
