/// Failure to complete an HTTP exchange.
///
/// A response with an error status is not an [HttpError], it is returned as a normal response for
/// the caller to check.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Invalid URL [{url}]: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Request to [{url}] timed out")]
    Timeout { url: String },
    #[error("Request to [{url}] failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Gave up after {max} redirects at [{url}]")]
    TooManyRedirects { url: String, max: usize },
    #[error("Could not decode the response body from [{url}]: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Could not encode the request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("No form found in the response from [{0}]")]
    NoForm(String),
    #[error("Could not build the HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}
