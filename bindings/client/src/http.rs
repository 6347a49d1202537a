use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use squall_instruments::{builtin, MetricsCollector, Tags};
use url::Url;

use crate::cookie::{CookieJar, SetCookie};
use crate::error::HttpError;
use crate::markup::first_form;

pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Build the shared HTTP client.
///
/// Redirects and cookies are handled by [HttpClientInstrumented] so that every hop is measured
/// and uses the worker's own cookie jar. The client is cheap to clone and shares its connection
/// pool between clones.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, HttpError> {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .timeout(timeout)
        .build()
        .map_err(HttpError::Client)
}

/// A request to send with [HttpClientInstrumented::send].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Body>,
    name: Option<String>,
    tags: Tags,
}

#[derive(Debug, Clone)]
struct Body {
    content_type: &'static str,
    bytes: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            name: None,
            tags: Tags::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Send `value` as a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, HttpError> {
        self.body = Some(Body {
            content_type: "application/json",
            bytes: serde_json::to_vec(value).map_err(HttpError::Encode)?,
        });
        Ok(self)
    }

    /// Send the fields as an `application/x-www-form-urlencoded` body.
    pub fn form(mut self, fields: &[(String, String)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.body = Some(Body {
            content_type: "application/x-www-form-urlencoded",
            bytes: encoded.into_bytes(),
        });
        self
    }

    /// Group this request under `name` in the metrics instead of its URL path.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Add a tag to the metrics recorded for this request.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_ref().map(|b| b.bytes.as_slice())
    }
}

/// One redirect that was followed on the way to a response.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectStep {
    pub url: Url,
    pub status: u16,
    pub location: Url,
    /// Names of the cookies that this hop set.
    pub cookies_set: Vec<String>,
}

/// The final response after all redirects were followed.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    /// The URL that produced this response, after redirects.
    pub url: Url,
    pub headers: HeaderMap,
    pub body: String,
    pub redirects: Vec<RedirectStep>,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_str(&self.body).map_err(|source| HttpError::Decode {
            url: self.url.to_string(),
            source,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// An HTTP client that records `http_reqs`, `http_req_duration` and `http_req_failed` for every
/// request it sends, including each redirect hop.
///
/// Each instance owns a [CookieJar]. Clones of the underlying [reqwest::Client] can be shared
/// between instances, so a worker typically gets its own [HttpClientInstrumented] built from one
/// shared client.
#[derive(Debug, Clone)]
pub struct HttpClientInstrumented {
    client: reqwest::Client,
    jar: CookieJar,
    metrics: Arc<MetricsCollector>,
    max_redirects: usize,
    hop_log_level: log::Level,
}

struct Hop {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    cookies_set: Vec<String>,
}

impl HttpClientInstrumented {
    pub fn new(client: reqwest::Client, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            client,
            jar: CookieJar::new(),
            metrics,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            hop_log_level: log::Level::Debug,
        }
    }

    /// Start from an existing set of cookies.
    pub fn with_jar(mut self, jar: CookieJar) -> Self {
        self.jar = jar;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Log each request and redirect hop at this level.
    pub fn with_hop_log_level(mut self, level: log::Level) -> Self {
        self.hop_log_level = level;
        self
    }

    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }

    pub fn jar_mut(&mut self) -> &mut CookieJar {
        &mut self.jar
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub async fn get(&mut self, url: &str) -> Result<HttpResponse, HttpError> {
        self.send(HttpRequest::get(url)).await
    }

    /// Send a request, following redirects up to the configured limit.
    ///
    /// 301, 302 and 303 redirects continue as a `GET` without a body. 307 and 308 repeat the
    /// method and body.
    pub async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut url = Url::parse(&request.url).map_err(|source| HttpError::InvalidUrl {
            url: request.url.clone(),
            source,
        })?;
        let mut method = request.method.clone();
        let mut body = request.body.clone();
        let mut redirects = Vec::new();

        loop {
            log::log!(self.hop_log_level, "{method} {url}");
            let hop = self.send_once(&method, &url, body.as_ref(), &request).await?;

            let location = hop
                .status
                .is_redirection()
                .then(|| hop.headers.get(LOCATION))
                .flatten()
                .and_then(|l| l.to_str().ok());

            let Some(location) = location else {
                return Ok(HttpResponse {
                    status: hop.status,
                    url,
                    headers: hop.headers,
                    body: String::from_utf8_lossy(&hop.body).into_owned(),
                    redirects,
                });
            };

            if redirects.len() >= self.max_redirects {
                return Err(HttpError::TooManyRedirects {
                    url: url.to_string(),
                    max: self.max_redirects,
                });
            }

            let next = url.join(location).map_err(|source| HttpError::InvalidUrl {
                url: location.to_string(),
                source,
            })?;
            log::log!(
                self.hop_log_level,
                "Redirect {} from {url} to {next}",
                hop.status.as_u16()
            );

            if !matches!(
                hop.status,
                StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
            ) {
                if method != Method::HEAD {
                    method = Method::GET;
                }
                body = None;
            }

            redirects.push(RedirectStep {
                url: url.clone(),
                status: hop.status.as_u16(),
                location: next.clone(),
                cookies_set: hop.cookies_set,
            });
            url = next;
        }
    }

    /// Submit the first form in `response`, see [crate::markup::Form::to_request].
    pub async fn submit_form(
        &mut self,
        response: &HttpResponse,
        overrides: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        let form = first_form(&response.body)
            .ok_or_else(|| HttpError::NoForm(response.url.to_string()))?;
        let request = form.to_request(&response.url, overrides)?;
        self.send(request).await
    }

    async fn send_once(
        &mut self,
        method: &Method,
        url: &Url,
        body: Option<&Body>,
        request: &HttpRequest,
    ) -> Result<Hop, HttpError> {
        let mut builder = self.client.request(method.clone(), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(cookies) = self.jar.cookie_header(url) {
            if let Ok(value) = HeaderValue::from_str(&cookies) {
                builder = builder.header(COOKIE, value);
            }
        }
        if let Some(body) = body {
            builder = builder
                .header(CONTENT_TYPE, body.content_type)
                .body(body.bytes.clone());
        }

        let mut tags = request.tags.clone();
        tags.insert("method".to_string(), method.to_string());
        tags.insert(
            "name".to_string(),
            request
                .name
                .clone()
                .unwrap_or_else(|| url.path().to_string()),
        );

        let started = Instant::now();
        let result = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let set_cookies = response
                .cookies()
                .map(|c| SetCookie::from_reqwest(&c))
                .collect::<Vec<_>>();
            let body = response.bytes().await?.to_vec();
            Ok::<_, reqwest::Error>((status, headers, set_cookies, body))
        }
        .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok((status, headers, set_cookies, body)) => {
                tags.insert("status".to_string(), status.as_u16().to_string());
                self.record(&tags, elapsed_ms, status.as_u16() >= 400);

                let cookies_set = self.jar.store(url, set_cookies);
                Ok(Hop {
                    status,
                    headers,
                    body,
                    cookies_set,
                })
            }
            Err(source) => {
                tags.insert("status".to_string(), "0".to_string());
                self.record(&tags, elapsed_ms, true);

                if source.is_timeout() {
                    Err(HttpError::Timeout {
                        url: url.to_string(),
                    })
                } else {
                    Err(HttpError::Transport {
                        url: url.to_string(),
                        source,
                    })
                }
            }
        }
    }

    fn record(&self, tags: &Tags, elapsed_ms: f64, failed: bool) {
        self.metrics.add_counter(builtin::HTTP_REQS, 1.0, tags);
        self.metrics
            .add_trend(builtin::HTTP_REQ_DURATION, elapsed_ms, tags);
        self.metrics.add_rate(builtin::HTTP_REQ_FAILED, failed, tags);
    }
}
