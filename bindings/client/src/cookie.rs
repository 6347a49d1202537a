use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use url::Url;

/// Cookie store for one session, keyed by domain.
///
/// Host-only cookies are stored under the exact host name. Cookies that were set with a `Domain`
/// attribute are stored under `.domain` and match that domain and all of its subdomains. Paths and
/// ports are not used for matching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookieJar {
    cookies: BTreeMap<String, BTreeMap<String, String>>,
}

/// A cookie as read from a `Set-Cookie` header.
#[derive(Debug, Clone)]
pub(crate) struct SetCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub max_age: Option<Duration>,
    pub expires: Option<SystemTime>,
}

impl SetCookie {
    pub(crate) fn from_reqwest(cookie: &reqwest::cookie::Cookie<'_>) -> Self {
        Self {
            name: cookie.name().to_string(),
            value: cookie.value().to_string(),
            domain: cookie.domain().map(str::to_string),
            max_age: cookie.max_age(),
            expires: cookie.expires(),
        }
    }

    fn is_expired(&self) -> bool {
        if let Some(max_age) = self.max_age {
            return max_age.is_zero();
        }

        self.expires
            .map(|expires| expires <= SystemTime::now())
            .unwrap_or(false)
    }
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a host-only cookie for the host of `url`.
    pub fn set(&mut self, url: &Url, name: &str, value: &str) {
        let Some(host) = host_of(url) else {
            log::warn!("Cannot set cookie [{name}] for [{url}] which has no host");
            return;
        };

        self.cookies
            .entry(host)
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    /// Remove a cookie from every domain that applies to `url`.
    pub fn remove(&mut self, url: &Url, name: &str) {
        let Some(host) = host_of(url) else {
            return;
        };

        for (domain, cookies) in self.cookies.iter_mut() {
            if domain_matches(domain, &host) {
                cookies.remove(name);
            }
        }
    }

    /// The value of cookie `name` as it would be sent to `url`.
    pub fn get(&self, url: &Url, name: &str) -> Option<String> {
        self.cookies_for_url(url).remove(name)
    }

    /// All cookies that would be sent to `url`.
    ///
    /// When the same name is stored both host-only and for a parent domain, the host-only value is
    /// the one returned.
    pub fn cookies_for_url(&self, url: &Url) -> BTreeMap<String, String> {
        let Some(host) = host_of(url) else {
            return BTreeMap::new();
        };

        let mut matched = BTreeMap::new();

        // Least specific first so that more specific domains overwrite.
        let mut domains = self
            .cookies
            .iter()
            .filter(|(domain, _)| domain_matches(domain, &host))
            .collect::<Vec<_>>();
        domains.sort_by_key(|(domain, _)| (!domain.starts_with('.'), domain.len()));

        for (_, cookies) in domains {
            matched.extend(cookies.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        matched
    }

    /// The value for a `Cookie` request header, or `None` if no cookies apply to `url`.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let cookies = self.cookies_for_url(url);
        if cookies.is_empty() {
            return None;
        }

        Some(
            cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.values().all(BTreeMap::is_empty)
    }

    /// Apply cookies received in a response from `url`. Returns the names of the cookies that were
    /// stored.
    pub(crate) fn store(&mut self, url: &Url, set_cookies: Vec<SetCookie>) -> Vec<String> {
        let Some(host) = host_of(url) else {
            return Vec::new();
        };

        let mut stored = Vec::new();
        for cookie in set_cookies {
            let key = match &cookie.domain {
                Some(domain) => {
                    let domain = format!(".{}", domain.trim_start_matches('.').to_lowercase());
                    if !domain_matches(&domain, &host) {
                        log::debug!(
                            "Ignoring cookie [{}] for domain [{domain}] set by [{host}]",
                            cookie.name
                        );
                        continue;
                    }
                    domain
                }
                None => host.clone(),
            };

            let cookies = self.cookies.entry(key).or_default();
            if cookie.is_expired() {
                cookies.remove(&cookie.name);
            } else {
                stored.push(cookie.name.clone());
                cookies.insert(cookie.name, cookie.value);
            }
        }

        stored
    }
}

fn host_of(url: &Url) -> Option<String> {
    url.host_str().map(str::to_lowercase)
}

fn domain_matches(domain: &str, host: &str) -> bool {
    match domain.strip_prefix('.') {
        Some(parent) => host == parent || host.ends_with(domain),
        None => host == domain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn set_cookie(name: &str, value: &str) -> SetCookie {
        SetCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: None,
            max_age: None,
            expires: None,
        }
    }

    #[test]
    fn host_only_cookies_stay_on_their_host() {
        let mut jar = CookieJar::new();
        jar.set(&url("https://app.example.com/site"), "signature", "abc");

        assert_eq!(
            jar.get(&url("https://app.example.com/other?x=1"), "signature"),
            Some("abc".to_string())
        );
        assert_eq!(jar.get(&url("https://idp.example.com/"), "signature"), None);
        assert_eq!(jar.get(&url("https://example.com/"), "signature"), None);
    }

    #[test]
    fn domain_cookies_match_subdomains() {
        let mut jar = CookieJar::new();
        let mut cookie = set_cookie("__VCAP_ID__", "instance-1");
        cookie.domain = Some("example.com".to_string());
        jar.store(&url("https://app.example.com/"), vec![cookie]);

        assert!(jar.get(&url("https://example.com/"), "__VCAP_ID__").is_some());
        assert!(jar.get(&url("https://deep.app.example.com/"), "__VCAP_ID__").is_some());
        assert!(jar.get(&url("https://notexample.com/"), "__VCAP_ID__").is_none());
    }

    #[test]
    fn foreign_domain_attribute_is_ignored() {
        let mut jar = CookieJar::new();
        let mut cookie = set_cookie("tracker", "1");
        cookie.domain = Some("other.org".to_string());

        let stored = jar.store(&url("https://app.example.com/"), vec![cookie]);

        assert!(stored.is_empty());
        assert!(jar.is_empty());
    }

    #[test]
    fn host_only_value_wins_over_domain_value() {
        let mut jar = CookieJar::new();
        let mut cookie = set_cookie("lang", "de");
        cookie.domain = Some("example.com".to_string());
        jar.store(&url("https://app.example.com/"), vec![cookie]);
        jar.set(&url("https://app.example.com/"), "lang", "en");

        assert_eq!(
            jar.get(&url("https://app.example.com/"), "lang"),
            Some("en".to_string())
        );
        assert_eq!(jar.get(&url("https://example.com/"), "lang"), Some("de".to_string()));
    }

    #[test]
    fn expired_cookie_is_removed() {
        let mut jar = CookieJar::new();
        let target = url("https://app.example.com/");
        jar.set(&target, "JSESSIONID", "s1");

        let mut cleared = set_cookie("JSESSIONID", "");
        cleared.max_age = Some(Duration::ZERO);
        jar.store(&target, vec![cleared]);
        assert_eq!(jar.get(&target, "JSESSIONID"), None);

        jar.set(&target, "JSESSIONID", "s2");
        let mut past = set_cookie("JSESSIONID", "");
        past.expires = Some(SystemTime::UNIX_EPOCH);
        jar.store(&target, vec![past]);
        assert_eq!(jar.get(&target, "JSESSIONID"), None);
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let mut jar = CookieJar::new();
        let target = url("https://app.example.com/");
        jar.set(&target, "b", "2");
        jar.set(&target, "a", "1");

        assert_eq!(jar.cookie_header(&target), Some("a=1; b=2".to_string()));
        assert_eq!(jar.cookie_header(&url("https://elsewhere.com/")), None);
    }

    #[test]
    fn remove_clears_all_matching_domains() {
        let mut jar = CookieJar::new();
        let target = url("https://app.example.com/");
        jar.set(&target, "x", "1");
        let mut cookie = set_cookie("x", "2");
        cookie.domain = Some("example.com".to_string());
        jar.store(&target, vec![cookie]);

        jar.remove(&target, "x");

        assert_eq!(jar.get(&target, "x"), None);
    }
}
