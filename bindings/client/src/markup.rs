//! Structural extraction from HTML responses.
//!
//! This is not an HTML parser. It finds tags and attributes with patterns, which is enough for the
//! machine generated pages that identity providers return between redirects.

use std::borrow::Cow;
use std::string::FromUtf8Error;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::HttpError;
use crate::http::HttpRequest;

static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("meta pattern is valid"));

static FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<form\b(?P<attrs>[^>]*)>(?P<body>.*?)(?:</form\s*>|$)")
        .expect("form pattern is valid")
});

static INPUT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<input\b[^>]*>").expect("input pattern is valid"));

static TEXTAREA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<textarea\b(?P<attrs>[^>]*)>(?P<body>.*?)</textarea\s*>")
        .expect("textarea pattern is valid")
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)(?P<name>[a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)'|(?P<bare>[^\s"'=<>`]+)))?"#,
    )
    .expect("attribute pattern is valid")
});

static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:#(?P<dec>[0-9]+)|#[xX](?P<hex>[0-9a-fA-F]+)|(?P<named>[a-zA-Z]+));")
        .expect("entity pattern is valid")
});

/// Percent escapes of the characters that `decodeURI` leaves encoded: `; / ? : @ & = + $ , #`.
static RESERVED_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%(?:2[346BCFbcf]|3[ABDFabdf]|40)").expect("reserved escape pattern is valid")
});

/// The first `<form>` in a page.
#[derive(Debug, Clone, PartialEq)]
pub struct Form {
    pub action: Option<String>,
    pub method: String,
    /// Successful controls in document order.
    pub fields: Vec<(String, String)>,
}

impl Form {
    /// Build the request that submitting this form would send.
    ///
    /// The action is resolved against `page_url`, the URL the form was served from. Overrides
    /// replace the value of an existing field or are appended as new fields.
    pub fn to_request(
        &self,
        page_url: &Url,
        overrides: &[(&str, &str)],
    ) -> Result<HttpRequest, HttpError> {
        let mut fields = self.fields.clone();
        for (name, value) in overrides {
            match fields.iter_mut().find(|(field, _)| field.as_str() == *name) {
                Some(field) => field.1 = value.to_string(),
                None => fields.push((name.to_string(), value.to_string())),
            }
        }

        let action = match self.action.as_deref().map(str::trim) {
            Some(action) if !action.is_empty() => {
                page_url
                    .join(action)
                    .map_err(|source| HttpError::InvalidUrl {
                        url: action.to_string(),
                        source,
                    })?
            }
            _ => page_url.clone(),
        };

        let request = if self.method.eq_ignore_ascii_case("post") {
            HttpRequest::post(action.as_str()).form(&fields)
        } else {
            let mut target = action;
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&fields)
                .finish();
            target.set_query(if query.is_empty() { None } else { Some(query.as_str()) });
            HttpRequest::get(target.as_str())
        };

        Ok(request)
    }
}

/// The decoded `content` of the first `<meta name="...">` tag with the given name.
pub fn meta_content(body: &str, name: &str) -> Option<String> {
    META_TAG.find_iter(body).find_map(|tag| {
        let attrs = attributes(tag.as_str());
        let tag_name = attrs.iter().find(|(k, _)| k == "name").map(|(_, v)| v)?;
        if !tag_name.eq_ignore_ascii_case(name) {
            return None;
        }

        attrs
            .into_iter()
            .find(|(k, _)| k == "content")
            .map(|(_, v)| v)
    })
}

/// The first form in the page with its successful controls.
///
/// Submit buttons, file inputs, disabled controls and unchecked checkboxes or radios are not part
/// of the submission.
pub fn first_form(body: &str) -> Option<Form> {
    let caps = FORM.captures(body)?;
    let form_attrs = attributes(&caps["attrs"]);
    let form_body = &caps["body"];

    let attr = |name: &str| {
        form_attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let mut fields = Vec::new();
    for input in INPUT_TAG.find_iter(form_body) {
        let attrs = attributes(input.as_str());
        let get = |name: &str| attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
        let has = |name: &str| attrs.iter().any(|(k, _)| k == name);

        let Some(field_name) = get("name").filter(|n| !n.is_empty()) else {
            continue;
        };
        if has("disabled") {
            continue;
        }

        let input_type = get("type").unwrap_or("text").to_ascii_lowercase();
        match input_type.as_str() {
            "submit" | "button" | "reset" | "image" | "file" => continue,
            "checkbox" | "radio" if !has("checked") => continue,
            "checkbox" | "radio" => {
                fields.push((field_name.to_string(), get("value").unwrap_or("on").to_string()))
            }
            _ => fields.push((field_name.to_string(), get("value").unwrap_or("").to_string())),
        }
    }

    for textarea in TEXTAREA.captures_iter(form_body) {
        let attrs = attributes(&textarea["attrs"]);
        if let Some((_, name)) = attrs.iter().find(|(k, _)| k == "name") {
            fields.push((name.clone(), decode_entities(&textarea["body"]).into_owned()));
        }
    }

    Some(Form {
        action: attr("action"),
        method: attr("method").unwrap_or_else(|| "GET".to_string()).to_uppercase(),
        fields,
    })
}

/// Decode a URI the way `decodeURI` does: escapes of reserved characters stay encoded, everything
/// else is decoded.
pub fn decode_uri(input: &str) -> Result<String, FromUtf8Error> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(reserved) = RESERVED_ESCAPE.find(rest) {
        out.push_str(&urlencoding::decode(&rest[..reserved.start()])?);
        out.push_str(reserved.as_str());
        rest = &rest[reserved.end()..];
    }
    out.push_str(&urlencoding::decode(rest)?);

    Ok(out)
}

/// Attributes of a tag, names lowercased and values entity decoded. Attributes without a value
/// get an empty one.
fn attributes(tag: &str) -> Vec<(String, String)> {
    // Skip `<tagname`
    let inner = tag
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim_end_matches('/');
    let inner = inner
        .find(|c: char| c.is_whitespace())
        .map(|i| &inner[i..])
        .unwrap_or("");

    ATTRIBUTE
        .captures_iter(inner)
        .map(|caps| {
            let value = caps
                .name("dq")
                .or_else(|| caps.name("sq"))
                .or_else(|| caps.name("bare"))
                .map(|m| decode_entities(m.as_str()).into_owned())
                .unwrap_or_default();
            (caps["name"].to_ascii_lowercase(), value)
        })
        .collect()
}

fn decode_entities(s: &str) -> Cow<'_, str> {
    ENTITY.replace_all(s, |caps: &regex::Captures| {
        let decoded = if let Some(dec) = caps.name("dec") {
            dec.as_str().parse::<u32>().ok().and_then(char::from_u32)
        } else if let Some(hex) = caps.name("hex") {
            u32::from_str_radix(hex.as_str(), 16)
                .ok()
                .and_then(char::from_u32)
        } else {
            match &caps["named"] {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => None,
            }
        };

        match decoded {
            Some(c) => c.to_string(),
            None => caps[0].to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reqwest::Method;

    const LOGIN_PAGE: &str = r#"<!DOCTYPE html>
<html><head><title>Sign in</title></head>
<body>
  <form id="logOnForm" method="post" action="/saml2/idp/sso/accounts.example.com?x=1&amp;y=2">
    <input type="hidden" name="authenticity_token" value="tok/en=="/>
    <input type="hidden" name="xsrfProtection" value='xsrf'>
    <input type="text" name="j_username" value="">
    <input type="password" name="j_password">
    <input type="checkbox" name="rememberMe">
    <input type="checkbox" name="agree" checked>
    <input type="submit" name="logOnFormSubmit" value="Log On">
    <input type="text" name="ignored" value="x" disabled>
  </form>
</body></html>"#;

    #[test]
    fn read_meta_redirect() {
        let body = r#"<html><head>
            <meta name="viewport" content="width=device-width">
            <META NAME="redirect" CONTENT="https://idp.example.com/saml2?SAMLRequest=a%2Bb&amp;RelayState=c">
        </head></html>"#;

        assert_eq!(
            meta_content(body, "redirect"),
            Some("https://idp.example.com/saml2?SAMLRequest=a%2Bb&RelayState=c".to_string())
        );
        assert_eq!(meta_content(body, "missing"), None);
    }

    #[test]
    fn first_form_collects_successful_controls() {
        let form = first_form(LOGIN_PAGE).unwrap();

        assert_eq!(form.method, "POST");
        assert_eq!(
            form.action.as_deref(),
            Some("/saml2/idp/sso/accounts.example.com?x=1&y=2")
        );
        assert_eq!(
            form.fields,
            vec![
                ("authenticity_token".to_string(), "tok/en==".to_string()),
                ("xsrfProtection".to_string(), "xsrf".to_string()),
                ("j_username".to_string(), "".to_string()),
                ("j_password".to_string(), "".to_string()),
                ("agree".to_string(), "on".to_string()),
            ]
        );
    }

    #[test]
    fn form_request_applies_overrides_and_resolves_action() {
        let form = first_form(LOGIN_PAGE).unwrap();
        let page = Url::parse("https://accounts.example.com/saml2/idp/sso?sp=app").unwrap();

        let request = form
            .to_request(&page, &[("j_username", "user@example.com"), ("j_password", "s3cret&")])
            .unwrap();

        assert_eq!(request.method(), &Method::POST);
        assert_eq!(
            request.url(),
            "https://accounts.example.com/saml2/idp/sso/accounts.example.com?x=1&y=2"
        );
        let body = String::from_utf8(request.body_bytes().unwrap().to_vec()).unwrap();
        assert!(body.contains("j_username=user%40example.com"));
        assert!(body.contains("j_password=s3cret%26"));
        assert!(body.contains("authenticity_token=tok%2Fen%3D%3D"));
    }

    #[test]
    fn form_without_action_or_method_submits_to_page_with_get() {
        let form = first_form(r#"<form><input name="a" value="1"></form>"#).unwrap();
        let page = Url::parse("https://app.example.com/continue?old=1").unwrap();

        let request = form.to_request(&page, &[]).unwrap();

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.url(), "https://app.example.com/continue?a=1");
    }

    #[test]
    fn no_form_in_page() {
        assert!(first_form("<html><body>nothing</body></html>").is_none());
    }

    #[test]
    fn decode_uri_keeps_reserved_escapes() {
        assert_eq!(
            decode_uri("https://idp.example.com/a%20b?x=%2Fsite%3F&y=%C3%A9%25").unwrap(),
            "https://idp.example.com/a b?x=%2Fsite%3F&y=é%"
        );
        assert!(decode_uri("%FF").is_err());
    }

    #[test]
    fn numeric_entities_are_decoded() {
        assert_eq!(decode_entities("a&#47;b&#x2F;c&unknown;"), "a/b/c&unknown;");
    }
}
