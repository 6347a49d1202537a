mod cookie;
mod error;
mod http;
mod markup;

pub mod prelude {
    pub use crate::cookie::CookieJar;
    pub use crate::error::HttpError;
    pub use crate::http::{
        build_client, HttpClientInstrumented, HttpRequest, HttpResponse, RedirectStep,
        DEFAULT_MAX_REDIRECTS,
    };
    pub use crate::markup::{decode_uri, first_form, meta_content, Form};

    // Types from the HTTP stack that show up in this client's API.
    pub use reqwest::{header::HeaderMap, Method};
    pub use url::Url;
}
