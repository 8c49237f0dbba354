//! Shared HTTP plumbing for the polling and streaming transports.

use crate::config::Config;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use http::Request;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use std::time::Duration;

/// Name of the response header carrying the environment identifier.
pub const HEADER_ENVIRONMENT_ID: &str = "x-ld-envid";
/// Name of the response header requesting a downgrade to the v1 wire
/// protocol; only the exact value `"true"` triggers it.
pub const HEADER_FALLBACK: &str = "x-ld-fd-fallback";

pub type HttpsClient = hyper::Client<HttpsConnector<HttpConnector>, hyper::Body>;

pub fn new_https_client() -> HttpsClient {
    hyper::Client::builder().build(HttpsConnector::with_native_roots())
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request could not be constructed: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("request failed: {0}")]
    Io(#[from] hyper::Error),

    #[error("request timed out")]
    Timeout,
}

/// Whether a response status permits reconnecting. Only outright
/// authorization failures are terminal.
pub fn is_recoverable_status(status: u16) -> bool {
    status != 401 && status != 403
}

/// A GET request carrying the standard SDK headers from the config.
pub fn base_request(config: &Config, uri: &str) -> Result<Request<hyper::Body>, TransportError> {
    let mut builder = Request::get(uri)
        .header(AUTHORIZATION, config.sdk_key_header()?)
        .header(USER_AGENT, concat!("ServerCore/", env!("CARGO_PKG_VERSION")));
    for (name, value) in config.extra_headers() {
        builder = builder.header(name, value);
    }
    Ok(builder.body(hyper::Body::empty())?)
}

/// Response-header pair read on every connect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireDirectives {
    pub environment_id: Option<String>,
    pub revert_to_fdv1: bool,
}

pub fn read_directives(headers: &http::HeaderMap) -> WireDirectives {
    WireDirectives {
        environment_id: headers
            .get(HEADER_ENVIRONMENT_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        revert_to_fdv1: headers
            .get(HEADER_FALLBACK)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "true")
            .unwrap_or(false),
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// A connection held this long counts as healthy and resets the delay.
pub const HEALTHY_CONNECTION_AGE: Duration = Duration::from_secs(60);

/// Exponential reconnect delay: doubles per failure up to a cap, reset
/// after a healthy connection.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Build a `HeaderValue`, rejecting values with invalid characters.
pub fn header_value(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}

/// Static header names used for optional SDK metadata.
pub fn wrapper_header_name() -> HeaderName {
    HeaderName::from_static("x-launchdarkly-wrapper")
}

pub fn tags_header_name() -> HeaderName {
    HeaderName::from_static("x-launchdarkly-tags")
}

pub fn instance_id_header_name() -> HeaderName {
    HeaderName::from_static("x-launchdarkly-instance-id")
}
