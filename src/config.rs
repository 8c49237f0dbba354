//! SDK configuration.
//!
//! Everything here is immutable after `build()`; invalid optional
//! settings are dropped with a warning rather than failing startup,
//! while hard limits (minimum poll interval) are clamped.

use crate::bigsegments::BigSegmentsConfig;
use crate::context::Reference;
use crate::transport::{
    header_value, instance_id_header_name, tags_header_name, wrapper_header_name, TransportError,
};
use http::header::{HeaderName, HeaderValue};
use regex::Regex;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_BASE_URI: &str = "https://sdk.launchdarkly.com";
pub const DEFAULT_STREAM_URI: &str = "https://stream.launchdarkly.com";
pub const DEFAULT_EVENTS_URI: &str = "https://events.launchdarkly.com";

/// Poll intervals below this are clamped up.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

fn payload_filter_pattern() -> Regex {
    Regex::new(r"^[a-zA-Z0-9][._\-a-zA-Z0-9]*$").unwrap()
}

fn tag_value_pattern() -> Regex {
    Regex::new(r"^[a-zA-Z0-9._-]{1,64}$").unwrap()
}

#[derive(Clone, Debug)]
pub struct Config {
    sdk_key: String,
    pub base_uri: String,
    pub stream_uri: String,
    pub events_uri: String,
    pub stream: bool,
    pub poll_interval: Duration,
    pub initial_reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub payload_filter_key: Option<String>,
    pub offline: bool,
    /// Daemon mode: serve from a persistent store kept fresh by some
    /// external process; no connections of our own.
    pub use_ldd: bool,
    pub big_segments: BigSegmentsConfig,
    pub all_attributes_private: bool,
    pub private_attributes: Vec<Reference>,
    application_tags: Option<String>,
    wrapper: Option<String>,
    instance_id: Option<String>,
}

impl Config {
    pub fn builder<K: Into<String>>(sdk_key: K) -> ConfigBuilder {
        ConfigBuilder::new(sdk_key)
    }

    pub fn sdk_key_header(&self) -> Result<HeaderValue, TransportError> {
        HeaderValue::from_str(&self.sdk_key)
            .map_err(|e| TransportError::InvalidRequest(e.into()))
    }

    /// Optional metadata headers sent on every request.
    pub fn extra_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut headers = Vec::new();
        if let Some(wrapper) = self.wrapper.as_deref().and_then(header_value) {
            headers.push((wrapper_header_name(), wrapper));
        }
        if let Some(tags) = self.application_tags.as_deref().and_then(header_value) {
            headers.push((tags_header_name(), tags));
        }
        if let Some(instance) = self.instance_id.as_deref().and_then(header_value) {
            headers.push((instance_id_header_name(), instance));
        }
        headers
    }

    /// Query-string suffix selecting a payload filter, when configured.
    fn filter_query(&self) -> Option<String> {
        self.payload_filter_key
            .as_ref()
            .map(|key| format!("filter={}", key))
    }

    pub fn streaming_endpoint(&self, basis: Option<&str>) -> String {
        self.endpoint(&self.stream_uri, "/sdk/stream", basis)
    }

    pub fn polling_endpoint(&self, basis: Option<&str>) -> String {
        self.endpoint(&self.base_uri, "/sdk/poll", basis)
    }

    pub fn polling_v1_endpoint(&self) -> String {
        self.endpoint(&self.base_uri, "/sdk/latest-all", None)
    }

    fn endpoint(&self, base: &str, path: &str, basis: Option<&str>) -> String {
        let mut uri = format!("{}{}", base.trim_end_matches('/'), path);
        let mut params = Vec::new();
        if let Some(filter) = self.filter_query() {
            params.push(filter);
        }
        if let Some(basis) = basis {
            params.push(format!("basis={}", basis));
        }
        if !params.is_empty() {
            uri.push('?');
            uri.push_str(&params.join("&"));
        }
        uri
    }
}

pub struct ConfigBuilder {
    sdk_key: String,
    base_uri: String,
    stream_uri: String,
    events_uri: String,
    stream: bool,
    poll_interval: Duration,
    initial_reconnect_delay: Duration,
    connect_timeout: Duration,
    response_timeout: Duration,
    payload_filter_key: Option<String>,
    offline: bool,
    use_ldd: bool,
    big_segments: BigSegmentsConfig,
    all_attributes_private: bool,
    private_attributes: Vec<Reference>,
    application_id: Option<String>,
    application_version: Option<String>,
    wrapper_name: Option<String>,
    wrapper_version: Option<String>,
    instance_id: Option<String>,
}

impl ConfigBuilder {
    pub fn new<K: Into<String>>(sdk_key: K) -> Self {
        Self {
            sdk_key: sdk_key.into(),
            base_uri: DEFAULT_BASE_URI.to_string(),
            stream_uri: DEFAULT_STREAM_URI.to_string(),
            events_uri: DEFAULT_EVENTS_URI.to_string(),
            stream: true,
            poll_interval: MIN_POLL_INTERVAL,
            initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            payload_filter_key: None,
            offline: false,
            use_ldd: false,
            big_segments: BigSegmentsConfig::default(),
            all_attributes_private: false,
            private_attributes: Vec::new(),
            application_id: None,
            application_version: None,
            wrapper_name: None,
            wrapper_version: None,
            instance_id: None,
        }
    }

    pub fn base_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.base_uri = uri.into();
        self
    }

    pub fn stream_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.stream_uri = uri.into();
        self
    }

    pub fn events_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.events_uri = uri.into();
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.initial_reconnect_delay = delay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn payload_filter_key<S: Into<String>>(mut self, key: S) -> Self {
        self.payload_filter_key = Some(key.into());
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn use_ldd(mut self, use_ldd: bool) -> Self {
        self.use_ldd = use_ldd;
        self
    }

    pub fn big_segments(mut self, config: BigSegmentsConfig) -> Self {
        self.big_segments = config;
        self
    }

    pub fn all_attributes_private(mut self, private: bool) -> Self {
        self.all_attributes_private = private;
        self
    }

    pub fn private_attributes<I: IntoIterator<Item = Reference>>(mut self, attrs: I) -> Self {
        self.private_attributes = attrs.into_iter().collect();
        self
    }

    pub fn application_info<S: Into<String>>(mut self, id: S, version: S) -> Self {
        self.application_id = Some(id.into());
        self.application_version = Some(version.into());
        self
    }

    pub fn wrapper<S: Into<String>>(mut self, name: S, version: S) -> Self {
        self.wrapper_name = Some(name.into());
        self.wrapper_version = Some(version.into());
        self
    }

    pub fn instance_id<S: Into<String>>(mut self, id: S) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn build(self) -> Config {
        let poll_interval = if self.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "poll interval below the minimum of {:?}, using the minimum",
                MIN_POLL_INTERVAL
            );
            MIN_POLL_INTERVAL
        } else {
            self.poll_interval
        };

        let payload_filter_key = self.payload_filter_key.filter(|key| {
            let valid = payload_filter_pattern().is_match(key);
            if !valid {
                warn!(filter = %key, "ignoring invalid payload filter key");
            }
            valid
        });

        let tag_pattern = tag_value_pattern();
        let mut tags = Vec::new();
        if let Some(id) = self.application_id {
            if tag_pattern.is_match(&id) {
                tags.push(format!("application-id/{}", id));
            } else {
                warn!(value = %id, "ignoring invalid application id");
            }
        }
        if let Some(version) = self.application_version {
            if tag_pattern.is_match(&version) {
                tags.push(format!("application-version/{}", version));
            } else {
                warn!(value = %version, "ignoring invalid application version");
            }
        }
        let application_tags = if tags.is_empty() {
            None
        } else {
            Some(tags.join(" "))
        };

        let wrapper = match (self.wrapper_name, self.wrapper_version) {
            (Some(name), Some(version)) => Some(format!("{}/{}", name, version)),
            (Some(name), None) => Some(name),
            _ => None,
        };

        Config {
            sdk_key: self.sdk_key,
            base_uri: self.base_uri,
            stream_uri: self.stream_uri,
            events_uri: self.events_uri,
            stream: self.stream,
            poll_interval,
            initial_reconnect_delay: self.initial_reconnect_delay,
            connect_timeout: self.connect_timeout,
            response_timeout: self.response_timeout,
            payload_filter_key,
            offline: self.offline,
            use_ldd: self.use_ldd,
            big_segments: self.big_segments,
            all_attributes_private: self.all_attributes_private,
            private_attributes: self.private_attributes,
            application_tags,
            wrapper,
            instance_id: self.instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_poll_interval() {
        let config = Config::builder("key")
            .poll_interval(Duration::from_secs(1))
            .build();
        assert_eq!(config.poll_interval, MIN_POLL_INTERVAL);

        let config = Config::builder("key")
            .poll_interval(Duration::from_secs(60))
            .build();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn invalid_payload_filter_is_dropped() {
        let config = Config::builder("key").payload_filter_key("ok-filter.1").build();
        assert_eq!(config.payload_filter_key.as_deref(), Some("ok-filter.1"));

        for bad in &["", "-starts-with-dash", ".dot", "has space", "ümlaut"] {
            let config = Config::builder("key").payload_filter_key(*bad).build();
            assert_eq!(config.payload_filter_key, None, "{:?}", bad);
        }
    }

    #[test]
    fn tags_header_is_assembled_and_validated() {
        let config = Config::builder("key")
            .application_info("my-app", "1.2.3")
            .build();
        let headers = config.extra_headers();
        let tags = headers
            .iter()
            .find(|(name, _)| name == &tags_header_name())
            .map(|(_, value)| value.to_str().unwrap().to_string())
            .unwrap();
        assert_eq!(tags, "application-id/my-app application-version/1.2.3");

        // an over-long value is dropped, the valid one kept
        let long = "x".repeat(65);
        let config = Config::builder("key")
            .application_info("my-app".to_string(), long)
            .build();
        let headers = config.extra_headers();
        let tags = headers
            .iter()
            .find(|(name, _)| name == &tags_header_name())
            .map(|(_, value)| value.to_str().unwrap().to_string())
            .unwrap();
        assert_eq!(tags, "application-id/my-app");
    }

    #[test]
    fn wrapper_and_instance_headers() {
        let config = Config::builder("key")
            .wrapper("rails-wrapper", "2.0")
            .instance_id("instance-7")
            .build();
        let headers = config.extra_headers();
        assert!(headers
            .iter()
            .any(|(name, value)| name == &wrapper_header_name()
                && value.to_str().unwrap() == "rails-wrapper/2.0"));
        assert!(headers
            .iter()
            .any(|(name, value)| name == &instance_id_header_name()
                && value.to_str().unwrap() == "instance-7"));
    }

    #[test]
    fn endpoints_carry_filter_and_basis() {
        let config = Config::builder("key")
            .base_uri("https://sdk.example.com/")
            .stream_uri("https://stream.example.com")
            .payload_filter_key("filter-a")
            .build();
        assert_eq!(
            config.streaming_endpoint(None),
            "https://stream.example.com/sdk/stream?filter=filter-a"
        );
        assert_eq!(
            config.streaming_endpoint(Some("s1")),
            "https://stream.example.com/sdk/stream?filter=filter-a&basis=s1"
        );
        assert_eq!(
            config.polling_endpoint(Some("state-token")),
            "https://sdk.example.com/sdk/poll?filter=filter-a&basis=state-token"
        );
        assert_eq!(
            config.polling_v1_endpoint(),
            "https://sdk.example.com/sdk/latest-all?filter=filter-a"
        );

        let plain = Config::builder("key").build();
        assert_eq!(
            plain.polling_endpoint(None),
            "https://sdk.launchdarkly.com/sdk/poll"
        );
    }
}
