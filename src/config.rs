use crate::{guard::validate_upstream_base_url, GatewayError};
use serde::Deserialize;
use std::collections::HashMap;

/// Process-wide gateway configuration. Built once, then only read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamConfig>,
    pub allowed_methods: Option<Vec<String>>,
    pub max_body_bytes: Option<u64>,
    /// Sent upstream as `x-client-app`.
    pub client_app: Option<String>,
    /// Hint for the hosting runtime, unused by the gateway itself.
    pub runtime: Option<String>,
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upstream(mut self, key: impl Into<String>, upstream: UpstreamConfig) -> Self {
        self.upstreams.insert(key.into(), upstream);
        self
    }

    pub fn with_allowed_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: u64) -> Self {
        self.max_body_bytes = Some(max_body_bytes);
        self
    }

    pub fn with_client_app(mut self, client_app: impl Into<String>) -> Self {
        self.client_app = Some(client_app.into());
        self
    }

    pub fn upstream(&self, key: &str) -> Option<&UpstreamConfig> {
        self.upstreams.get(key)
    }

    /// Runs the ssrf guard over every configured upstream.
    ///
    /// Useful at startup; requests are still checked individually.
    pub fn validate(&self) -> Result<(), GatewayError> {
        for (key, upstream) in &self.upstreams {
            if let Err(err) = validate_upstream_base_url(&upstream.base_url) {
                error!("Upstream {} has an invalid base url: {}", key, err);
                return Err(err);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default)]
    pub allowed_path_prefixes: Vec<String>,
    #[serde(default)]
    pub forward_cookies: bool,
    #[serde(default)]
    pub forward_auth_header: bool,
    pub timeout_ms: Option<u64>,
    /// Overrides [`GatewayConfig::allowed_methods`].
    pub allowed_methods: Option<Vec<String>>,
    /// Overrides [`GatewayConfig::max_body_bytes`].
    pub max_body_bytes: Option<u64>,
}

impl UpstreamConfig {
    pub fn new<I, S>(base_url: impl Into<String>, allowed_path_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        UpstreamConfig {
            base_url: base_url.into(),
            allowed_path_prefixes: allowed_path_prefixes.into_iter().map(Into::into).collect(),
            forward_cookies: false,
            forward_auth_header: false,
            timeout_ms: None,
            allowed_methods: None,
            max_body_bytes: None,
        }
    }

    pub fn with_forward_cookies(mut self, forward_cookies: bool) -> Self {
        self.forward_cookies = forward_cookies;
        self
    }

    pub fn with_forward_auth_header(mut self, forward_auth_header: bool) -> Self {
        self.forward_auth_header = forward_auth_header;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_allowed_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: u64) -> Self {
        self.max_body_bytes = Some(max_body_bytes);
        self
    }
}
