#![doc = include_str!("../README.md")]

#[macro_use]
extern crate tracing;

mod config;
mod error;
mod forward;
mod guard;
mod handler;
mod headers;

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};

pub use config::{GatewayConfig, UpstreamConfig};
pub use error::{
    is_problem_content_type, parse_problem, to_problem_response, GatewayError, ProblemDetails,
    PROBLEM_JSON_CONTENT_TYPE,
};
pub use forward::{forward_to_upstream, ForwardPolicy, UpstreamClient};
pub use guard::{assert_allowed_path, normalize_and_validate_path, validate_upstream_base_url};
pub use handler::{Gateway, RouteParams};
pub use headers::{
    apply_set_cookie_to_response, build_upstream_headers, generate_request_id, request_id_from,
    HeaderOptions, X_CLIENT_APP, X_FORWARDED_FOR, X_REQUEST_ID,
};

/// Boxed error used at the transport seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of a request sent to an upstream.
pub type UpstreamBody = UnsyncBoxBody<Bytes, BoxError>;

/// Body of every response produced by the gateway, streamed or buffered.
pub type GatewayBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn empty_upstream_body() -> UpstreamBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

#[cfg(feature = "__bench")]
pub mod benches {
    use url::Url;

    pub fn upstream_url(base: &Url, normalized_path: &str, query: Option<&str>) {
        crate::handler::upstream_url(base, normalized_path, query).unwrap();
    }
}
