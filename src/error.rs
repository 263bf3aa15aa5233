use crate::{full_body, BoxError, GatewayBody};
use hyper::{
    header::{self, HeaderMap, HeaderValue, InvalidHeaderValue},
    http::uri::InvalidUri,
    Response, StatusCode,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PROBLEM_JSON_CONTENT_TYPE: &str = "application/problem+json; charset=utf-8";

const ABOUT_BLANK: &str = "about:blank";

/// Failure raised while processing a single gateway request.
///
/// Every variant maps onto exactly one problem response, see
/// [`GatewayError::to_problem`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("method {method} is not allowed for this upstream")]
    MethodNotAllowed { method: String },

    #[error("declared body size of {declared} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { declared: u64, limit: u64 },

    #[error("upstream did not respond within {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64 },

    #[error("path {path} is not allowed for this upstream")]
    PathNotAllowed { path: String },

    #[error("invalid path: {reason}")]
    InvalidPath { reason: &'static str },

    #[error("invalid upstream base url: {reason}")]
    InvalidBaseUrl { reason: String },

    #[error("could not build upstream url: {0}")]
    InvalidUpstreamUrl(#[from] InvalidUri),

    #[error("could not build forwarded header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("could not build upstream request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] BoxError),
}

impl GatewayError {
    pub(crate) fn invalid_path(reason: &'static str) -> Self {
        GatewayError::InvalidPath { reason }
    }

    pub(crate) fn invalid_base_url(reason: impl Into<String>) -> Self {
        GatewayError::InvalidBaseUrl {
            reason: reason.into(),
        }
    }

    /// Machine readable code of this error.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MethodNotAllowed { .. } => "MethodNotAllowed",
            GatewayError::PayloadTooLarge { .. } => "PayloadTooLarge",
            GatewayError::UpstreamTimeout { .. } => "UpstreamTimeout",
            GatewayError::PathNotAllowed { .. } => "PathNotAllowed",
            GatewayError::InvalidPath { .. } => "InvalidPath",
            GatewayError::InvalidBaseUrl { .. } => "InvalidBaseUrl",
            GatewayError::InvalidUpstreamUrl(_)
            | GatewayError::InvalidHeader(_)
            | GatewayError::Request(_) => "Internal",
            GatewayError::Upstream(_) => "UpstreamFailure",
        }
    }

    /// Diagnostic key/value pairs, meant for logs rather than clients.
    pub fn details(&self) -> BTreeMap<&'static str, String> {
        let mut details = BTreeMap::new();

        match self {
            GatewayError::MethodNotAllowed { method } => {
                details.insert("method", method.clone());
            }
            GatewayError::PayloadTooLarge { declared, limit } => {
                details.insert("declared", declared.to_string());
                details.insert("limit", limit.to_string());
            }
            GatewayError::UpstreamTimeout { timeout_ms } => {
                details.insert("timeoutMs", timeout_ms.to_string());
            }
            GatewayError::PathNotAllowed { path } => {
                details.insert("path", path.clone());
            }
            GatewayError::InvalidPath { reason } => {
                details.insert("reason", (*reason).to_owned());
            }
            GatewayError::InvalidBaseUrl { reason } => {
                details.insert("reason", reason.clone());
            }
            GatewayError::InvalidUpstreamUrl(err) => {
                details.insert("source", err.to_string());
            }
            GatewayError::InvalidHeader(err) => {
                details.insert("source", err.to_string());
            }
            GatewayError::Request(err) => {
                details.insert("source", err.to_string());
            }
            GatewayError::Upstream(err) => {
                details.insert("source", err.to_string());
            }
        }

        details
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::PathNotAllowed { .. } => StatusCode::FORBIDDEN,
            GatewayError::InvalidPath { .. } | GatewayError::InvalidBaseUrl { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::InvalidUpstreamUrl(_)
            | GatewayError::InvalidHeader(_)
            | GatewayError::Request(_)
            | GatewayError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Converts the error into the problem document sent to the client.
    ///
    /// Internal failures get a generic detail so upstream and transport
    /// internals never reach the client.
    pub fn to_problem(&self, trace_id: Option<&str>) -> ProblemDetails {
        let detail = match self {
            GatewayError::InvalidUpstreamUrl(_)
            | GatewayError::InvalidHeader(_)
            | GatewayError::Request(_)
            | GatewayError::Upstream(_) => "Unexpected gateway error".to_owned(),
            _ => self.to_string(),
        };

        let problem = ProblemDetails::new(self.status(), detail);

        match trace_id {
            Some(trace_id) => problem.with_trace_id(trace_id),
            None => problem,
        }
    }
}

fn about_blank() -> String {
    ABOUT_BLANK.to_owned()
}

/// RFC 7807 problem document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type", default = "about_blank")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ProblemDetails {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        ProblemDetails {
            type_uri: about_blank(),
            title: status.canonical_reason().unwrap_or("Unknown Status").to_owned(),
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            errors: None,
            trace_id: None,
        }
    }

    pub fn with_errors(mut self, errors: BTreeMap<String, Vec<String>>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    fn is_shape_valid(&self) -> bool {
        (100..=599).contains(&self.status) && !self.title.is_empty()
    }
}

/// Serializes `problem` into a response whose status equals `problem.status`.
///
/// A problem carrying an unusable status is replaced by a generic 500 so the
/// envelope and the response never disagree.
pub fn to_problem_response(problem: ProblemDetails, mut headers: HeaderMap) -> Response<GatewayBody> {
    let (status, problem) = match StatusCode::from_u16(problem.status) {
        Ok(status) if problem.is_shape_valid() => (status, problem),
        _ => {
            warn!("Replacing problem with unusable status {}", problem.status);

            let mut fallback = ProblemDetails::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unexpected gateway error",
            );
            fallback.trace_id = problem.trace_id;
            (StatusCode::INTERNAL_SERVER_ERROR, fallback)
        }
    };

    let body = serde_json::to_vec(&problem).unwrap_or_else(|_| b"{}".to_vec());

    // The body is always re-serialized here.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROBLEM_JSON_CONTENT_TYPE),
    );

    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;

    response
}

pub fn is_problem_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("application/problem+json")
        })
        .unwrap_or(false)
}

/// Parses a problem document returned by an upstream.
///
/// Returns `None` unless the content type announces a problem and the body is
/// a shape-valid document.
pub fn parse_problem(headers: &HeaderMap, body: &[u8]) -> Option<ProblemDetails> {
    if !is_problem_content_type(headers) {
        return None;
    }

    match serde_json::from_slice::<ProblemDetails>(body) {
        Ok(problem) if problem.is_shape_valid() => Some(problem),
        Ok(problem) => {
            debug!("Upstream problem has invalid shape, status {}", problem.status);
            None
        }
        Err(err) => {
            debug!("Upstream problem body is not valid json: {}", err);
            None
        }
    }
}
