use crate::{
    empty_upstream_body, headers::build_upstream_headers, BoxError, GatewayBody, GatewayError,
    HeaderOptions, UpstreamBody,
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{
    body::Body,
    header::{self, HeaderValue, HOST},
    Method, Request, Response, Uri,
};
use hyper_util::client::legacy::{connect::Connect, Client};
use std::time::Duration;

/// Transport used to reach upstreams.
///
/// Implementations must not follow redirects.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, request: Request<UpstreamBody>) -> Result<Response<GatewayBody>, BoxError>;
}

#[async_trait]
impl<C> UpstreamClient for Client<C, UpstreamBody>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    async fn send(&self, request: Request<UpstreamBody>) -> Result<Response<GatewayBody>, BoxError> {
        let response = self
            .request(request)
            .await
            .map_err(|err| Box::new(err) as BoxError)?;

        Ok(response.map(|body| body.boxed_unsync()))
    }
}

/// Per-call forwarding policy, resolved from the gateway and upstream config.
#[derive(Debug, Clone, Default)]
pub struct ForwardPolicy {
    /// Empty means every method is allowed.
    pub allowed_methods: Vec<String>,
    pub max_body_bytes: Option<u64>,
    pub timeout: Option<Duration>,
    pub headers: HeaderOptions,
}

fn is_bodyless(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

fn check_method(method: &Method, allowed_methods: &[String]) -> Result<(), GatewayError> {
    if allowed_methods.is_empty() {
        return Ok(());
    }

    let method = method.as_str().to_ascii_uppercase();

    if allowed_methods
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&method))
    {
        Ok(())
    } else {
        Err(GatewayError::MethodNotAllowed { method })
    }
}

// Only the declared length is checked, a streamed body is not counted.
fn check_declared_size<B>(request: &Request<B>, max_body_bytes: Option<u64>) -> Result<(), GatewayError> {
    let Some(limit) = max_body_bytes else {
        return Ok(());
    };

    if is_bodyless(request.method()) {
        return Ok(());
    }

    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    match declared {
        Some(declared) if declared > limit => {
            Err(GatewayError::PayloadTooLarge { declared, limit })
        }
        _ => Ok(()),
    }
}

/// Forwards `request` to `upstream_uri` under `policy`.
///
/// A single attempt is made. When the timeout elapses the in-flight call is
/// dropped, which also drops its timer.
pub async fn forward_to_upstream<U, B>(
    client: &U,
    request: Request<B>,
    upstream_uri: Uri,
    policy: &ForwardPolicy,
) -> Result<Response<GatewayBody>, GatewayError>
where
    U: UpstreamClient + ?Sized,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    check_method(request.method(), &policy.allowed_methods)?;
    check_declared_size(&request, policy.max_body_bytes)?;

    let mut headers = build_upstream_headers(request.headers(), &policy.headers)?;

    if let Some(authority) = upstream_uri.authority() {
        headers.insert(HOST, HeaderValue::from_str(authority.as_str())?);
    }

    let (parts, body) = request.into_parts();

    let body = if is_bodyless(&parts.method) {
        empty_upstream_body()
    } else {
        body.map_err(Into::<BoxError>::into).boxed_unsync()
    };

    info!("Forwarding {} request to {}", parts.method, upstream_uri);

    let mut outbound = Request::builder()
        .method(parts.method)
        .uri(upstream_uri)
        .body(body)?;
    *outbound.headers_mut() = headers;

    let call = client.send(outbound);

    let result = match policy.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_elapsed) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!("Upstream call aborted after {}ms", timeout_ms);

                return Err(GatewayError::UpstreamTimeout { timeout_ms });
            }
        },
        None => call.await,
    };

    result.map_err(GatewayError::Upstream)
}
