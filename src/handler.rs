use crate::{
    error::{parse_problem, to_problem_response},
    forward::{forward_to_upstream, ForwardPolicy},
    full_body,
    guard::{assert_allowed_path, validate_upstream_base_url},
    headers::{generate_request_id, problem_headers, proxied_response_headers, request_id_from},
    is_problem_content_type, BoxError, GatewayBody, GatewayConfig, GatewayError, HeaderOptions,
    ProblemDetails, UpstreamClient, UpstreamConfig,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{body::Body, ext::ReasonPhrase, Request, Response, StatusCode, Uri};
use percent_encoding::percent_decode_str;
use std::{sync::Arc, time::Duration};
use url::Url;

/// Route parameters supplied by the host router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteParams {
    pub upstream_key: String,
    /// Remaining path segments, joined with `/`.
    pub path: Vec<String>,
    /// Overrides the inbound `x-forwarded-for` header.
    pub forwarded_for: Option<String>,
}

impl RouteParams {
    pub fn new<I, S>(upstream_key: impl Into<String>, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RouteParams {
            upstream_key: upstream_key.into(),
            path: path.into_iter().map(Into::into).collect(),
            forwarded_for: None,
        }
    }

    pub fn with_forwarded_for(mut self, forwarded_for: impl Into<String>) -> Self {
        self.forwarded_for = Some(forwarded_for.into());
        self
    }

    fn pathname(&self) -> String {
        format!("/{}", self.path.join("/"))
    }
}

/// Appends the normalized path to the base path and copies the query verbatim.
///
/// The resulting path must decode back to exactly the joined path; anything
/// the url parser rewrote (dot segments, escapes) is rejected.
pub(crate) fn upstream_url(
    base: &Url,
    normalized_path: &str,
    query: Option<&str>,
) -> Result<Uri, GatewayError> {
    let mut url = base.clone();

    let path = format!("{}{}", base.path().trim_end_matches('/'), normalized_path);
    url.set_path(&path.replace('%', "%25"));

    if percent_decode_str(url.path()).decode_utf8_lossy() != path {
        warn!("Upstream path {} was rewritten to {}", path, url.path());
        return Err(GatewayError::invalid_path("path changed while building upstream url"));
    }

    url.set_query(query);
    url.set_fragment(None);

    debug!("Built upstream url {}", url);

    Ok(url.as_str().parse()?)
}

/// Entry point for the host router.
///
/// Holds the immutable configuration and the transport. Each call to
/// [`Gateway::handle`] is independent.
pub struct Gateway<U> {
    config: Arc<GatewayConfig>,
    client: U,
}

impl<U: UpstreamClient> Gateway<U> {
    pub fn new(config: GatewayConfig, client: U) -> Self {
        Self::with_shared_config(Arc::new(config), client)
    }

    pub fn with_shared_config(config: Arc<GatewayConfig>, client: U) -> Self {
        Gateway { config, client }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Handles one inbound request. Always produces a response; every
    /// failure becomes a problem document.
    pub async fn handle<B>(&self, request: Request<B>, params: RouteParams) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        info!(
            "Received gateway call {} {} for upstream {}",
            request.method(),
            request.uri(),
            params.upstream_key
        );

        let request_id = request_id_from(request.headers()).unwrap_or_else(generate_request_id);

        let Some(upstream) = self.config.upstream(&params.upstream_key) else {
            warn!("Unknown upstream {}", params.upstream_key);

            let problem = ProblemDetails::new(
                StatusCode::NOT_FOUND,
                format!("Unknown upstream '{}'", params.upstream_key),
            )
            .with_trace_id(request_id.as_str());

            return to_problem_response(problem, problem_headers(&request_id));
        };

        match self.forward(request, upstream, &params, &request_id).await {
            Ok(response) => response,
            Err(err) => {
                if err.status().is_server_error() {
                    error!("Gateway call {} failed: {}", request_id, err);
                } else {
                    warn!(
                        "Gateway call {} rejected with {}: {:?}",
                        request_id,
                        err.code(),
                        err.details()
                    );
                }

                to_problem_response(
                    err.to_problem(Some(&request_id)),
                    problem_headers(&request_id),
                )
            }
        }
    }

    fn policy_for(
        &self,
        upstream: &UpstreamConfig,
        params: &RouteParams,
        request_id: &str,
    ) -> ForwardPolicy {
        ForwardPolicy {
            allowed_methods: upstream
                .allowed_methods
                .as_ref()
                .or(self.config.allowed_methods.as_ref())
                .cloned()
                .unwrap_or_default(),
            max_body_bytes: upstream.max_body_bytes.or(self.config.max_body_bytes),
            timeout: upstream.timeout_ms.map(Duration::from_millis),
            headers: HeaderOptions {
                forward_user_agent: true,
                forward_authorization: upstream.forward_auth_header,
                forward_cookies: upstream.forward_cookies,
                request_id: Some(request_id.to_owned()),
                client_app: self.config.client_app.clone(),
                forwarded_for: params.forwarded_for.clone(),
            },
        }
    }

    async fn forward<B>(
        &self,
        request: Request<B>,
        upstream: &UpstreamConfig,
        params: &RouteParams,
        request_id: &str,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let base = validate_upstream_base_url(&upstream.base_url)?;
        let normalized = assert_allowed_path(&params.pathname(), &upstream.allowed_path_prefixes)?;
        let uri = upstream_url(&base, &normalized, request.uri().query())?;

        let policy = self.policy_for(upstream, params, request_id);
        let response = forward_to_upstream(&self.client, request, uri, &policy).await?;

        shape_response(response, request_id, upstream.forward_cookies).await
    }
}

async fn shape_response(
    response: Response<GatewayBody>,
    request_id: &str,
    forward_cookies: bool,
) -> Result<Response<GatewayBody>, GatewayError> {
    let (mut parts, mut body) = response.into_parts();

    if is_problem_content_type(&parts.headers) {
        let bytes = body
            .collect()
            .await
            .map_err(|err| GatewayError::Upstream(Box::new(err)))?
            .to_bytes();

        if let Some(problem) = parse_problem(&parts.headers, &bytes) {
            debug!("Passing through upstream problem with status {}", problem.status);

            let headers = proxied_response_headers(&parts.headers, request_id, forward_cookies);
            return Ok(to_problem_response(problem, headers));
        }

        body = full_body(bytes);
    }

    if !(parts.status.is_success() || parts.status.is_redirection()) {
        debug!("Wrapping upstream status {} into a problem", parts.status);

        let reason = parts
            .extensions
            .get::<ReasonPhrase>()
            .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
            .or_else(|| parts.status.canonical_reason())
            .unwrap_or("Unknown Status");

        let problem = ProblemDetails::new(
            parts.status,
            format!("Upstream responded with {} {}", parts.status.as_u16(), reason),
        )
        .with_trace_id(request_id);

        let headers = proxied_response_headers(&parts.headers, request_id, forward_cookies);
        return Ok(to_problem_response(problem, headers));
    }

    debug!("Responding with upstream body");

    parts.headers = proxied_response_headers(&parts.headers, request_id, forward_cookies);

    Ok(Response::from_parts(parts, body))
}
