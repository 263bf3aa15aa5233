use crate::GatewayError;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub static X_CLIENT_APP: HeaderName = HeaderName::from_static("x-client-app");
pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

// A list of the headers, using hypers actual HeaderName comparison
static HOP_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Controls which inbound headers reach the upstream.
#[derive(Debug, Clone)]
pub struct HeaderOptions {
    pub forward_user_agent: bool,
    pub forward_authorization: bool,
    pub forward_cookies: bool,
    /// Overrides the inbound `x-request-id`.
    pub request_id: Option<String>,
    pub client_app: Option<String>,
    /// Overrides the inbound `x-forwarded-for`.
    pub forwarded_for: Option<String>,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        HeaderOptions {
            forward_user_agent: true,
            forward_authorization: false,
            forward_cookies: false,
            request_id: None,
            client_app: None,
            forwarded_for: None,
        }
    }
}

pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Returns the inbound request id, if it is present and readable.
pub fn request_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn copy_header(inbound: &HeaderMap, outbound: &mut HeaderMap, name: &HeaderName) {
    if let Some(value) = inbound.get(name) {
        outbound.insert(name.clone(), value.clone());
    }
}

/// Builds the header set sent upstream from an explicit allow-list.
///
/// The inbound header map is never copied wholesale.
pub fn build_upstream_headers(
    inbound: &HeaderMap,
    options: &HeaderOptions,
) -> Result<HeaderMap, GatewayError> {
    debug!("Building upstream headers");

    let mut headers = HeaderMap::new();

    copy_header(inbound, &mut headers, &header::ACCEPT);
    copy_header(inbound, &mut headers, &header::CONTENT_TYPE);

    if options.forward_user_agent {
        copy_header(inbound, &mut headers, &header::USER_AGENT);
    }

    if options.forward_authorization {
        copy_header(inbound, &mut headers, &header::AUTHORIZATION);
    }

    if options.forward_cookies {
        copy_header(inbound, &mut headers, &header::COOKIE);
    }

    let request_id = match &options.request_id {
        Some(request_id) => request_id.clone(),
        None => request_id_from(inbound).unwrap_or_else(generate_request_id),
    };
    headers.insert(X_REQUEST_ID.clone(), HeaderValue::from_str(&request_id)?);

    if let Some(client_app) = &options.client_app {
        headers.insert(X_CLIENT_APP.clone(), HeaderValue::from_str(client_app)?);
    }

    match &options.forwarded_for {
        Some(forwarded_for) => {
            headers.insert(
                X_FORWARDED_FOR.clone(),
                HeaderValue::from_str(forwarded_for)?,
            );
        }
        None => copy_header(inbound, &mut headers, &X_FORWARDED_FOR),
    }

    Ok(headers)
}

/// Appends every upstream `set-cookie` entry to `target` individually.
///
/// `HeaderMap` keeps repeated headers apart, so multiple cookies are never
/// folded into one value.
pub fn apply_set_cookie_to_response(upstream: &HeaderMap, target: &mut HeaderMap) {
    for cookie in upstream.get_all(header::SET_COOKIE) {
        target.append(header::SET_COOKIE, cookie.clone());
    }
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    debug!("Removing hop headers");

    for header in HOP_HEADERS.iter() {
        headers.remove(header);
    }
}

fn remove_connection_headers(headers: &mut HeaderMap) {
    let names: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .collect();

    if !names.is_empty() {
        debug!("Removing connection headers");
    }

    for name in names {
        headers.remove(name.as_str());
    }
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    match HeaderValue::from_str(request_id) {
        Ok(value) => {
            headers.insert(X_REQUEST_ID.clone(), value);
        }
        Err(_) => warn!("Request id is not a valid header value, not echoing it"),
    }
}

/// Headers for a pass-through response.
pub(crate) fn proxied_response_headers(
    upstream: &HeaderMap,
    request_id: &str,
    forward_cookies: bool,
) -> HeaderMap {
    let mut headers = upstream.clone();

    remove_connection_headers(&mut headers);
    remove_hop_headers(&mut headers);
    headers.remove(header::SET_COOKIE);

    if forward_cookies {
        apply_set_cookie_to_response(upstream, &mut headers);
    }

    insert_request_id(&mut headers, request_id);

    headers
}

/// Headers for a problem response raised by the gateway itself.
pub(crate) fn problem_headers(request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_request_id(&mut headers, request_id);
    headers
}
