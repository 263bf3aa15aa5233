//! Guards run on every forwarded request before anything leaves the process.
//!
//! Only literal IP hosts are checked against the blocked ranges. Domain names
//! are not resolved here, so a public name pointing at a private address is
//! not caught by [`validate_upstream_base_url`].

use crate::GatewayError;
use percent_encoding::percent_decode_str;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Validates an upstream base url and returns it parsed.
pub fn validate_upstream_base_url(base_url: &str) -> Result<Url, GatewayError> {
    let url = Url::parse(base_url)
        .map_err(|err| GatewayError::invalid_base_url(format!("not an absolute url: {err}")))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(GatewayError::invalid_base_url(format!(
                "unsupported scheme {scheme}"
            )))
        }
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(GatewayError::invalid_base_url("embedded credentials"));
    }

    match url.host() {
        None => return Err(GatewayError::invalid_base_url("missing host")),
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Err(GatewayError::invalid_base_url("localhost is not allowed"));
            }
        }
        Some(Host::Ipv4(addr)) => check_ip(IpAddr::V4(addr))?,
        Some(Host::Ipv6(addr)) => check_ip(IpAddr::V6(addr))?,
    }

    debug!("Upstream base url {} passed the ssrf guard", url);

    Ok(url)
}

fn check_ip(ip: IpAddr) -> Result<(), GatewayError> {
    if is_blocked_ip(&ip) {
        return Err(GatewayError::invalid_base_url(format!(
            "address {ip} is loopback, private or link-local"
        )));
    }

    Ok(())
}

fn is_blocked_ipv4(addr: &Ipv4Addr) -> bool {
    addr.is_loopback() || addr.is_unspecified() || addr.is_private() || addr.is_link_local()
}

fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => is_blocked_ipv4(addr),
        IpAddr::V6(addr) => {
            if let Some(mapped) = addr.to_ipv4_mapped() {
                return is_blocked_ipv4(&mapped);
            }

            addr.is_loopback() || is_unique_local(addr) || is_unicast_link_local(addr)
        }
    }
}

// fc00::/7
fn is_unique_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Rejects traversal and ambiguous encodings, then returns the decoded path.
///
/// Raw checks run before decoding so that encoded separators and dots can
/// never be smuggled past the `..` check.
pub fn normalize_and_validate_path(pathname: &str) -> Result<String, GatewayError> {
    if pathname.is_empty() {
        return Err(GatewayError::invalid_path("empty path"));
    }

    if pathname.contains('\\') {
        return Err(GatewayError::invalid_path("backslash in path"));
    }

    if pathname.contains("//") {
        return Err(GatewayError::invalid_path("empty path segment"));
    }

    if has_encoded_dot_or_separator(pathname) {
        return Err(GatewayError::invalid_path("encoded dot or separator"));
    }

    if has_malformed_escape(pathname) {
        return Err(GatewayError::invalid_path("malformed percent-encoding"));
    }

    let decoded = percent_decode_str(pathname)
        .decode_utf8()
        .map_err(|_| GatewayError::invalid_path("percent-encoding is not utf-8"))?;

    if decoded.contains("..") {
        return Err(GatewayError::invalid_path("traversal sequence"));
    }

    // `%252e` decodes to `%2e`, which a url parser would read as a dot again.
    if has_encoded_dot_or_separator(&decoded) {
        return Err(GatewayError::invalid_path("double-encoded dot or separator"));
    }

    Ok(decoded.into_owned())
}

fn has_encoded_dot_or_separator(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();

    ["%2e", "%2f", "%5c"]
        .iter()
        .any(|encoded| lowered.contains(encoded))
}

fn has_malformed_escape(pathname: &str) -> bool {
    let bytes = pathname.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'%' {
            let valid = bytes.len() > index + 2
                && bytes[index + 1].is_ascii_hexdigit()
                && bytes[index + 2].is_ascii_hexdigit();

            if !valid {
                return true;
            }

            index += 3;
        } else {
            index += 1;
        }
    }

    false
}

/// Normalizes `pathname` and checks it against the allowed prefixes.
///
/// The match is a plain string prefix: `/api` also admits `/apikey`.
pub fn assert_allowed_path<S: AsRef<str>>(
    pathname: &str,
    allowed_prefixes: &[S],
) -> Result<String, GatewayError> {
    let normalized = normalize_and_validate_path(pathname)?;

    if allowed_prefixes
        .iter()
        .any(|prefix| normalized.starts_with(prefix.as_ref()))
    {
        debug!("Path {} matched an allowed prefix", normalized);
        Ok(normalized)
    } else {
        Err(GatewayError::PathNotAllowed { path: normalized })
    }
}
