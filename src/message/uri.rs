use anyhow::{Context, Result, anyhow, bail};
use http::Uri;

/// Normalize a request-line target into an absolute URI.
///
/// Proxies receive absolute-form targets (`http://host/path`); origin-form
/// targets (`/path`) are resolved against the `Host` header so the filter
/// pipeline always observes an absolute URI.
pub fn absolutize(target: &str, host_header: Option<&str>) -> Result<Uri> {
    if target.starts_with('/') {
        let host = host_header
            .ok_or_else(|| anyhow!("origin-form request target '{target}' without Host header"))?;
        let (host, port) = split_host_port(host)?;
        let authority = match port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        return Uri::builder()
            .scheme("http")
            .authority(authority)
            .path_and_query(target)
            .build()
            .with_context(|| format!("invalid request target '{target}'"));
    }

    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;
    if uri.scheme_str().is_none() || uri.authority().is_none() {
        bail!("request target '{target}' is neither absolute nor origin-form");
    }
    Ok(uri)
}

/// Split `host[:port]`, rejecting empty hosts and malformed ports. Bracketed
/// IPv6 literals keep their brackets in the returned host.
pub fn split_host_port(value: &str) -> Result<(&str, Option<u16>)> {
    let value = value.trim();
    if value.is_empty() {
        bail!("host must not be empty");
    }
    if let Some(rest) = value.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 literal '{value}'"))?;
        let host = &value[..end + 2];
        let remainder = &rest[end + 1..];
        if remainder.is_empty() {
            return Ok((host, None));
        }
        let port = remainder
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("invalid host '{value}'"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in '{value}'"))?;
        return Ok((host, Some(port)));
    }
    match value.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                bail!("host must not be empty");
            }
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in '{value}'"))?;
            Ok((host, Some(port)))
        }
        None => Ok((value, None)),
    }
}

/// Host and effective port of an absolute URI (scheme default when omitted).
pub fn host_port(uri: &Uri) -> Result<(&str, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("URI '{uri}' has no host"))?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok((host, port))
}

/// Path plus query in origin form, as written on the upstream request line.
pub fn origin_form(uri: &Uri) -> String {
    match uri.path_and_query() {
        Some(pq) => {
            let s = pq.as_str();
            if s.is_empty() {
                "/".to_string()
            } else {
                s.to_string()
            }
        }
        None => "/".to_string(),
    }
}
