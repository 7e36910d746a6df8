use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::header::HeaderName;
use http::{Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use crate::message::Headers;
use crate::message::headers::HeaderLine;

use super::line::{read_line_with_timeout, trim_line_ending};

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

/// Read one request head from the client. `idle_timeout` bounds the wait for
/// the first byte (keep-alive idle); `header_timeout` bounds each subsequent
/// line read. Returns `None` on clean EOF before a request line.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "request header limit must be greater than zero"
    );

    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let mut request_line = String::new();
    let line_bytes = read_line_with_timeout(
        reader,
        &mut request_line,
        header_timeout,
        peer,
        max_header_bytes,
    )
    .await?;
    if line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    let request_line = trim_line_ending(&request_line);
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?
        .to_string();
    let version = match parts.next() {
        // Version-less request line: an antique (HTTP/0.9) client.
        None => Version::HTTP_09,
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some("HTTP/0.9") => Version::HTTP_09,
        Some(other) => bail!("invalid HTTP version '{other}'"),
    };
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let mut headers = Headers::new();
    if version != Version::HTTP_09 {
        let mut consumed = line_bytes;
        let mut header_line = String::new();
        loop {
            let remaining = max_header_bytes
                .checked_sub(consumed)
                .filter(|remaining| *remaining > 0)
                .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
            let read =
                read_line_with_timeout(reader, &mut header_line, header_timeout, peer, remaining)
                    .await?;
            if read == 0 {
                bail!("connection closed during request headers from {peer}");
            }
            consumed += read;
            let trimmed = trim_line_ending(&header_line);
            if trimmed.is_empty() {
                break;
            }
            let (name, value) = trimmed
                .split_once(':')
                .ok_or_else(|| anyhow!("header missing ':' separator from {peer}"))?;
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                bail!("header name must not be empty");
            }
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| anyhow!("invalid header name '{name}' from {peer}"))?;
            headers.push_line(HeaderLine::new(name, value));
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}
