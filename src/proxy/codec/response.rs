use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::header::HeaderName;
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use crate::message::Headers;
use crate::message::headers::HeaderLine;

use super::line::{read_line_with_timeout, trim_line_ending};

#[derive(Debug)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

/// Read an upstream response head. HTTP/1.0 and HTTP/1.1 upstreams are
/// accepted; HTTP/1.0 defaults to connection-close semantics.
pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "response header limit must be greater than zero"
    );

    let mut status_line = String::new();
    let bytes = read_line_with_timeout(
        reader,
        &mut status_line,
        timeout_dur,
        peer,
        max_header_bytes,
    )
    .await?;
    if bytes == 0 {
        bail!("upstream {peer} closed connection before sending status line");
    }
    let mut consumed = bytes;
    let (version, status, reason) = parse_status_line(trim_line_ending(&status_line))?;

    let mut headers = Headers::new();
    let mut content_length = None;
    let mut content_length_seen = false;
    let mut chunked = false;
    let mut transfer_encoding_seen = false;
    let mut connection_close = version == Version::HTTP_10;

    let mut header_line = String::new();
    loop {
        let remaining = max_header_bytes
            .checked_sub(consumed)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;
        let read =
            read_line_with_timeout(reader, &mut header_line, timeout_dur, peer, remaining).await?;
        if read == 0 {
            bail!("upstream {peer} closed connection during headers");
        }
        consumed += read;
        let trimmed = trim_line_ending(&header_line);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream {peer}"))?;
        let name = name.trim();
        let value = value.trim();
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}' from upstream {peer}"))?;

        if name.eq_ignore_ascii_case("content-length") {
            if content_length_seen {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
            content_length_seen = true;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_seen = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    connection_close = false;
                }
            }
        }
        headers.push_line(HeaderLine::new(name, value));
    }

    if transfer_encoding_seen && content_length_seen {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

pub fn parse_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    Ok((version, status, reason))
}

#[cfg(test)]
mod tests {
    use super::{parse_status_line, read_response_head};
    use http::{StatusCode, Version};
    use std::time::Duration;

    async fn parse(bytes: &'static [u8]) -> anyhow::Result<super::ResponseHead> {
        let mut reader = tokio::io::BufReader::new(bytes);
        read_response_head(
            &mut reader,
            Duration::from_secs(1),
            "127.0.0.1:80".parse().unwrap(),
            4096,
        )
        .await
    }

    #[tokio::test]
    async fn parses_basic_head() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\r\nhello")
            .await
            .expect("head");
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.content_length, Some(5));
        assert!(!head.chunked);
        assert!(!head.connection_close);
    }

    #[tokio::test]
    async fn http10_defaults_to_close() {
        let head = parse(b"HTTP/1.0 200 OK\r\n\r\n").await.expect("head");
        assert_eq!(head.version, Version::HTTP_10);
        assert!(head.connection_close);
    }

    #[tokio::test]
    async fn detects_chunked_transfer_encoding() {
        let head = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .expect("head");
        assert!(head.chunked);
    }

    #[tokio::test]
    async fn rejects_duplicate_content_length() {
        let err = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nContent-Length: 10\r\n\r\n")
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("multiple Content-Length"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn rejects_transfer_encoding_with_content_length() {
        let err = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n")
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("must not include both Transfer-Encoding and Content-Length"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn parse_status_line_keeps_multiword_reason() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reason, "Not Found");
    }

    #[test]
    fn parse_status_line_rejects_garbage() {
        assert!(parse_status_line("BAD 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1").is_err());
        assert!(parse_status_line("HTTP/1.1 twohundred OK").is_err());
    }
}
