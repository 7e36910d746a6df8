use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{Method, StatusCode};
use lru::LruCache;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::message::{Request, Response, uri};

use super::codec::{
    ChunkedReader, ResponseHead, read_response_head, write_all_with_timeout,
};

const POOL_CAPACITY: usize = 8;

type PoolKey = (String, u16);

/// Outbound HTTP/1.1 client. Redirects are never followed, no
/// `Accept-Encoding` is ever offered (the standard filter strips it, so
/// filters always see identity bytes), and each request runs under one total
/// deadline. Idle upstream connections are pooled per authority.
pub struct UpstreamClient {
    pool: LruCache<PoolKey, BufReader<TcpStream>>,
    chunk: usize,
    timeout: Duration,
    max_header_size: usize,
}

#[derive(Debug)]
enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked(ChunkedReader),
    UntilClose,
}

/// One in-flight upstream response body. The head has already been parsed
/// when this exists; `next_chunk` pulls payload slabs of at most the
/// configured chunk size.
#[derive(Debug)]
pub struct UpstreamExchange {
    reader: BufReader<TcpStream>,
    key: PoolKey,
    plan: BodyPlan,
    chunk: usize,
    deadline: Instant,
    close_after: bool,
    exhausted: bool,
}

impl UpstreamClient {
    pub fn new(chunk: usize, timeout: Duration, max_header_size: usize) -> Self {
        let capacity = NonZeroUsize::new(POOL_CAPACITY).expect("nonzero pool capacity");
        Self {
            pool: LruCache::new(capacity),
            chunk,
            timeout,
            max_header_size,
        }
    }

    /// Send `request` upstream and return the finalized response head plus
    /// the body exchange. A pooled connection that fails mid-roundtrip is
    /// discarded and retried once on a fresh connection.
    pub async fn dispatch(&mut self, request: &Request) -> Result<(Response, UpstreamExchange)> {
        let (host, port) = uri::host_port(&request.uri)?;
        let key = (host.to_string(), port);
        let encoded = encode_request(request);
        let deadline = Instant::now() + self.timeout;

        if let Some(reader) = self.pool.pop(&key) {
            match roundtrip(reader, &encoded, deadline, self.max_header_size, &key).await {
                Ok(outcome) => return Ok(self.into_exchange(request, key, outcome, deadline)),
                Err(err) => {
                    debug!(host = %key.0, port = key.1, error = %err, "pooled upstream connection failed; reconnecting");
                }
            }
        }

        let stream = connect(&key, deadline).await?;
        let reader = BufReader::new(stream);
        let outcome = roundtrip(reader, &encoded, deadline, self.max_header_size, &key).await?;
        Ok(self.into_exchange(request, key, outcome, deadline))
    }

    fn into_exchange(
        &self,
        request: &Request,
        key: PoolKey,
        (head, reader): (ResponseHead, BufReader<TcpStream>),
        deadline: Instant,
    ) -> (Response, UpstreamExchange) {
        let plan = body_plan(&request.method, &head);
        let close_after = head.connection_close || matches!(plan, BodyPlan::UntilClose);
        let exhausted = matches!(plan, BodyPlan::Empty);
        let response = Response {
            status: head.status,
            reason: Some(head.reason),
            version: head.version,
            headers: head.headers,
            body: Vec::new(),
        };
        let exchange = UpstreamExchange {
            reader,
            key,
            plan,
            chunk: self.chunk,
            deadline,
            close_after,
            exhausted,
        };
        (response, exchange)
    }

    /// Return a drained exchange's connection to the keep-alive pool.
    pub fn recycle(&mut self, exchange: UpstreamExchange) {
        if exchange.exhausted && !exchange.close_after {
            self.pool.push(exchange.key, exchange.reader);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.pool.len()
    }
}

impl UpstreamExchange {
    fn remaining(&self) -> Result<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|remaining| !remaining.is_zero())
            .ok_or_else(|| anyhow!("upstream request exceeded the configured timeout"))
    }

    /// Pull the next body slab, at most the configured chunk size. `None`
    /// means the body is complete; the exchange should then be recycled.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }
        let chunk = self.chunk;
        let timeout_dur = self.remaining()?;
        let peer = self
            .reader
            .get_ref()
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("fallback addr"));
        match &mut self.plan {
            BodyPlan::Empty => {
                self.exhausted = true;
                Ok(None)
            }
            BodyPlan::Fixed(remaining) => {
                let want = (*remaining).min(chunk as u64) as usize;
                if want == 0 {
                    self.exhausted = true;
                    return Ok(None);
                }
                let mut buffer = vec![0u8; want];
                let read = crate::util::timeout_with_context(
                    timeout_dur,
                    tokio::io::AsyncReadExt::read(&mut self.reader, &mut buffer),
                    format!("reading upstream response body from {peer}"),
                )
                .await?;
                if read == 0 {
                    bail!("upstream {peer} closed connection early while sending response body");
                }
                buffer.truncate(read);
                *remaining -= read as u64;
                if *remaining == 0 {
                    self.exhausted = true;
                }
                Ok(Some(buffer))
            }
            BodyPlan::Chunked(decoder) => {
                let mut buffer = Vec::new();
                let more = decoder
                    .read_some(&mut self.reader, &mut buffer, chunk, timeout_dur, peer)
                    .await?;
                if !more {
                    self.exhausted = true;
                }
                if buffer.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(buffer))
                }
            }
            BodyPlan::UntilClose => {
                let mut buffer = vec![0u8; chunk];
                let read = crate::util::timeout_with_context(
                    timeout_dur,
                    tokio::io::AsyncReadExt::read(&mut self.reader, &mut buffer),
                    format!("reading upstream response body from {peer}"),
                )
                .await?;
                if read == 0 {
                    self.exhausted = true;
                    return Ok(None);
                }
                buffer.truncate(read);
                Ok(Some(buffer))
            }
        }
    }

    /// Whether the upstream connection must be dropped after this exchange.
    pub fn close_after(&self) -> bool {
        self.close_after
    }
}

fn body_plan(method: &Method, head: &ResponseHead) -> BodyPlan {
    if *method == Method::HEAD {
        return BodyPlan::Empty;
    }
    let status = head.status;
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return BodyPlan::Empty;
    }
    if head.chunked {
        return BodyPlan::Chunked(ChunkedReader::new());
    }
    match head.content_length {
        Some(0) => BodyPlan::Empty,
        Some(length) => BodyPlan::Fixed(length),
        None => BodyPlan::UntilClose,
    }
}

/// Serialize the outbound request: origin-form target, HTTP/1.1, canonical
/// `Host` from the URI authority, remaining headers verbatim, then the body.
fn encode_request(request: &Request) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256 + request.body.len());
    buffer.extend_from_slice(request.method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(uri::origin_form(&request.uri).as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    let authority = request
        .uri
        .authority()
        .map(|authority| authority.as_str())
        .unwrap_or("");
    buffer.extend_from_slice(authority.as_bytes());
    buffer.extend_from_slice(b"\r\n");
    for line in request.headers.iter() {
        if line.lower_name() == "host" {
            continue;
        }
        buffer.extend_from_slice(line.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(line.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);
    buffer
}

async fn connect(key: &PoolKey, deadline: Instant) -> Result<TcpStream> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("upstream request exceeded the configured timeout"))?;
    let addrs: Vec<_> = timeout(remaining, tokio::net::lookup_host((key.0.as_str(), key.1)))
        .await
        .map_err(|_| anyhow!("resolving {} timed out", key.0))?
        .with_context(|| format!("failed to resolve upstream host '{}'", key.0))?
        .collect();
    if addrs.is_empty() {
        bail!("upstream host '{}' resolved to no addresses", key.0);
    }

    let mut last_err = None;
    for addr in addrs {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("upstream request exceeded the configured timeout"))?;
        match timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(addr = %addr, error = %err, "failed to set TCP_NODELAY on upstream stream");
                }
                debug!(addr = %addr, "connected to upstream");
                return Ok(stream);
            }
            Ok(Err(err)) => {
                last_err = Some(
                    anyhow!(err).context(format!("failed to connect to {addr}")),
                );
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no addresses to connect to")))
}

async fn roundtrip(
    mut reader: BufReader<TcpStream>,
    encoded: &[u8],
    deadline: Instant,
    max_header_size: usize,
    key: &PoolKey,
) -> Result<(ResponseHead, BufReader<TcpStream>)> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("upstream request exceeded the configured timeout"))?;
    let peer = reader
        .get_ref()
        .peer_addr()
        .with_context(|| format!("upstream connection to {}:{} is gone", key.0, key.1))?;
    write_all_with_timeout(
        reader.get_mut(),
        encoded,
        remaining,
        format!("writing request to upstream {peer}"),
    )
    .await?;
    crate::util::timeout_with_context(
        remaining,
        reader.get_mut().flush(),
        format!("flushing request to upstream {peer}"),
    )
    .await?;

    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("upstream request exceeded the configured timeout"))?;
    let head = read_response_head(&mut reader, remaining, peer, max_header_size).await?;
    Ok((head, reader))
}
