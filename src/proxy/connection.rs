use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::filter::{
    FilterContext, PROXIED_METHODS, RequestMeta, ResponseMeta, SUPPORTED_SCHEMES,
};
use crate::logging::LogMask;
use crate::message::request::version_token;
use crate::message::{Headers, Request, Response, uri};
use crate::util::timeout_with_context;

use super::ProxyCore;
use super::codec::{
    self, RequestHead, read_request_head, write_all_with_timeout, write_chunk, write_last_chunk,
};
use super::tunnel;
use super::upstream::{UpstreamClient, UpstreamExchange};

enum Disposition {
    Continue,
    Close,
}

enum BodySource {
    /// The response's own body (short-circuits and synthesized errors).
    Owned,
    /// Streamed from upstream, chunk by chunk.
    Upstream(UpstreamExchange),
}

/// How the response body is framed towards the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Pre-HTTP/1.0 client: no status line or headers, raw body, then close.
    Antique,
    /// Status forbids a body, or the request was HEAD.
    HeadersOnly,
    Chunked,
    /// Raw body delimited by connection close (HTTP/1.0 clients).
    CloseDelimited,
}

fn at_least_http11(version: Version) -> bool {
    !matches!(version, Version::HTTP_09 | Version::HTTP_10)
}

fn decide_framing(
    client_version: Version,
    method: &Method,
    status: StatusCode,
    keep_alive: bool,
) -> (Framing, bool) {
    if client_version == Version::HTTP_09 {
        return (Framing::Antique, false);
    }
    let body_forbidden = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    if body_forbidden || *method == Method::HEAD {
        return (Framing::HeadersOnly, keep_alive);
    }
    if at_least_http11(client_version) {
        (Framing::Chunked, keep_alive)
    } else {
        (Framing::CloseDelimited, false)
    }
}

/// Serve one accepted connection to completion on a worker-local
/// current-thread runtime. This is the entry point every engine strategy
/// uses, keeping fork-based engines free of live runtime state.
pub fn serve_blocking(core: Arc<ProxyCore>, stream: std::net::TcpStream, peer: SocketAddr) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build worker runtime");
            return;
        }
    };
    let result = runtime.block_on(async move {
        stream
            .set_nonblocking(true)
            .context("failed to make client stream nonblocking")?;
        let stream =
            TcpStream::from_std(stream).context("failed to register client stream")?;
        serve(core, stream, peer).await
    });
    if let Err(err) = result {
        debug!(peer = %peer, error = %err, "connection closed with error");
    }
}

/// The per-connection request loop: up to `max_keep_alive_requests` requests,
/// each read, validated, filtered, dispatched, and streamed back.
pub async fn serve(core: Arc<ProxyCore>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY on client stream");
    }
    let mut reader = BufReader::new(stream);
    let mut upstream = UpstreamClient::new(
        core.settings.chunk,
        core.settings.timeout(),
        core.settings.max_header_size,
    );
    let max_requests = core.settings.max_keep_alive_requests;
    let mut served = 0usize;

    while served < max_requests {
        if core.stop_requested() {
            break;
        }
        served += 1;
        let head = match read_request_head(
            &mut reader,
            peer,
            core.settings.keep_alive_timeout(),
            core.settings.timeout(),
            core.settings.max_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                warn!(peer = %peer, error = %err, "invalid request");
                core.log(
                    LogMask::ERROR,
                    &format!("invalid request from {peer}: {err:#}"),
                );
                let response = Response::bad_request("invalid request\r\n");
                let _ =
                    write_simple_response(reader.get_mut(), &response, core.settings.timeout())
                        .await;
                break;
            }
        };

        if head.method == Method::CONNECT {
            core.log(
                LogMask::CONNECT,
                &format!("CONNECT {peer} -> {}", head.target),
            );
            let stream = reader.into_inner();
            return tunnel::run(&core, stream, &head.target, peer).await;
        }

        let disposition = handle_request(
            &core,
            &mut reader,
            &mut upstream,
            head,
            peer,
            served == max_requests,
        )
        .await?;
        match disposition {
            Disposition::Continue => continue,
            Disposition::Close => break,
        }
    }

    let mut stream = reader.into_inner();
    let _ = stream.shutdown().await;
    Ok(())
}

async fn handle_request(
    core: &ProxyCore,
    reader: &mut BufReader<TcpStream>,
    upstream: &mut UpstreamClient,
    head: RequestHead,
    peer: SocketAddr,
    final_request: bool,
) -> Result<Disposition> {
    let RequestHead {
        method,
        target,
        version,
        headers,
    } = head;
    core.log(
        LogMask::STATUS,
        &format!("request {method} {target} {} from {peer}", version_token(version)),
    );

    let uri = match uri::absolutize(&target, headers.get("host")) {
        Ok(uri) => uri,
        Err(err) => {
            let response = Response::bad_request(&format!("{err:#}\r\n"));
            write_simple_response(reader.get_mut(), &response, core.settings.timeout()).await?;
            return Ok(Disposition::Close);
        }
    };
    let mut request = Request {
        method,
        uri,
        version,
        headers,
        body: Vec::new(),
    };
    let meta = RequestMeta {
        method: request.method.clone(),
        uri: request.uri.clone(),
        version: request.version,
    };

    if core.logger.enabled(LogMask::HEADERS) {
        core.log(
            LogMask::HEADERS,
            &format!("request headers: {}", dump_headers(&request.headers)),
        );
    }

    // Validation happens before any filter runs.
    if !PROXIED_METHODS.contains(&request.method) {
        let response = Response::not_implemented(format!(
            "Method {} is not supported by this proxy.\r\n",
            request.method
        ));
        return emit_response(
            core, reader, upstream, peer, &meta, response, BodySource::Owned, false,
        )
        .await;
    }
    let scheme = request.uri.scheme_str().unwrap_or("");
    if !SUPPORTED_SCHEMES.contains(&scheme) {
        let response = Response::not_implemented(format!(
            "Scheme {scheme} is not supported by this proxy.\r\n"
        ));
        return emit_response(
            core, reader, upstream, peer, &meta, response, BodySource::Owned, false,
        )
        .await;
    }

    // Request-header stack; hop-by-hop headers accumulate on the context.
    let mut hop = Headers::new();
    let mut reply = None;
    {
        let selection = core.filters.request_headers.select(&meta, None);
        let mut ctx = FilterContext {
            request: &meta,
            response: None,
            peer,
            hop_headers: &mut hop,
            reply: &mut reply,
            proxy: &core.info,
        };
        let outcome = core
            .filters
            .request_headers
            .run(&selection, &mut request.headers, &mut ctx);
        core.filters.request_headers.finish(selection);
        if let Err(err) = outcome {
            core.log(
                LogMask::FILTER,
                &format!("request header filter failed: {err:#}"),
            );
            let response = Response::filter_error(&format!("{err:#}\r\n"));
            return emit_response(
                core, reader, upstream, peer, &meta, response, BodySource::Owned, false,
            )
            .await;
        }
    }

    let keep_alive = at_least_http11(request.version)
        && !hop.connection_tokens().contains("close")
        && !final_request;

    if let Some(response) = reply.take() {
        core.log(
            LogMask::FILTER,
            &format!("request for {} short-circuited by a filter", request.uri),
        );
        return emit_response(
            core,
            reader,
            upstream,
            peer,
            &meta,
            response,
            BodySource::Owned,
            keep_alive,
        )
        .await;
    }

    // Read the request body in full; body filters see it exactly once.
    // Transfer-Encoding has moved to the hop set by now.
    let chunked = hop.is_chunked();
    let content_length = match request.headers.content_length() {
        Ok(value) => value,
        Err(err) => {
            let response = Response::bad_request(&format!("{err:#}\r\n"));
            write_simple_response(reader.get_mut(), &response, core.settings.timeout()).await?;
            return Ok(Disposition::Close);
        }
    };
    let max_body = core.settings.max_request_body_size;
    if chunked {
        match codec::read_chunked_body(reader, core.settings.timeout(), peer, max_body).await {
            Ok(body) => request.body = body,
            Err(err) => {
                let response = payload_error(&err);
                write_simple_response(reader.get_mut(), &response, core.settings.timeout())
                    .await?;
                return Ok(Disposition::Close);
            }
        }
    } else if let Some(length) = content_length {
        if length as usize > max_body {
            let err = anyhow::Error::from(codec::BodyTooLarge { limit: max_body });
            let response = payload_error(&err);
            write_simple_response(reader.get_mut(), &response, core.settings.timeout()).await?;
            return Ok(Disposition::Close);
        }
        let mut body = vec![0u8; length as usize];
        timeout_with_context(
            core.settings.timeout(),
            reader.read_exact(&mut body),
            format!("reading request body from {peer}"),
        )
        .await?;
        request.body = body;
    }
    let had_body = chunked || content_length.is_some();

    // Request-body stack: one full-body pass, then the final flush.
    {
        let mut session = core.filters.request_body.select(&meta, None);
        let outcome = (|| {
            core.filters
                .request_body
                .feed(&mut session, &mut request.body, &meta, None)?;
            let mut tail = Vec::new();
            core.filters
                .request_body
                .finish(&mut session, &mut tail, &meta, None)?;
            request.body.extend_from_slice(&tail);
            Ok::<_, anyhow::Error>(())
        })();
        if let Err(err) = outcome {
            core.log(
                LogMask::FILTER,
                &format!("request body filter failed: {err:#}"),
            );
            let response = Response::filter_error(&format!("{err:#}\r\n"));
            return emit_response(
                core, reader, upstream, peer, &meta, response, BodySource::Owned, false,
            )
            .await;
        }
    }

    // Filters may have changed the body length.
    request.headers.remove("Content-Length");
    if had_body || !request.body.is_empty() {
        request
            .headers
            .set("Content-Length", request.body.len().to_string());
    }

    match upstream.dispatch(&request).await {
        Ok((response, exchange)) => {
            core.log(
                LogMask::STATUS,
                &format!("response {} {}", response.status.as_u16(), response.reason()),
            );
            emit_response(
                core,
                reader,
                upstream,
                peer,
                &meta,
                response,
                BodySource::Upstream(exchange),
                keep_alive,
            )
            .await
        }
        Err(err) => {
            warn!(peer = %peer, error = %err, "upstream dispatch failed");
            core.log(
                LogMask::ERROR,
                &format!("upstream dispatch for {} failed: {err:#}", request.uri),
            );
            let response = Response::upstream_error(&format!("{err:#}"));
            emit_response(
                core,
                reader,
                upstream,
                peer,
                &meta,
                response,
                BodySource::Owned,
                keep_alive,
            )
            .await
        }
    }
}

/// Stream one response to the client: response-header stack, framing
/// decision, head write, then every body chunk through the response-body
/// stack with its carry discipline, and the trailing flush.
#[allow(clippy::too_many_arguments)]
async fn emit_response(
    core: &ProxyCore,
    reader: &mut BufReader<TcpStream>,
    upstream: &mut UpstreamClient,
    peer: SocketAddr,
    meta: &RequestMeta,
    mut response: Response,
    mut source: BodySource,
    keep_alive: bool,
) -> Result<Disposition> {
    let timeout = core.settings.timeout();
    let resp_meta = ResponseMeta {
        status: response.status,
        version: response.version,
        content_type: response.headers.get("content-type").map(str::to_string),
    };

    // Response-header stack, standard filter first.
    let mut hop = Headers::new();
    let mut reply = None;
    let selection = core.filters.response_headers.select(meta, Some(&resp_meta));
    let mut ctx = FilterContext {
        request: meta,
        response: Some(&resp_meta),
        peer,
        hop_headers: &mut hop,
        reply: &mut reply,
        proxy: &core.info,
    };
    let outcome = core
        .filters
        .response_headers
        .run(&selection, &mut response.headers, &mut ctx);
    core.filters.response_headers.finish(selection);
    if let Err(err) = outcome {
        core.log(
            LogMask::FILTER,
            &format!("response header filter failed: {err:#}"),
        );
        response = Response::filter_error(&format!("{err:#}\r\n"));
        source = BodySource::Owned;
    }

    // Proxy-Authenticate is scoped to the proxy-client hop (RFC 7235): the
    // extraction above must not keep a 407 challenge from reaching the
    // client it addresses.
    for value in hop.remove("Proxy-Authenticate") {
        response.headers.append("Proxy-Authenticate", value);
    }

    // The body is re-framed below; a stale length would be wrong whenever any
    // filter rewrites it, so it goes unconditionally (after user filters ran).
    response.headers.remove("Content-Length");
    response.headers.remove("Client-Date");

    let (framing, keep_alive) = decide_framing(meta.version, &meta.method, response.status, keep_alive);

    if framing != Framing::Antique {
        let token = match meta.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!("{token} {} {}\r\n", response.status.as_u16(), response.reason()).as_bytes(),
        );
        response.headers.write_to(&mut head);
        if framing == Framing::Chunked {
            head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        if !keep_alive && matches!(framing, Framing::Chunked | Framing::HeadersOnly) {
            head.extend_from_slice(b"Connection: close\r\n");
        }
        head.extend_from_slice(b"\r\n");
        write_all_with_timeout(
            reader.get_mut(),
            &head,
            timeout,
            "writing response head to client",
        )
        .await?;
        if core.logger.enabled(LogMask::HEADERS) {
            core.log(
                LogMask::HEADERS,
                &format!("response headers: {}", dump_headers(&response.headers)),
            );
        }
    }

    // Body stack: even a bodiless response brackets begin and the final
    // flush exactly once for the selected filters.
    let emit_body = framing != Framing::HeadersOnly;
    let mut session = core.filters.response_body.select(meta, Some(&resp_meta));
    match source {
        BodySource::Owned => {
            let mut data = std::mem::take(&mut response.body);
            core.filters
                .response_body
                .feed(&mut session, &mut data, meta, Some(&resp_meta))?;
            if emit_body {
                write_body_bytes(framing, reader, &data, timeout).await?;
            }
            let mut tail = Vec::new();
            core.filters
                .response_body
                .finish(&mut session, &mut tail, meta, Some(&resp_meta))?;
            if emit_body {
                write_body_bytes(framing, reader, &tail, timeout).await?;
            }
        }
        BodySource::Upstream(mut exchange) => {
            loop {
                let chunk = exchange.next_chunk().await.map_err(|err| {
                    core.log(
                        LogMask::ERROR,
                        &format!("upstream body read failed mid-stream: {err:#}"),
                    );
                    err
                })?;
                let Some(mut data) = chunk else { break };
                if core.logger.enabled(LogMask::DATA) {
                    core.log(LogMask::DATA, &format!("{} body bytes", data.len()));
                }
                core.filters
                    .response_body
                    .feed(&mut session, &mut data, meta, Some(&resp_meta))?;
                if emit_body {
                    write_body_bytes(framing, reader, &data, timeout).await?;
                }
            }
            let mut tail = Vec::new();
            core.filters
                .response_body
                .finish(&mut session, &mut tail, meta, Some(&resp_meta))?;
            if emit_body {
                write_body_bytes(framing, reader, &tail, timeout).await?;
            }
            upstream.recycle(exchange);
        }
    }
    if framing == Framing::Chunked {
        write_last_chunk(reader.get_mut(), timeout).await?;
    }
    timeout_with_context(timeout, reader.get_mut().flush(), "flushing response to client").await?;

    Ok(
        if keep_alive && matches!(framing, Framing::Chunked | Framing::HeadersOnly) {
            Disposition::Continue
        } else {
            Disposition::Close
        },
    )
}

async fn write_body_bytes(
    framing: Framing,
    reader: &mut BufReader<TcpStream>,
    data: &[u8],
    timeout: Duration,
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    match framing {
        Framing::HeadersOnly => Ok(()),
        Framing::Chunked => write_chunk(reader.get_mut(), data, timeout).await,
        Framing::Antique | Framing::CloseDelimited => {
            write_all_with_timeout(
                reader.get_mut(),
                data,
                timeout,
                "writing response body to client",
            )
            .await
        }
    }
}

/// Minimal response writer for protocol-level failures where no filter
/// context exists yet (unparsable request line, bad framing headers).
async fn write_simple_response(
    stream: &mut TcpStream,
    response: &Response,
    timeout: Duration,
) -> Result<()> {
    let mut buffer = Vec::with_capacity(256 + response.body.len());
    buffer.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            response.status.as_u16(),
            response.reason()
        )
        .as_bytes(),
    );
    response.headers.write_to(&mut buffer);
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer.extend_from_slice(&response.body);
    write_all_with_timeout(stream, &buffer, timeout, "writing error response to client").await?;
    timeout_with_context(timeout, stream.flush(), "flushing error response to client").await
}

fn payload_error(err: &anyhow::Error) -> Response {
    match err.downcast_ref::<codec::BodyTooLarge>() {
        Some(too_large) => Response::with_body(
            StatusCode::PAYLOAD_TOO_LARGE,
            "text/plain",
            format!("{too_large}\r\n"),
        ),
        None => Response::bad_request(&format!("{err:#}\r\n")),
    }
}

fn dump_headers(headers: &Headers) -> String {
    headers
        .iter()
        .map(|line| format!("{}: {}", line.name, line.value))
        .collect::<Vec<_>>()
        .join("; ")
}
