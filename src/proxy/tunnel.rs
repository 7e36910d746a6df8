use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::AGENT;
use crate::logging::LogMask;
use crate::message::uri::split_host_port;
use crate::util::timeout_with_context;

use super::ProxyCore;

/// Serve a CONNECT request: open a TCP connection to `host:port`, confirm
/// with `200 Connection established`, then splice bytes both ways until
/// either side closes or the idle timeout fires. No filters apply to the
/// tunneled payload.
pub async fn run(
    core: &ProxyCore,
    mut client: TcpStream,
    target: &str,
    peer: SocketAddr,
) -> Result<()> {
    let idle = core.settings.timeout();
    let (host, port) = match split_host_port(target) {
        Ok((host, Some(port))) => (host.to_string(), port),
        Ok((host, None)) => (host.to_string(), 443),
        Err(err) => {
            let body = format!("invalid CONNECT target '{target}': {err:#}\r\n");
            let _ = write_tunnel_error(&mut client, 400, "Bad Request", &body, idle).await;
            return Ok(());
        }
    };

    let upstream = match timeout(idle, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            core.log(
                LogMask::CONNECT,
                &format!("failed to reach {host}:{port}: {err}"),
            );
            let body = format!("cannot connect to {host}:{port}: {err}\r\n");
            let _ = write_tunnel_error(&mut client, 502, "Bad Gateway", &body, idle).await;
            return Ok(());
        }
        Err(_) => {
            let body = format!("connection to {host}:{port} timed out\r\n");
            let _ = write_tunnel_error(&mut client, 504, "Gateway Timeout", &body, idle).await;
            return Ok(());
        }
    };
    if let Err(err) = upstream.set_nodelay(true) {
        tracing::debug!(error = %err, "failed to set TCP_NODELAY on tunnel upstream");
    }

    let established = format!(
        "HTTP/1.1 200 Connection established\r\nProxy-Agent: {AGENT}\r\n\r\n"
    );
    timeout_with_context(
        idle,
        client.write_all(established.as_bytes()),
        "writing CONNECT response",
    )
    .await?;
    timeout_with_context(idle, client.flush(), "flushing CONNECT response").await?;

    let (sent, received) = relay(client, upstream, idle)
        .await
        .context("CONNECT splice relay failed")?;
    core.log(
        LogMask::CONNECT,
        &format!("{peer} <-> {host}:{port} closed ({sent} bytes out, {received} bytes in)"),
    );
    Ok(())
}

async fn relay(
    mut client: TcpStream,
    mut upstream: TcpStream,
    idle: Duration,
) -> Result<(u64, u64)> {
    let (sent, received) = {
        let (mut client_reader, mut client_writer) = io::split(&mut client);
        let (mut upstream_reader, mut upstream_writer) = io::split(&mut upstream);

        let to_upstream = transfer_half(
            &mut client_reader,
            &mut upstream_writer,
            idle,
            "CONNECT client",
            "tunnel upstream",
        );
        let to_client = transfer_half(
            &mut upstream_reader,
            &mut client_writer,
            idle,
            "tunnel upstream",
            "CONNECT client",
        );

        tokio::try_join!(to_upstream, to_client)?
    };

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok((sent, received))
}

async fn transfer_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    read_label: &str,
    write_label: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let read = timeout_with_context(
            idle,
            reader.read(&mut buffer),
            format!("reading from {read_label} during CONNECT splice"),
        )
        .await?;
        if read == 0 {
            timeout_with_context(
                idle,
                writer.shutdown(),
                format!("shutting down {write_label} during CONNECT splice"),
            )
            .await?;
            break;
        }
        timeout_with_context(
            idle,
            writer.write_all(&buffer[..read]),
            format!("forwarding to {write_label} during CONNECT splice"),
        )
        .await?;
        transferred = transferred.saturating_add(read as u64);
    }

    timeout_with_context(
        idle,
        writer.flush(),
        format!("flushing {write_label} during CONNECT splice"),
    )
    .await?;
    Ok(transferred)
}

async fn write_tunnel_error(
    client: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
    idle: Duration,
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nServer: {AGENT}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    timeout_with_context(idle, client.write_all(head.as_bytes()), "writing CONNECT error").await?;
    timeout_with_context(idle, client.flush(), "flushing CONNECT error").await
}
