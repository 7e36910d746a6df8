use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::util::timeout_with_context;

use super::line::{read_line_with_timeout, trim_line_ending};

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// A request body outgrew the configured cap. Typed so the connection
/// server can answer 413 instead of treating it like any other decode
/// failure.
#[derive(Debug, Error)]
#[error("request body exceeds configured limit of {limit} bytes")]
pub struct BodyTooLarge {
    pub limit: usize,
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder. Yields decoded payload
/// bytes in caller-sized slabs so the filter pipeline sees chunks of at most
/// the configured size regardless of the sender's chunking.
#[derive(Debug)]
pub struct ChunkedReader {
    state: ChunkState,
}

impl Default for ChunkedReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedReader {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Append up to `cap` decoded bytes to `out`. Returns `false` once the
    /// terminating chunk and its trailers have been consumed.
    pub async fn read_some<S>(
        &mut self,
        reader: &mut BufReader<S>,
        out: &mut Vec<u8>,
        cap: usize,
        timeout_dur: Duration,
        peer: SocketAddr,
    ) -> Result<bool>
    where
        S: AsyncRead + Unpin,
    {
        let mut line = String::new();
        loop {
            match self.state {
                ChunkState::Done => return Ok(false),
                ChunkState::Size => {
                    let read = read_line_with_timeout(
                        reader,
                        &mut line,
                        timeout_dur,
                        peer,
                        MAX_CHUNK_LINE_LENGTH,
                    )
                    .await?;
                    if read == 0 {
                        bail!("unexpected EOF while reading chunk size from {peer}");
                    }
                    let trimmed = trim_line_ending(&line);
                    let size_str = trimmed
                        .split_once(';')
                        .map(|(size, _)| size)
                        .unwrap_or(trimmed)
                        .trim();
                    let chunk_size = usize::from_str_radix(size_str, 16)
                        .with_context(|| format!("invalid chunk size '{size_str}'"))?;
                    if chunk_size == 0 {
                        self.consume_trailers(reader, timeout_dur, peer).await?;
                        self.state = ChunkState::Done;
                        return Ok(false);
                    }
                    self.state = ChunkState::Data {
                        remaining: chunk_size,
                    };
                }
                ChunkState::Data { remaining } => {
                    if out.len() >= cap {
                        return Ok(true);
                    }
                    let want = remaining.min(cap - out.len()).min(8192);
                    let start = out.len();
                    out.resize(start + want, 0);
                    let read = timeout_with_context(
                        timeout_dur,
                        reader.read(&mut out[start..]),
                        format!("reading chunk data from {peer}"),
                    )
                    .await?;
                    out.truncate(start + read);
                    if read == 0 {
                        bail!("unexpected EOF while reading chunk data from {peer}");
                    }
                    let remaining = remaining - read;
                    if remaining == 0 {
                        let mut crlf = [0u8; 2];
                        timeout_with_context(
                            timeout_dur,
                            reader.read_exact(&mut crlf),
                            format!("reading chunk terminator from {peer}"),
                        )
                        .await?;
                        if &crlf != b"\r\n" {
                            bail!("invalid chunk terminator when reading from {peer}");
                        }
                        self.state = ChunkState::Size;
                    } else {
                        self.state = ChunkState::Data { remaining };
                    }
                }
            }
        }
    }

    async fn consume_trailers<S>(
        &mut self,
        reader: &mut BufReader<S>,
        timeout_dur: Duration,
        peer: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let mut line = String::new();
        loop {
            let read =
                read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_CHUNK_LINE_LENGTH)
                    .await?;
            if read == 0 {
                bail!("unexpected EOF while reading chunk trailer from {peer}");
            }
            if trim_line_ending(&line).is_empty() {
                return Ok(());
            }
        }
    }
}

/// Decode an entire chunked body, bounded by `max_bytes`; overflow yields a
/// [`BodyTooLarge`].
pub async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_bytes: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut decoder = ChunkedReader::new();
    let mut body = Vec::new();
    loop {
        let before = body.len();
        let more = decoder
            .read_some(reader, &mut body, before + 8192, timeout_dur, peer)
            .await?;
        if body.len() > max_bytes {
            return Err(BodyTooLarge { limit: max_bytes }.into());
        }
        if !more && decoder.is_done() {
            return Ok(body);
        }
    }
}

/// Write one chunk in `hexlen CRLF data CRLF` framing; empty chunks are
/// skipped so the body cannot be terminated early.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8], timeout_dur: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    let mut framed = Vec::with_capacity(data.len() + 16);
    framed.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    framed.extend_from_slice(data);
    framed.extend_from_slice(b"\r\n");
    super::write_all_with_timeout(writer, &framed, timeout_dur, "writing chunk to client").await
}

/// Write the terminating `0 CRLF CRLF`.
pub async fn write_last_chunk<W>(writer: &mut W, timeout_dur: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    super::write_all_with_timeout(
        writer,
        b"0\r\n\r\n",
        timeout_dur,
        "writing final chunk to client",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::{BodyTooLarge, ChunkedReader, read_chunked_body, write_chunk, write_last_chunk};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::BufReader;

    fn peer() -> SocketAddr {
        "127.0.0.1:80".parse().unwrap()
    }

    #[tokio::test]
    async fn decodes_whole_body() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let body = read_chunked_body(&mut reader, Duration::from_secs(1), peer(), 1024)
            .await
            .expect("body");
        assert_eq!(body, b"Wikipedia");
    }

    #[tokio::test]
    async fn honors_caller_cap_across_sender_chunks() {
        let wire = b"a\r\n0123456789\r\n5\r\nabcde\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let mut decoder = ChunkedReader::new();

        let mut slab = Vec::new();
        let more = decoder
            .read_some(&mut reader, &mut slab, 4, Duration::from_secs(1), peer())
            .await
            .expect("read");
        assert!(more);
        assert_eq!(slab, b"0123");

        let mut rest = Vec::new();
        loop {
            let cap = rest.len() + 64;
            let more = decoder
                .read_some(&mut reader, &mut rest, cap, Duration::from_secs(1), peer())
                .await
                .expect("read");
            if !more {
                break;
            }
        }
        assert_eq!(rest, b"456789abcde");
        assert!(decoder.is_done());
    }

    #[tokio::test]
    async fn ignores_chunk_extensions_and_trailers() {
        let wire = b"5;ext=1\r\nhello\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let body = read_chunked_body(&mut reader, Duration::from_secs(1), peer(), 1024)
            .await
            .expect("body");
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn rejects_invalid_chunk_size() {
        let wire = b"zz\r\nhello\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let err = read_chunked_body(&mut reader, Duration::from_secs(1), peer(), 1024)
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("invalid chunk size"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn rejects_bad_chunk_terminator() {
        let wire = b"5\r\nhelloXX";
        let mut reader = BufReader::new(&wire[..]);
        let err = read_chunked_body(&mut reader, Duration::from_secs(1), peer(), 1024)
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("terminator"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn enforces_body_limit_with_typed_error() {
        let wire = b"a\r\n0123456789\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let err = read_chunked_body(&mut reader, Duration::from_secs(1), peer(), 4)
            .await
            .unwrap_err();
        let too_large = err
            .downcast_ref::<BodyTooLarge>()
            .expect("overflow should surface as BodyTooLarge");
        assert_eq!(too_large.limit, 4);
    }

    #[tokio::test]
    async fn decode_failures_are_not_body_too_large() {
        let wire = b"zz\r\nhello\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let err = read_chunked_body(&mut reader, Duration::from_secs(1), peer(), 1024)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<BodyTooLarge>().is_none());
    }

    #[tokio::test]
    async fn frames_chunks_and_skips_empty() {
        let mut out = Vec::new();
        write_chunk(&mut out, b"hello", Duration::from_secs(1))
            .await
            .expect("write");
        write_chunk(&mut out, b"", Duration::from_secs(1))
            .await
            .expect("write empty");
        write_last_chunk(&mut out, Duration::from_secs(1))
            .await
            .expect("write last");
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    }
}
