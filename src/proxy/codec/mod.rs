pub mod chunk;
pub mod line;
pub mod request;
pub mod response;

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

pub use chunk::{BodyTooLarge, ChunkedReader, read_chunked_body, write_chunk, write_last_chunk};
pub use request::{RequestHead, read_request_head};
pub use response::{ResponseHead, read_response_head};

pub async fn write_all_with_timeout<W: AsyncWrite + Unpin, C: Into<String>>(
    writer: &mut W,
    buf: &[u8],
    timeout: Duration,
    context: C,
) -> Result<()> {
    timeout_with_context(timeout, writer.write_all(buf), context).await
}
