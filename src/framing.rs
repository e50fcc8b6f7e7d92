use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Write one payload and close the write half.
pub async fn write_payload<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Read a single payload of at most `max_len` bytes.
///
/// Reading stops at end of stream, once `max_len` bytes have arrived, or when
/// the peer has sent something and then stays silent for `idle`. A peer that
/// sends nothing within `idle` yields an empty payload.
pub async fn read_payload<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_len: usize,
    idle: Duration,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max_len];
    let mut filled = 0;
    while filled < max_len {
        match timeout(idle, stream.read(&mut buf[filled..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Ok(Err(e)) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
