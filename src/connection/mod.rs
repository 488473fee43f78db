//! Per-connection I/O shared by the listener and the client: the
//! receive-until-zero loop and the send loop that flushes partial writes.

mod buffer;

pub use buffer::{ConnectionBuffer, DEFAULT_BUFFER_SIZE};

use socket2::TcpKeepalive;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub bytes: usize,
    /// Non-empty reads before the terminal zero-byte read.
    pub reads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    pub bytes: usize,
    pub writes: usize,
}

/// Reads into `buffer` until a read returns zero bytes. Reads are strictly
/// sequential; an immediate zero-byte read is a complete, empty request.
pub async fn receive_until_zero<R>(
    reader: &mut R,
    buffer: &mut ConnectionBuffer,
) -> io::Result<ReceiveSummary>
where
    R: AsyncRead + Unpin,
{
    let mut reads = 0;
    loop {
        let n = reader.read(buffer.chunk_mut()).await?;
        if n == 0 {
            return Ok(ReceiveSummary {
                bytes: buffer.len(),
                reads,
            });
        }
        buffer.commit(n);
        reads += 1;
        trace!("read {} bytes ({} total)", n, buffer.len());
    }
}

/// Writes all of `bytes`, reissuing the write after every partial write.
pub async fn send_all<W>(writer: &mut W, bytes: &[u8]) -> io::Result<SendSummary>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut writes = 0;
    while written < bytes.len() {
        let n = writer.write(&bytes[written..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "peer stopped accepting bytes",
            ));
        }
        written += n;
        writes += 1;
        trace!("wrote {} bytes ({}/{})", n, written, bytes.len());
    }
    writer.flush().await?;

    Ok(SendSummary {
        bytes: written,
        writes,
    })
}

/// Runs `op` under an optional deadline, tagging a timeout with `phase`.
pub async fn within<T, F>(phase: &'static str, deadline: Option<Duration>, op: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        None => Ok(op.await?),
        Some(deadline) => time::timeout(deadline, op)
            .await
            .map_err(|_| Error::Timeout {
                phase,
                elapsed: deadline,
            })?
            .map_err(Error::from),
    }
}

pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    sock_ref.set_tcp_keepalive(&keepalive)?;

    stream.set_nodelay(true)?;

    Ok(())
}
