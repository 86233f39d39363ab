//! Bidirectional byte relay with half-close

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

const RELAY_BUFFER_SIZE: usize = 16384;

/// Bytes moved by one relay invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// The relay was cut short by cancellation
    pub cancelled: bool,
}

/// Copy bytes between `a` and `b` until both directions finish
///
/// When one side reaches end-of-data the write half of the other side is shut
/// down while the opposite direction keeps running. An I/O error ends only
/// the direction it occurred on. On cancellation both streams are dropped,
/// which closes them.
pub async fn relay<A, B>(cancel: &CancellationToken, a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut stats = RelayStats::default();

    let finished = {
        let copies = async {
            tokio::join!(
                pipe(&mut a_read, &mut b_write, &mut stats.a_to_b),
                pipe(&mut b_read, &mut a_write, &mut stats.b_to_a),
            )
        };

        tokio::select! {
            _ = copies => true,
            _ = cancel.cancelled() => false,
        }
    };

    stats.cancelled = !finished;
    stats
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!("Relay read ended: {}", e);
                break;
            }
        };

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            trace!("Relay write ended: {}", e);
            break;
        }
        *copied += n as u64;
    }

    let _ = writer.shutdown().await;
}
