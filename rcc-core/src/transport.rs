//! Framed socket I/O.
//!
//! The read side is a continuous loop over a fixed-size buffer that feeds
//! a [`FrameCodec`] and hands every completed payload onwards. The write
//! side emits the prefix and then the payload, mirroring each chunk.
//! Both are generic over the tokio I/O traits so they can be driven by a
//! socket half or by a mock stream.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::{FrameCodec, PREFIX_LEN, encode_prefix};
use crate::error::RccError;

/// Why a read loop stopped.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The peer closed its side of the stream (zero-byte read).
    PeerClosed,
    /// An I/O or framing error; the connection must be torn down.
    Failed(RccError),
}

/// Read until the stream ends or fails.
///
/// `on_chunk` sees every raw read; `on_frame` sees every complete payload,
/// in order, exactly once.
pub async fn read_loop<R, C, F>(
    mut reader: R,
    buffer_size: usize,
    mut codec: FrameCodec,
    mut on_chunk: C,
    mut on_frame: F,
) -> ReadOutcome
where
    R: AsyncRead + Unpin,
    C: FnMut(&[u8]),
    F: FnMut(BytesMut),
{
    let mut buf = vec![0u8; buffer_size.max(PREFIX_LEN)];
    let mut pending = BytesMut::with_capacity(buf.len());

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return ReadOutcome::PeerClosed,
            Ok(n) => n,
            Err(e) => return ReadOutcome::Failed(e.into()),
        };
        trace!(bytes = n, "read chunk");
        on_chunk(&buf[..n]);
        pending.extend_from_slice(&buf[..n]);

        loop {
            match codec.decode(&mut pending) {
                Ok(Some(frame)) => on_frame(frame),
                Ok(None) => break,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }
}

/// Write one frame: the 4-byte prefix, then the payload.
pub async fn write_frame<W, C>(
    writer: &mut W,
    payload: &[u8],
    mut on_chunk: C,
) -> Result<(), RccError>
where
    W: AsyncWrite + Unpin,
    C: FnMut(&[u8]),
{
    let prefix = encode_prefix(payload.len())?;
    writer.write_all(&prefix).await?;
    on_chunk(&prefix);
    writer.write_all(payload).await?;
    on_chunk(payload);
    writer.flush().await?;
    trace!(bytes = payload.len(), "wrote frame");
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
