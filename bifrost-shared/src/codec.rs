//! Line-framed message codec: newline-delimited JSON records over any
//! `AsyncRead + AsyncWrite`, with buffered reassembly across reads.

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedParts, LinesCodec};
use tracing::warn;

use crate::protocol::MAX_LINE_LENGTH;
use crate::timeouts::NETWORK_TIMEOUT;

/// A framed, newline-delimited JSON stream of messages `R` in, `S` out.
///
/// Built on `tokio_util`'s `LinesCodec` (which already does the buffered
/// split-on-`\n` reassembly and the max-length enforcement) for line
/// splitting; each line is then parsed as a JSON record.
pub struct Delimited<T> {
    inner: Framed<T, LinesCodec>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Delimited<T> {
    /// Wrap a socket in the line-delimited framing.
    pub fn new(stream: T) -> Self {
        Delimited {
            inner: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        }
    }

    /// Read the next message, skipping (and logging) any line that fails
    /// to parse as JSON rather than tearing down the connection — a
    /// single malformed line is dropped, not fatal.
    pub async fn recv<R: DeserializeOwned>(&mut self) -> Result<Option<R>> {
        use futures_util::StreamExt;
        loop {
            let line = match self.inner.next().await {
                Some(Ok(line)) => line,
                Some(Err(tokio_util::codec::LinesCodecError::MaxLineLengthExceeded)) => {
                    anyhow::bail!("control line exceeded {MAX_LINE_LENGTH} bytes");
                }
                Some(Err(tokio_util::codec::LinesCodecError::Io(err))) => return Err(err.into()),
                None => return Ok(None),
            };
            match serde_json::from_str::<R>(&line) {
                Ok(msg) => return Ok(Some(msg)),
                Err(err) => {
                    warn!(%err, line, "dropping malformed control line");
                    continue;
                }
            }
        }
    }

    /// Read the next message, bailing out if none arrives within
    /// [`NETWORK_TIMEOUT`].
    pub async fn recv_timeout<R: DeserializeOwned>(&mut self) -> Result<Option<R>> {
        match tokio::time::timeout(NETWORK_TIMEOUT, self.recv()).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("timed out waiting for control message"),
        }
    }

    /// Serialize and send one message, followed by a newline.
    pub async fn send<S: Serialize>(&mut self, msg: S) -> Result<()> {
        use futures_util::SinkExt;
        let line = serde_json::to_string(&msg)?;
        debug_assert!(!line.contains('\n'), "serialized record contained a newline");
        self.inner.send(line).await.map_err(|e| match e {
            tokio_util::codec::LinesCodecError::Io(err) => anyhow::Error::from(err),
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                anyhow::anyhow!("outgoing line exceeded {MAX_LINE_LENGTH} bytes")
            }
        })
    }

    /// Split back into the underlying I/O object and any buffered bytes,
    /// for callers that need to hand off the raw socket.
    pub fn into_parts(self) -> FramedParts<T, LinesCodec> {
        self.inner.into_parts()
    }
}
