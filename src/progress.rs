//! Progress reporting for transfers.
//!
//! A [`ProgressReader`] wraps either side of a transfer (the local file on
//! upload, the remote body on download) and counts bytes as they pass
//! through, untouched. Every time the running total grows more than
//! [`PROGRESS_BYTE_LIMIT`] past the last report it pushes the total into an
//! unbounded channel; a forwarder task turns each total into a
//! `PROGRESS <n>` line on the control channel. The send never blocks the
//! data path.

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::LineSink;

/// Emit a PROGRESS line each time this many more bytes have moved.
pub const PROGRESS_BYTE_LIMIT: u64 = 256 * 1024;

/// Byte-counting passthrough reader.
pub struct ProgressReader<R> {
    inner: R,
    tx: mpsc::UnboundedSender<u64>,
    total: u64,
    last_reported: u64,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, tx: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            inner,
            tx,
            total: 0,
            last_reported: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            self.total += n;
            if self.total - self.last_reported > PROGRESS_BYTE_LIMIT {
                // Receiver gone just means nobody is listening anymore.
                let _ = self.tx.send(self.total);
                self.last_reported = self.total;
            }
        }
        poll
    }
}

/// Spawn the task that writes `PROGRESS <n>` lines for every reported
/// total. Ends when the matching [`ProgressReader`] is dropped; join it
/// before emitting the terminal response so PROGRESS never trails it.
pub fn forward<W>(sink: LineSink<W>, mut rx: mpsc::UnboundedReceiver<u64>) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(total) = rx.recv().await {
            sink.send(&format!("PROGRESS {total}")).await?;
        }
        Ok(())
    })
}
