//! In-process byte pipe connecting a handler task (push-style writer) to the streamed response
//! submission (pull-style reader).
//!
//! The writer end is handed to the handler; the runtime keeps a [`PipeCloser`] so it can close the
//! pipe once the handler returns, optionally carrying the handler's error. The reader yields that
//! error once and then ends.

use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;

/// Number of in-flight chunks buffered between writer and reader.
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

/// Error carried from the writer end to the reader end.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PipeError {
    message: String,
}

impl PipeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

enum Frame {
    Data(Bytes),
    Close(Option<PipeError>),
}

/// Create a bounded pipe holding at most `capacity` chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));

    let writer = PipeWriter {
        poll_tx: PollSender::new(tx.clone()),
        tx,
        closed,
    };
    let reader = PipeReader {
        rx: ReceiverStream::new(rx),
        done: false,
    };
    (writer, reader)
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")
}

/// Writer end of a [`pipe`]. Implements [`AsyncWrite`].
pub struct PipeWriter {
    poll_tx: PollSender<Frame>,
    tx: mpsc::Sender<Frame>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PipeWriter {
    /// Handle that closes this pipe independently of who owns the writer.
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Send an owned chunk without copying it.
    pub async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(broken_pipe());
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Frame::Data(chunk))
            .await
            .map_err(|_| broken_pipe())
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(broken_pipe()));
        }
        // Zero-length writes must never count as the first byte of output.
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if ready!(this.poll_tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(broken_pipe()));
        }
        this.poll_tx
            .send_item(Frame::Data(Bytes::copy_from_slice(buf)))
            .map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Closes a pipe. The first close wins; later closes are ignored.
pub struct PipeCloser {
    tx: mpsc::Sender<Frame>,
    closed: Arc<AtomicBool>,
}

impl PipeCloser {
    /// Signal a clean end-of-stream.
    pub async fn close(self) {
        self.finish(None).await;
    }

    /// Signal end-of-stream carrying `err`; the reader surfaces it on its next read.
    pub async fn close_with_error(self, err: PipeError) {
        self.finish(Some(err)).await;
    }

    async fn finish(self, err: Option<PipeError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // A dropped reader has nothing left to tell.
        let _ = self.tx.send(Frame::Close(err)).await;
    }
}

/// Reader end of a [`pipe`].
pub struct PipeReader {
    rx: ReceiverStream<Frame>,
    done: bool,
}

impl Stream for PipeReader {
    type Item = Result<Bytes, PipeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let item = match ready!(Pin::new(&mut this.rx).poll_next(cx)) {
            Some(Frame::Data(chunk)) => return Poll::Ready(Some(Ok(chunk))),
            Some(Frame::Close(None)) => None,
            Some(Frame::Close(Some(err))) => Some(Err(err)),
            None => Some(Err(PipeError::new(
                "handler output dropped without being closed",
            ))),
        };

        this.done = true;
        this.rx.close();
        Poll::Ready(item)
    }
}
