//! Single-read invocation payload.

use std::{io, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, Stream, StreamExt};
use tokio::sync::Mutex;

type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// The payload of one invocation, consumed exactly once.
///
/// The runtime keeps a second handle on the same stream so it can drain whatever the handler left
/// unread once the invocation is done; the control plane reuses connections and unread bytes would
/// corrupt the next poll.
pub struct InvocationBody {
    inner: Arc<Mutex<Option<BodyStream>>>,
}

impl std::fmt::Debug for InvocationBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InvocationBody(..)")
    }
}

impl InvocationBody {
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = stream.map(|item| item.map_err(io::Error::other)).boxed();
        Self {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Next non-empty chunk, or `None` once the payload is exhausted.
    pub async fn chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut guard = self.inner.lock().await;
        loop {
            let Some(stream) = guard.as_mut() else {
                return Ok(None);
            };
            match stream.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Ok(Some(chunk)),
                Some(Err(err)) => {
                    *guard = None;
                    return Err(err);
                }
                None => {
                    *guard = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Buffer the remaining payload.
    pub async fn read_to_end(&mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub(crate) fn drain_handle(&self) -> BodyDrain {
        BodyDrain {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl From<Bytes> for InvocationBody {
    fn from(value: Bytes) -> Self {
        Self::from_stream(futures::stream::once(async move {
            Ok::<_, io::Error>(value)
        }))
    }
}

impl From<Vec<u8>> for InvocationBody {
    fn from(value: Vec<u8>) -> Self {
        Self::from(Bytes::from(value))
    }
}

impl From<&'static str> for InvocationBody {
    fn from(value: &'static str) -> Self {
        Self::from(Bytes::from_static(value.as_bytes()))
    }
}

pub(crate) struct BodyDrain {
    inner: Arc<Mutex<Option<BodyStream>>>,
}

impl BodyDrain {
    /// Take the stream away from the handler, read it to the end and drop it.
    /// Returns the number of bytes discarded.
    pub(crate) async fn drain(self) -> usize {
        let Some(mut stream) = self.inner.lock().await.take() else {
            return 0;
        };

        let mut discarded = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => discarded += chunk.len(),
                Err(err) => {
                    tracing::debug!(error = %err, "invocation body failed while draining");
                    break;
                }
            }
        }
        discarded
    }
}
