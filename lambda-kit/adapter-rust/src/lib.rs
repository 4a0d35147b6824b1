//! HTTP adapter for `lambda-stream-runtime`.
//!
//! Wraps an ordinary `http::Request` handler so it can serve API Gateway HTTP API (v2.0)
//! invocations: the inbound envelope is decoded before the handler runs, and everything the handler
//! writes to its [`ResponseWriter`] is encoded into the response envelope as it arrives.

use std::{future::Future, ops::Deref, sync::Arc};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use http::Request;
use lambda_stream_runtime::{Handler, InvocationBody, InvocationContext, PipeWriter};

pub mod encoder;
pub mod envelope;

pub use encoder::EnvelopeEncoder;
pub use envelope::{decode_request, into_request, DecodeError};

/// Response side handed to HTTP handlers.
///
/// Cloning is cheap and every clone writes to the same envelope. Status and headers are committed
/// by the first `set_status` or `write`; later header changes are ignored.
pub struct ResponseWriter<W = PipeWriter> {
    encoder: Arc<EnvelopeEncoder<W>>,
}

impl<W> Clone for ResponseWriter<W> {
    fn clone(&self) -> Self {
        Self {
            encoder: Arc::clone(&self.encoder),
        }
    }
}

impl<W> ResponseWriter<W>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(out: W) -> Self {
        Self {
            encoder: Arc::new(EnvelopeEncoder::new(out)),
        }
    }
}

impl<W> Deref for ResponseWriter<W> {
    type Target = EnvelopeEncoder<W>;

    fn deref(&self) -> &Self::Target {
        &self.encoder
    }
}

/// Runtime handler that serves HTTP-shaped invocations with `f`.
pub struct HttpAdapter<F> {
    f: F,
}

/// Adapt `f` into a runtime [`Handler`].
///
/// The envelope is finished once `f` returns `Ok`. When `f` fails the envelope is left open and the
/// error is passed to the runtime, which reports it or aborts the response depending on whether
/// anything was written yet.
pub fn http_adapter<F, Fut>(f: F) -> HttpAdapter<F>
where
    F: Fn(Request<Bytes>, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HttpAdapter { f }
}

#[async_trait]
impl<F, Fut> Handler for HttpAdapter<F>
where
    F: Fn(Request<Bytes>, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn invoke(
        &self,
        ctx: InvocationContext,
        out: PipeWriter,
        mut body: InvocationBody,
    ) -> anyhow::Result<()> {
        let payload = body
            .read_to_end()
            .await
            .context("failed to read invocation payload")?;
        let mut request = decode_request(&payload)?;

        tracing::debug!(
            request_id = %ctx.request_id,
            method = %request.method(),
            uri = %request.uri(),
            "decoded http invocation"
        );
        request.extensions_mut().insert(ctx);

        let writer = ResponseWriter::new(out);
        (self.f)(request, writer.clone()).await?;
        writer
            .finish()
            .await
            .context("failed to finish response envelope")?;
        Ok(())
    }
}
