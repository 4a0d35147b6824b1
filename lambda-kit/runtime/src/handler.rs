//! Handler seam: user logic writes into a [`PipeWriter`] while reading an [`InvocationBody`].

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::SystemTime,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::body::InvocationBody;
use crate::pipe::{PipeError, PipeWriter};

/// Metadata for one invocation, plus its cancellation token.
///
/// Cancellation is cooperative: nothing stops a handler that ignores `cancellation`.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub request_id: String,
    pub deadline: Option<SystemTime>,
    pub invoked_function_arn: Option<String>,
    pub trace_id: Option<String>,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the invocation's deadline passes, the invocation ends, or the runtime shuts
    /// down.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// User logic run once per invocation.
///
/// Returning `Ok` ends the output cleanly. Returning `Err` before anything was written reports an
/// invocation error; after output has started it aborts the in-flight response.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        out: PipeWriter,
        body: InvocationBody,
    ) -> anyhow::Result<()>;
}

/// [`Handler`] built from an async closure or function.
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(InvocationContext, PipeWriter, InvocationBody) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(InvocationContext, PipeWriter, InvocationBody) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn invoke(
        &self,
        ctx: InvocationContext,
        out: PipeWriter,
        body: InvocationBody,
    ) -> anyhow::Result<()> {
        (self.f)(ctx, out, body).await
    }
}

/// Counts handler tasks that are still running.
pub(crate) struct LiveGuard {
    live: Arc<AtomicUsize>,
}

impl LiveGuard {
    pub(crate) fn enter(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            live: Arc::clone(live),
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run `handler` as an independent task and close the pipe with its result.
///
/// The task is never awaited or aborted by the caller. A panicking handler drops the pipe without
/// closing it, which the reader reports as an error.
pub(crate) fn spawn_handler(
    handler: Arc<dyn Handler>,
    ctx: InvocationContext,
    out: PipeWriter,
    body: InvocationBody,
    live: LiveGuard,
) {
    let closer = out.closer();
    let span = tracing::debug_span!("handler", request_id = %ctx.request_id);

    tokio::spawn(
        async move {
            let _live = live;
            match handler.invoke(ctx, out, body).await {
                Ok(()) => closer.close().await,
                Err(err) => {
                    tracing::debug!(error = %err, "handler returned an error");
                    closer.close_with_error(PipeError::new(format!("{err:#}"))).await
                }
            }
        }
        .instrument(span),
    );
}
