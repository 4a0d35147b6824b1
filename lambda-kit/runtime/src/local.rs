//! Local-development fallback: serve the handler over plain HTTP when no Runtime API is configured.
//!
//! Each request body becomes the invocation body and the handler's output becomes the response
//! body. A handler that fails before writing gets a `500` with the error text; one that fails after
//! writing has its connection aborted so the client sees a broken response instead of a short one.

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse as _;
use axum::Router;
use bytes::Bytes;
use futures::{stream::Peekable, Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;

use crate::body::InvocationBody;
use crate::handler::{spawn_handler, Handler, InvocationContext, LiveGuard};
use crate::pipe::{pipe, PipeError, PipeReader, DEFAULT_PIPE_CAPACITY};
use crate::scope::InvocationScope;

/// How long in-flight requests may keep running after shutdown before the server is dropped.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct LocalState {
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
    next_id: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
}

pub async fn serve(
    addr: SocketAddr,
    handler: impl Handler,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "serving handler locally");
    serve_listener(listener, handler, shutdown).await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    handler: impl Handler,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    serve_with_grace(listener, handler, shutdown, SHUTDOWN_GRACE).await
}

pub(crate) async fn serve_with_grace(
    listener: tokio::net::TcpListener,
    handler: impl Handler,
    shutdown: CancellationToken,
    grace: Duration,
) -> anyhow::Result<()> {
    let app = router(Arc::new(handler), shutdown.clone());

    let graceful = shutdown.clone();
    let server = std::future::IntoFuture::into_future(
        axum::serve(listener, app).with_graceful_shutdown(async move {
            graceful.cancelled().await;
        }),
    );
    tokio::pin!(server);

    let grace_expired = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        res = &mut server => res?,
        _ = grace_expired => {
            tracing::warn!(grace = ?grace, "in-flight requests outlived the shutdown grace period; closing");
        }
    }
    Ok(())
}

pub fn router(handler: Arc<dyn Handler>, shutdown: CancellationToken) -> Router {
    let state = LocalState {
        handler,
        shutdown,
        next_id: Arc::new(AtomicU64::new(1)),
        live: Arc::new(AtomicUsize::new(0)),
    };
    Router::new().fallback(handle_local).with_state(state)
}

async fn handle_local(State(state): State<LocalState>, req: Request<Body>) -> Response<Body> {
    let request_id = format!("local-{}", state.next_id.fetch_add(1, Ordering::Relaxed));
    tracing::debug!(
        request_id = %request_id,
        method = %req.method(),
        uri = %req.uri(),
        "local invocation"
    );

    let scope = InvocationScope::derive(&state.shutdown, None);
    let (writer, reader) = pipe(DEFAULT_PIPE_CAPACITY);
    let ctx = InvocationContext {
        request_id: request_id.clone(),
        deadline: None,
        invoked_function_arn: None,
        trace_id: None,
        client_context: None,
        cognito_identity: None,
        cancellation: scope.token(),
    };
    let body = InvocationBody::from_stream(req.into_body().into_data_stream());
    spawn_handler(
        Arc::clone(&state.handler),
        ctx,
        writer,
        body,
        LiveGuard::enter(&state.live),
    );

    let mut output = reader.peekable();
    let early_failure: Option<PipeError> = match Pin::new(&mut output).peek().await {
        Some(Err(err)) => Some(err.clone()),
        Some(Ok(_)) | None => None,
    };

    if let Some(err) = early_failure {
        tracing::warn!(request_id = %request_id, error = %err, "handler failed before writing");
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}\n")).into_response();
    }

    Response::new(Body::from_stream(ScopedOutput {
        output,
        _scope: scope,
    }))
}

/// Keeps the invocation scope alive for as long as the response body is being sent.
struct ScopedOutput {
    output: Peekable<PipeReader>,
    _scope: InvocationScope,
}

impl Stream for ScopedOutput {
    type Item = Result<Bytes, PipeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().output.poll_next_unpin(cx)
    }
}
