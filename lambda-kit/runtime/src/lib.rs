//! `lambda-stream-runtime` is a custom AWS Lambda runtime that streams handler output.
//!
//! Handlers get a push-style writer ([`PipeWriter`]); the runtime turns it into the pull-style
//! request body of `POST /runtime/invocation/{id}/response`, committing to a response only once the
//! handler has produced its first byte. Handlers that fail before that point are reported through
//! `POST /runtime/invocation/{id}/error` instead.
//!
//! Core modules:
//! - [`runtime_api`]: Runtime API client (`/next`, `/response`, `/error`)
//! - [`bridge`]: the invocation loop
//! - [`pipe`]: in-process byte pipe between handler and submission
//! - [`handler`]: handler trait and invocation context
//! - [`local`]: plain HTTP fallback used when `AWS_LAMBDA_RUNTIME_API` is not set

pub mod body;
pub mod bridge;
pub mod config;
pub mod handler;
pub mod local;
pub mod pipe;
pub mod runtime_api;
mod scope;

pub use body::InvocationBody;
pub use bridge::{InvocationOutcome, Runtime, HANDLER_ERROR_TYPE};
pub use config::RuntimeConfig;
pub use handler::{handler_fn, Handler, HandlerFn, InvocationContext};
pub use pipe::{pipe, PipeCloser, PipeError, PipeReader, PipeWriter};
pub use runtime_api::{
    ErrorReport, Invocation, RuntimeApi, RuntimeApiClient, SubmissionError, TransportError,
};
pub use tokio_util::sync::CancellationToken;

/// Run `handler` against the Runtime API, or locally over HTTP when none is configured.
///
/// Returns `Ok` once `shutdown` is cancelled. A failed poll is returned as an error; the process is
/// expected to exit rather than retry.
pub async fn run(
    config: RuntimeConfig,
    handler: impl Handler,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let Some(base_url) = config.runtime_base_url() else {
        tracing::info!(
            addr = %config.local_addr,
            "{} not set; serving handler locally",
            config::RUNTIME_API_ENV
        );
        return local::serve(config.local_addr, handler, shutdown).await;
    };

    tracing::info!(runtime_api = %base_url, "starting invocation loop");
    let api = RuntimeApiClient::new(base_url)?;
    Runtime::new(api, handler)
        .with_shutdown(shutdown)
        .run()
        .await?;
    Ok(())
}

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG` (default `info`) and switches to JSON lines when `AWS_LAMBDA_LOG_FORMAT=json`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("AWS_LAMBDA_LOG_FORMAT").unwrap_or_default();
    if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
