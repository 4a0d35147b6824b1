use bytes::Bytes;
use clap::{Parser, ValueEnum};
use http::{header::CONTENT_TYPE, HeaderValue, Request, StatusCode};
use lambda_stream_http::{http_adapter, ResponseWriter};
use lambda_stream_runtime::{
    handler_fn, init_tracing, CancellationToken, InvocationBody, InvocationContext, PipeWriter,
    RuntimeConfig,
};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Raw payload in, `PONG` plus the payload out.
    Echo,
    /// API Gateway HTTP API (v2.0) envelopes.
    Http,
}

#[derive(Debug, Parser)]
#[command(about = "Streaming custom runtime for AWS Lambda")]
struct Args {
    #[arg(long, value_enum, env = "LAMBDA_STREAM_MODE", default_value = "echo")]
    mode: Mode,
}

async fn echo(
    ctx: InvocationContext,
    mut out: PipeWriter,
    mut body: InvocationBody,
) -> anyhow::Result<()> {
    out.write_all(b"PONG\n").await?;
    while let Some(chunk) = body.chunk().await? {
        if ctx.is_cancelled() {
            anyhow::bail!("invocation {} cancelled", ctx.request_id);
        }
        out.write_all(&chunk).await?;
    }
    Ok(())
}

async fn hello(req: Request<Bytes>, res: ResponseWriter) -> anyhow::Result<()> {
    res.insert_header(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res.set_status(StatusCode::OK).await?;
    res.write(format!("hello from {} {}\n", req.method(), req.uri().path()).as_bytes())
        .await?;
    if !req.body().is_empty() {
        res.write(req.body()).await?;
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = RuntimeConfig::from_env()?;
    tracing::info!(mode = ?args.mode, "starting");

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    match args.mode {
        Mode::Echo => lambda_stream_runtime::run(config, handler_fn(echo), shutdown).await,
        Mode::Http => lambda_stream_runtime::run(config, http_adapter(hello), shutdown).await,
    }
}
