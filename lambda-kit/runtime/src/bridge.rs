//! Invocation loop: poll, run the handler as its own task, peek its output, then either stream it
//! to the control plane or report an error.
//!
//! Commitment happens at the first byte. Once the handler has produced output the response is
//! submitted even if the handler later fails; that late failure reaches the control plane as an
//! aborted request body, since the protocol cannot turn an in-flight response into an error.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::handler::{spawn_handler, Handler, InvocationContext, LiveGuard};
use crate::pipe::{pipe, PipeError, DEFAULT_PIPE_CAPACITY};
use crate::runtime_api::{ErrorReport, Invocation, RuntimeApi, TransportError};
use crate::scope::InvocationScope;

/// `errorType` reported for handlers that fail before producing output.
pub const HANDLER_ERROR_TYPE: &str = "Handler.Error";

/// How one invocation cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// Handler output was streamed as the response (possibly aborted mid-way).
    Streamed,
    /// The handler failed before writing; an error report was accepted.
    ErrorReported,
    /// The control plane rejected the response or error report.
    SubmissionFailed,
}

/// Processes invocations one at a time until polling fails or shutdown is requested.
pub struct Runtime<A> {
    api: A,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
    pipe_capacity: usize,
    live: Arc<AtomicUsize>,
}

impl<A: RuntimeApi> Runtime<A> {
    pub fn new(api: A, handler: impl Handler) -> Self {
        Self {
            api,
            handler: Arc::new(handler),
            shutdown: CancellationToken::new(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Root token; cancelling it stops polling and cancels the in-flight invocation's scope.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity.max(1);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handler tasks still running, including ones that outlived their invocation.
    pub fn live_handlers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Run until shutdown (`Ok`) or a transport failure (`Err`, fatal).
    pub async fn run(&self) -> Result<(), TransportError> {
        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("shutdown requested; stopping invocation loop");
                return Ok(());
            }

            match self.run_once().await {
                Ok(_) => {}
                Err(TransportError::Cancelled) => {
                    tracing::info!("shutdown requested while polling; stopping invocation loop");
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(error = %err, "polling for the next invocation failed");
                    return Err(err);
                }
            }
        }
    }

    /// Poll for one invocation and process it to completion.
    pub async fn run_once(&self) -> Result<InvocationOutcome, TransportError> {
        let invocation = self.api.next_invocation(&self.shutdown).await?;
        let span = tracing::info_span!("invocation", request_id = %invocation.request_id);
        Ok(self.process(invocation).instrument(span).await)
    }

    async fn process(&self, invocation: Invocation) -> InvocationOutcome {
        let Invocation {
            request_id,
            deadline,
            invoked_function_arn,
            trace_id,
            client_context,
            cognito_identity,
            body,
        } = invocation;

        let stragglers = self.live_handlers();
        if stragglers > 0 {
            tracing::warn!(
                live_handlers = stragglers,
                "handler tasks from earlier invocations are still running"
            );
        }

        let scope = InvocationScope::derive(&self.shutdown, deadline);
        let drain = body.drain_handle();
        let (writer, reader) = pipe(self.pipe_capacity);

        let ctx = InvocationContext {
            request_id: request_id.clone(),
            deadline,
            invoked_function_arn,
            trace_id,
            client_context,
            cognito_identity,
            cancellation: scope.token(),
        };
        spawn_handler(
            Arc::clone(&self.handler),
            ctx,
            writer,
            body,
            LiveGuard::enter(&self.live),
        );

        let mut output = reader.peekable();
        let early_failure: Option<PipeError> = match Pin::new(&mut output).peek().await {
            Some(Err(err)) => Some(err.clone()),
            // A first byte or a clean, empty end both commit to a response.
            Some(Ok(_)) | None => None,
        };

        let outcome = match early_failure {
            Some(err) => {
                drop(output);
                self.report_error(&request_id, err).await
            }
            None => match self
                .api
                .send_response(&self.shutdown, &request_id, output)
                .await
            {
                Ok(()) => {
                    tracing::debug!("response streamed");
                    InvocationOutcome::Streamed
                }
                Err(err) => {
                    tracing::error!(error = %err, "upstream /response failed");
                    InvocationOutcome::SubmissionFailed
                }
            },
        };

        drop(scope);
        let discarded = drain.drain().await;
        if discarded > 0 {
            tracing::debug!(bytes = discarded, "drained unread invocation body");
        }

        outcome
    }

    async fn report_error(&self, request_id: &str, err: PipeError) -> InvocationOutcome {
        tracing::warn!(error = %err, "handler failed before producing output");

        let report = ErrorReport::new(HANDLER_ERROR_TYPE, err.message());
        match self.api.send_error(&self.shutdown, request_id, report).await {
            Ok(()) => InvocationOutcome::ErrorReported,
            Err(err) => {
                tracing::error!(error = %err, "upstream /error failed");
                InvocationOutcome::SubmissionFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::Mutex,
        time::{Duration, SystemTime},
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use http::StatusCode;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::body::InvocationBody;
    use crate::handler::handler_fn;
    use crate::pipe::PipeWriter;
    use crate::runtime_api::{ResponseBody, SubmissionError};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Submitted {
        request_id: String,
        body: Vec<u8>,
        failure: Option<String>,
    }

    #[derive(Default)]
    struct FakeApi {
        queue: Mutex<VecDeque<Invocation>>,
        responses: Mutex<Vec<Submitted>>,
        errors: Mutex<Vec<(String, ErrorReport)>>,
        polls: AtomicUsize,
        reject_responses: bool,
        reject_errors: bool,
    }

    impl FakeApi {
        fn with(invocations: Vec<Invocation>) -> Arc<Self> {
            Arc::new(Self {
                queue: Mutex::new(invocations.into()),
                ..Default::default()
            })
        }

        fn responses(&self) -> Vec<Submitted> {
            self.responses.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<(String, ErrorReport)> {
            self.errors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuntimeApi for FakeApi {
        async fn next_invocation(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Invocation, TransportError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(TransportError::Status(StatusCode::SERVICE_UNAVAILABLE))
        }

        async fn send_response(
            &self,
            _cancel: &CancellationToken,
            request_id: &str,
            mut body: ResponseBody,
        ) -> Result<(), SubmissionError> {
            if self.reject_responses {
                return Err(SubmissionError::Status(StatusCode::PAYLOAD_TOO_LARGE));
            }

            let mut submitted = Submitted {
                request_id: request_id.to_string(),
                body: Vec::new(),
                failure: None,
            };
            while let Some(item) = body.next().await {
                match item {
                    Ok(chunk) => submitted.body.extend_from_slice(&chunk),
                    Err(err) => {
                        submitted.failure = Some(err.to_string());
                        break;
                    }
                }
            }
            self.responses.lock().unwrap().push(submitted);
            Ok(())
        }

        async fn send_error(
            &self,
            _cancel: &CancellationToken,
            request_id: &str,
            report: ErrorReport,
        ) -> Result<(), SubmissionError> {
            if self.reject_errors {
                return Err(SubmissionError::Status(StatusCode::BAD_REQUEST));
            }
            self.errors
                .lock()
                .unwrap()
                .push((request_id.to_string(), report));
            Ok(())
        }
    }

    async fn pong(
        _ctx: InvocationContext,
        mut out: PipeWriter,
        _body: InvocationBody,
    ) -> anyhow::Result<()> {
        out.write_all(b"PONG").await?;
        Ok(())
    }

    async fn fail_or_echo(
        _ctx: InvocationContext,
        mut out: PipeWriter,
        mut body: InvocationBody,
    ) -> anyhow::Result<()> {
        let payload = body.read_to_end().await?;
        if payload.as_ref() == b"fail" {
            anyhow::bail!("asked to fail");
        }
        out.write_all(&payload).await?;
        Ok(())
    }

    async fn fail_immediately(
        _ctx: InvocationContext,
        _out: PipeWriter,
        _body: InvocationBody,
    ) -> anyhow::Result<()> {
        anyhow::bail!("handler exploded")
    }

    #[tokio::test]
    async fn output_is_streamed_without_error_report() {
        let api = FakeApi::with(vec![Invocation::new("abc", InvocationBody::empty())
            .with_deadline(SystemTime::now() + Duration::from_secs(5))]);
        let runtime = Runtime::new(Arc::clone(&api), handler_fn(pong));

        let err = runtime.run().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Status(StatusCode::SERVICE_UNAVAILABLE)
        ));

        assert_eq!(
            api.responses(),
            vec![Submitted {
                request_id: "abc".to_string(),
                body: b"PONG".to_vec(),
                failure: None,
            }]
        );
        assert!(api.errors().is_empty());
    }

    #[tokio::test]
    async fn failure_before_output_is_reported() {
        let api = FakeApi::with(vec![Invocation::new("xyz", InvocationBody::empty())]);
        let runtime = Runtime::new(Arc::clone(&api), handler_fn(fail_immediately));

        let outcome = runtime.run_once().await.unwrap();
        assert_eq!(outcome, InvocationOutcome::ErrorReported);

        let errors = api.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "xyz");
        assert_eq!(errors[0].1.error_type, HANDLER_ERROR_TYPE);
        assert!(errors[0].1.error_message.contains("handler exploded"));
        assert!(api.responses().is_empty());
    }

    #[tokio::test]
    async fn failure_after_first_byte_still_streams() {
        let api = FakeApi::with(vec![Invocation::new("late", InvocationBody::empty())]);
        let runtime = Runtime::new(
            Arc::clone(&api),
            handler_fn(
                |_ctx: InvocationContext, mut out: PipeWriter, _body: InvocationBody| async move {
                    out.write_all(b"partial").await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    anyhow::bail!("lost the database")
                },
            ),
        );

        let outcome = runtime.run_once().await.unwrap();
        assert_eq!(outcome, InvocationOutcome::Streamed);

        let responses = api.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].body, b"partial");
        assert!(responses[0]
            .failure
            .as_deref()
            .unwrap()
            .contains("lost the database"));
        assert!(api.errors().is_empty());
    }

    #[tokio::test]
    async fn empty_success_streams_empty_body() {
        let api = FakeApi::with(vec![Invocation::new("empty", InvocationBody::empty())]);
        let runtime = Runtime::new(
            Arc::clone(&api),
            handler_fn(
                |_ctx: InvocationContext, _out: PipeWriter, _body: InvocationBody| async move {
                    Ok(())
                },
            ),
        );

        assert_eq!(
            runtime.run_once().await.unwrap(),
            InvocationOutcome::Streamed
        );
        let responses = api.responses();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].body.is_empty());
        assert!(responses[0].failure.is_none());
    }

    #[tokio::test]
    async fn panicking_handler_is_reported_as_error() {
        let api = FakeApi::with(vec![Invocation::new("panic", InvocationBody::empty())]);
        let runtime = Runtime::new(
            Arc::clone(&api),
            handler_fn(
                |_ctx: InvocationContext, _out: PipeWriter, _body: InvocationBody| async move {
                    if true {
                        panic!("handler panicked");
                    }
                    Ok(())
                },
            ),
        );

        assert_eq!(
            runtime.run_once().await.unwrap(),
            InvocationOutcome::ErrorReported
        );
        assert_eq!(api.errors()[0].0, "panic");
        assert!(api.responses().is_empty());
    }

    #[tokio::test]
    async fn loop_continues_after_handler_failures() {
        let api = FakeApi::with(vec![
            Invocation::new("1", "fail"),
            Invocation::new("2", "ok"),
            Invocation::new("3", "fail"),
        ]);
        let runtime = Runtime::new(Arc::clone(&api), handler_fn(fail_or_echo));

        assert!(runtime.run().await.is_err());

        let reported: Vec<_> = api.errors().into_iter().map(|(id, _)| id).collect();
        assert_eq!(reported, vec!["1".to_string(), "3".to_string()]);
        let responses = api.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id, "2");
        assert_eq!(responses[0].body, b"ok");
    }

    #[tokio::test]
    async fn deadline_cancels_handler_scope() {
        let api = FakeApi::with(vec![Invocation::new("deadline", InvocationBody::empty())
            .with_deadline(SystemTime::now() + Duration::from_millis(50))]);
        let runtime = Runtime::new(
            Arc::clone(&api),
            handler_fn(
                |ctx: InvocationContext, mut out: PipeWriter, _body: InvocationBody| async move {
                    ctx.cancelled().await;
                    out.write_all(b"timed out").await?;
                    Ok(())
                },
            ),
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), runtime.run_once())
            .await
            .expect("deadline should unblock the handler")
            .unwrap();
        assert_eq!(outcome, InvocationOutcome::Streamed);
        assert_eq!(api.responses()[0].body, b"timed out");
    }

    #[tokio::test]
    async fn shutdown_cancels_scope_without_deadline() {
        let api = FakeApi::with(vec![Invocation::new("no-deadline", InvocationBody::empty())]);
        let shutdown = CancellationToken::new();
        let runtime = Runtime::new(
            Arc::clone(&api),
            handler_fn(
                |ctx: InvocationContext, mut out: PipeWriter, _body: InvocationBody| async move {
                    ctx.cancelled().await;
                    out.write_all(b"shutting down").await?;
                    Ok(())
                },
            ),
        )
        .with_shutdown(shutdown.clone());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), runtime.run())
            .await
            .expect("shutdown should end the loop")
            .unwrap();
        assert_eq!(api.responses()[0].body, b"shutting down");
    }

    #[tokio::test]
    async fn unread_body_is_drained() {
        let consumed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&consumed);
        let body = InvocationBody::from_stream(
            futures::stream::iter(vec![
                Ok::<_, io::Error>(Bytes::from_static(b"one")),
                Ok(Bytes::from_static(b"two")),
            ])
            .inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let api = FakeApi::with(vec![Invocation::new("drain", body)]);
        let runtime = Runtime::new(Arc::clone(&api), handler_fn(pong));

        runtime.run_once().await.unwrap();
        assert_eq!(consumed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stragglers_are_counted_not_killed() {
        let api = Arc::new(FakeApi {
            queue: Mutex::new(VecDeque::from(vec![Invocation::new(
                "slow",
                InvocationBody::empty(),
            )])),
            reject_responses: true,
            ..Default::default()
        });
        let runtime = Runtime::new(
            Arc::clone(&api),
            handler_fn(
                |_ctx: InvocationContext, mut out: PipeWriter, _body: InvocationBody| async move {
                    out.write_all(b"x").await?;
                    // Ignores cancellation on purpose.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                },
            ),
        );

        let outcome = runtime.run_once().await.unwrap();
        assert_eq!(outcome, InvocationOutcome::SubmissionFailed);
        assert_eq!(runtime.live_handlers(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runtime.live_handlers(), 0);
    }

    #[tokio::test]
    async fn loop_continues_after_rejected_submissions() {
        let api = Arc::new(FakeApi {
            queue: Mutex::new(VecDeque::from(vec![
                Invocation::new("1", "fail"),
                Invocation::new("2", "ok"),
                Invocation::new("3", "fail"),
            ])),
            reject_responses: true,
            reject_errors: true,
            ..Default::default()
        });
        let runtime = Runtime::new(Arc::clone(&api), handler_fn(fail_or_echo));

        assert_eq!(
            runtime.run_once().await.unwrap(),
            InvocationOutcome::SubmissionFailed
        );

        let err = runtime.run().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Status(StatusCode::SERVICE_UNAVAILABLE)
        ));
        // Three invocations plus the final poll that found the queue empty.
        assert_eq!(api.polls.load(Ordering::SeqCst), 4);
        assert!(api.responses().is_empty());
        assert!(api.errors().is_empty());
    }

    #[tokio::test]
    async fn small_pipe_capacity_still_streams_everything() {
        let api = FakeApi::with(vec![Invocation::new("chunks", InvocationBody::empty())]);
        let runtime = Runtime::new(
            Arc::clone(&api),
            handler_fn(
                |_ctx: InvocationContext, mut out: PipeWriter, _body: InvocationBody| async move {
                    for part in [&b"one,"[..], b"two,", b"three"] {
                        out.write_all(part).await?;
                    }
                    Ok(())
                },
            ),
        )
        .with_pipe_capacity(0);

        assert_eq!(
            runtime.run_once().await.unwrap(),
            InvocationOutcome::Streamed
        );
        assert_eq!(api.responses()[0].body, b"one,two,three");
    }
}
