//! Lambda Runtime API client.
//!
//! See <https://docs.aws.amazon.com/lambda/latest/dg/runtimes-api.html>.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::stream::Peekable;
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::body::InvocationBody;
use crate::pipe::PipeReader;

pub const API_VERSION: &str = "2018-06-01";

pub const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
pub const DEADLINE_HEADER: &str = "Lambda-Runtime-Deadline-Ms";
pub const FUNCTION_ARN_HEADER: &str = "Lambda-Runtime-Invoked-Function-Arn";
pub const TRACE_ID_HEADER: &str = "Lambda-Runtime-Trace-Id";
pub const CLIENT_CONTEXT_HEADER: &str = "Lambda-Runtime-Client-Context";
pub const COGNITO_IDENTITY_HEADER: &str = "Lambda-Runtime-Cognito-Identity";
pub const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

/// Failure to fetch the next invocation. Fatal to the invocation loop.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("runtime shutdown requested")]
    Cancelled,
    #[error("upstream /next request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream /next failed (status {0})")]
    Status(StatusCode),
    #[error("upstream /next missing {REQUEST_ID_HEADER}")]
    MissingRequestId,
}

/// The control plane rejected (or never received) a response or error report.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("runtime shutdown requested")]
    Cancelled,
    #[error("upstream submission failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream submission rejected (status {0})")]
    Status(StatusCode),
}

/// One unit of work pulled from the control plane.
#[derive(Debug)]
pub struct Invocation {
    pub request_id: String,
    pub deadline: Option<SystemTime>,
    pub invoked_function_arn: Option<String>,
    pub trace_id: Option<String>,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
    pub body: InvocationBody,
}

impl Invocation {
    pub fn new(request_id: impl Into<String>, body: impl Into<InvocationBody>) -> Self {
        Self {
            request_id: request_id.into(),
            deadline: None,
            invoked_function_arn: None,
            trace_id: None,
            client_context: None,
            cognito_identity: None,
            body: body.into(),
        }
    }

    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Body of `POST /runtime/invocation/{id}/error`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub error_message: String,
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<String>,
}

impl ErrorReport {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            error_type: error_type.into(),
            stack_trace: Vec::new(),
        }
    }
}

/// Handler output after the first-byte peek, streamed as the response body.
pub type ResponseBody = Peekable<PipeReader>;

#[async_trait]
pub trait RuntimeApi: Send + Sync + 'static {
    /// Block until the control plane hands out the next invocation.
    async fn next_invocation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Invocation, TransportError>;

    /// Stream `body` as the invocation's response. The reply body is drained and discarded.
    async fn send_response(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        body: ResponseBody,
    ) -> Result<(), SubmissionError>;

    /// Report an invocation error. Only valid while no response bytes have been sent.
    async fn send_error(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        report: ErrorReport,
    ) -> Result<(), SubmissionError>;
}

#[async_trait]
impl<T: RuntimeApi + ?Sized> RuntimeApi for Arc<T> {
    async fn next_invocation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Invocation, TransportError> {
        (**self).next_invocation(cancel).await
    }

    async fn send_response(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        body: ResponseBody,
    ) -> Result<(), SubmissionError> {
        (**self).send_response(cancel, request_id, body).await
    }

    async fn send_error(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        report: ErrorReport,
    ) -> Result<(), SubmissionError> {
        (**self).send_error(cancel, request_id, report).await
    }
}

/// reqwest-backed [`RuntimeApi`].
#[derive(Clone)]
pub struct RuntimeApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl RuntimeApiClient {
    /// `base_url` includes the scheme, e.g. `http://127.0.0.1:9001`.
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().http1_only().build()?;
        Ok(Self { base_url, http })
    }

    fn invocation_url(&self, request_id: &str, leaf: &str) -> String {
        format!(
            "{}/{API_VERSION}/runtime/invocation/{request_id}/{leaf}",
            self.base_url
        )
    }
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Absent or unparseable deadline headers mean "no known deadline". Negative values are instants
/// before the epoch, so the invocation is already past its deadline.
pub(crate) fn parse_deadline(headers: &HeaderMap) -> Option<SystemTime> {
    let millis = headers
        .get(DEADLINE_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let offset = Duration::from_millis(millis.unsigned_abs());
    if millis < 0 {
        UNIX_EPOCH.checked_sub(offset)
    } else {
        UNIX_EPOCH.checked_add(offset)
    }
}

#[async_trait]
impl RuntimeApi for RuntimeApiClient {
    async fn next_invocation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Invocation, TransportError> {
        let url = format!("{}/{API_VERSION}/runtime/invocation/next", self.base_url);
        let resp = until_cancelled(cancel, self.http.get(url).send())
            .await
            .ok_or(TransportError::Cancelled)??;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }

        let headers = resp.headers();
        let request_id =
            header_string(headers, REQUEST_ID_HEADER).ok_or(TransportError::MissingRequestId)?;
        let deadline = parse_deadline(headers);
        let invocation = Invocation {
            deadline,
            invoked_function_arn: header_string(headers, FUNCTION_ARN_HEADER),
            trace_id: header_string(headers, TRACE_ID_HEADER),
            client_context: header_string(headers, CLIENT_CONTEXT_HEADER),
            cognito_identity: header_string(headers, COGNITO_IDENTITY_HEADER),
            request_id,
            body: InvocationBody::from_stream(resp.bytes_stream()),
        };

        tracing::debug!(
            request_id = %invocation.request_id,
            has_deadline = invocation.deadline.is_some(),
            "fetched upstream invocation"
        );
        Ok(invocation)
    }

    async fn send_response(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        body: ResponseBody,
    ) -> Result<(), SubmissionError> {
        let url = self.invocation_url(request_id, "response");
        let send = self
            .http
            .post(url)
            .body(reqwest::Body::wrap_stream(body))
            .send();
        let resp = until_cancelled(cancel, send)
            .await
            .ok_or(SubmissionError::Cancelled)??;

        let status = resp.status();
        let _ = resp.bytes().await;
        if !status.is_success() {
            return Err(SubmissionError::Status(status));
        }
        Ok(())
    }

    async fn send_error(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        report: ErrorReport,
    ) -> Result<(), SubmissionError> {
        let url = self.invocation_url(request_id, "error");
        let send = self
            .http
            .post(url)
            .header(ERROR_TYPE_HEADER, report.error_type.as_str())
            .json(&report)
            .send();
        let resp = until_cancelled(cancel, send)
            .await
            .ok_or(SubmissionError::Cancelled)??;

        let status = resp.status();
        let _ = resp.bytes().await;
        if !status.is_success() {
            return Err(SubmissionError::Status(status));
        }
        Ok(())
    }
}
