//! Decoding of API Gateway HTTP API (v2.0) request envelopes into `http::Request`.

use aws_lambda_events::event::apigw::ApiGatewayV2httpRequest;
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use bytes::Bytes;
use http::header::{COOKIE, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Request, Uri, Version};

/// Standard alphabet, accepting bodies with or without trailing padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid request envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 request body: {0}")]
    Body(#[from] base64::DecodeError),
    #[error("invalid request target {uri:?}: {reason}")]
    Uri { uri: String, reason: String },
    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),
}

/// Parse a raw invocation payload as an HTTP API (v2.0) envelope.
pub fn decode_request(payload: &[u8]) -> Result<Request<Bytes>, DecodeError> {
    let event: ApiGatewayV2httpRequest = serde_json::from_slice(payload)?;
    into_request(event)
}

/// Convert a parsed envelope into a request.
///
/// Header values are copied as they are: values the gateway already joined with commas stay
/// joined. The envelope's `requestContext` is attached as a request extension.
pub fn into_request(event: ApiGatewayV2httpRequest) -> Result<Request<Bytes>, DecodeError> {
    let ctx = event.request_context;

    let uri = request_target(
        event
            .raw_path
            .as_deref()
            .or(ctx.http.path.as_deref())
            .unwrap_or_default(),
        event.raw_query_string.as_deref().unwrap_or_default(),
    )?;

    let mut headers = HeaderMap::new();
    if let Some(cookies) = event.cookies.filter(|c| !c.is_empty()) {
        headers.insert(COOKIE, HeaderValue::from_str(&cookies.join("; "))?);
    }
    if let Some(user_agent) = ctx.http.user_agent.as_deref().filter(|v| !v.is_empty()) {
        headers.insert(USER_AGENT, HeaderValue::from_str(user_agent)?);
    }
    if let Some(domain) = ctx.domain_name.as_deref().filter(|v| !v.is_empty()) {
        headers.insert(HOST, HeaderValue::from_str(domain)?);
    }
    // Explicit envelope headers win over the values synthesized above.
    headers.extend(event.headers);

    let body = match event.body {
        Some(body) if event.is_base64_encoded => Bytes::from(LENIENT_BASE64.decode(body)?),
        Some(body) => Bytes::from(body),
        None => Bytes::new(),
    };

    let mut request = Request::builder()
        .method(ctx.http.method.clone())
        .uri(uri)
        .version(http_version(ctx.http.protocol.as_deref()))
        .body(body)?;
    *request.headers_mut() = headers;
    request.extensions_mut().insert(ctx);
    Ok(request)
}

fn request_target(path: &str, query: &str) -> Result<Uri, DecodeError> {
    let path = if path.is_empty() { "/" } else { path };
    let target = if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    };

    if !target.starts_with('/') {
        return Err(DecodeError::Uri {
            uri: target,
            reason: "path must start with '/'".to_string(),
        });
    }
    target.parse::<Uri>().map_err(|err| DecodeError::Uri {
        uri: target.clone(),
        reason: err.to_string(),
    })
}

fn http_version(protocol: Option<&str>) -> Version {
    match protocol.map(str::to_ascii_uppercase).as_deref() {
        Some("HTTP/0.9") => Version::HTTP_09,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some("HTTP/2" | "HTTP/2.0") => Version::HTTP_2,
        Some("HTTP/3" | "HTTP/3.0") => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}
