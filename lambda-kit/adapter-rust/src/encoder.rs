//! Incremental encoder for API Gateway HTTP API (v2.0) response envelopes.
//!
//! The envelope is written field by field:
//!
//! ```text
//! {"isBase64Encoded":true,"statusCode":201,"cookies":[..],"multiValueHeaders":{..},"body":"<base64>"}
//! ```
//!
//! Everything up to the opening quote of `body` is emitted at commit time (first status set or
//! first body write). Body bytes then go through a streaming base64 transform straight into the
//! sink; only the 0-2 bytes that do not fill a base64 block are held back between writes.

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::header::SET_COOKIE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

enum Phase {
    Unopened,
    Committed,
    Finished,
}

struct Sink<W> {
    out: W,
    phase: Phase,
    carry: Vec<u8>,
}

impl<W> Sink<W> {
    fn encode_chunk(&mut self, mut data: &[u8]) -> String {
        let mut encoded = String::new();

        if !self.carry.is_empty() {
            let take = (3 - self.carry.len()).min(data.len());
            self.carry.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.carry.len() < 3 {
                return encoded;
            }
            STANDARD.encode_string(&self.carry, &mut encoded);
            self.carry.clear();
        }

        let whole = data.len() - data.len() % 3;
        STANDARD.encode_string(&data[..whole], &mut encoded);
        self.carry.extend_from_slice(&data[whole..]);
        encoded
    }

    fn encode_tail(&mut self) -> String {
        let tail = STANDARD.encode(&self.carry);
        self.carry.clear();
        tail
    }
}

struct Head {
    frozen: bool,
    headers: HeaderMap,
}

/// Writes one response envelope into `W`.
///
/// Headers may be changed until commit; afterwards changes are silently ignored. All methods take
/// `&self`, so one encoder can be shared by concurrent writers. The commit transition and body
/// writes are serialized by a single async lock around the sink.
pub struct EnvelopeEncoder<W> {
    head: Mutex<Head>,
    sink: tokio::sync::Mutex<Sink<W>>,
}

impl<W> EnvelopeEncoder<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W) -> Self {
        Self {
            head: Mutex::new(Head {
                frozen: false,
                headers: HeaderMap::new(),
            }),
            sink: tokio::sync::Mutex::new(Sink {
                out,
                phase: Phase::Unopened,
                carry: Vec::new(),
            }),
        }
    }

    fn lock_head(&self) -> MutexGuard<'_, Head> {
        self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace all values of `name`. Returns `false` once headers are frozen.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut head = self.lock_head();
        if head.frozen {
            return false;
        }
        head.headers.insert(name, value);
        true
    }

    /// Add a value to `name`, keeping earlier ones. Returns `false` once headers are frozen.
    pub fn append_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut head = self.lock_head();
        if head.frozen {
            return false;
        }
        head.headers.append(name, value);
        true
    }

    pub fn remove_header(&self, name: &HeaderName) -> bool {
        let mut head = self.lock_head();
        if head.frozen {
            return false;
        }
        head.headers.remove(name);
        true
    }

    /// Shorthand for appending a `Set-Cookie` header; encoded into the envelope's `cookies`.
    pub fn add_cookie(&self, cookie: HeaderValue) -> bool {
        self.append_header(SET_COOKIE, cookie)
    }

    /// Snapshot of the pending headers (empty after commit).
    pub fn headers(&self) -> HeaderMap {
        self.lock_head().headers.clone()
    }

    pub fn is_committed(&self) -> bool {
        self.lock_head().frozen
    }

    /// Commit with `status`. Only the first status set (or first write) counts.
    pub async fn set_status(&self, status: StatusCode) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        self.commit(&mut sink, status).await
    }

    /// Append body bytes, committing with status 200 if nothing was committed yet.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        if matches!(sink.phase, Phase::Finished) {
            return Err(io::Error::other("response envelope already finished"));
        }
        self.commit(&mut sink, StatusCode::OK).await?;

        let encoded = sink.encode_chunk(data);
        if !encoded.is_empty() {
            sink.out.write_all(encoded.as_bytes()).await?;
        }
        Ok(())
    }

    /// Flush pending base64 bytes and close the envelope. Idempotent.
    pub async fn finish(&self) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        if matches!(sink.phase, Phase::Finished) {
            return Ok(());
        }
        self.commit(&mut sink, StatusCode::OK).await?;

        let mut tail = sink.encode_tail();
        tail.push_str("\"}");
        sink.out.write_all(tail.as_bytes()).await?;
        sink.out.flush().await?;
        sink.phase = Phase::Finished;
        Ok(())
    }

    async fn commit(&self, sink: &mut Sink<W>, status: StatusCode) -> io::Result<()> {
        if !matches!(sink.phase, Phase::Unopened) {
            return Ok(());
        }

        let headers = {
            let mut head = self.lock_head();
            head.frozen = true;
            std::mem::take(&mut head.headers)
        };
        let prelude = encode_prelude(status, headers)?;

        sink.phase = Phase::Committed;
        sink.out.write_all(&prelude).await
    }

    /// Give back the sink. Only meaningful once the envelope is finished.
    pub fn into_inner(self) -> W {
        self.sink.into_inner().out
    }
}

fn header_text(value: &HeaderValue) -> String {
    match value.to_str() {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
    }
}

fn push_json<T: serde::Serialize + ?Sized>(out: &mut Vec<u8>, value: &T) -> io::Result<()> {
    serde_json::to_writer(out, value).map_err(io::Error::other)
}

/// Everything before the body's base64 text, ending with the body's opening quote.
fn encode_prelude(status: StatusCode, mut headers: HeaderMap) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(br#"{"isBase64Encoded":true,"statusCode":"#);
    out.extend_from_slice(status.as_u16().to_string().as_bytes());
    out.push(b',');

    let cookies: Vec<String> = headers.get_all(SET_COOKIE).iter().map(header_text).collect();
    headers.remove(SET_COOKIE);
    if !cookies.is_empty() {
        out.extend_from_slice(br#""cookies":"#);
        push_json(&mut out, &cookies)?;
        out.push(b',');
    }

    if !headers.is_empty() {
        out.extend_from_slice(br#""multiValueHeaders":{"#);
        for (idx, name) in headers.keys().enumerate() {
            if idx > 0 {
                out.push(b',');
            }
            push_json(&mut out, name.as_str())?;
            out.push(b':');
            let values: Vec<String> = headers.get_all(name).iter().map(header_text).collect();
            push_json(&mut out, &values)?;
        }
        out.extend_from_slice(b"},");
    }

    out.extend_from_slice(br#""body":""#);
    Ok(out)
}
