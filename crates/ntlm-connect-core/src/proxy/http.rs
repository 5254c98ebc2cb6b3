//! HTTP CONNECT framing.
//!
//! Writes CONNECT requests onto a proxy connection and reads the proxy's
//! HTTP/1.1 response back. The response head is consumed byte by byte so no
//! tunnel bytes that follow it are buffered away.

use crate::error::TunnelError;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::fmt;
use std::io::{self, Cursor};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_LINE_BYTES: usize = 4096;

/// Single-read request body.
pub type BodyReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Produces a fresh copy of a request body each time it is called.
pub type BodySource = Arc<dyn Fn() -> io::Result<BodyReader> + Send + Sync>;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

pub struct ConnectRequest {
    target: String,
    headers: HeaderMap,
    body: Option<BodyReader>,
    get_body: Option<BodySource>,
    body_sent: bool,
}

impl ConnectRequest {
    pub const METHOD: &'static str = "CONNECT";

    pub fn new(target: impl Into<String>) -> Self {
        ConnectRequest {
            target: target.into(),
            headers: HeaderMap::new(),
            body: None,
            get_body: None,
            body_sent: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Attach a body that can only be read once.
    pub fn with_body(mut self, body: BodyReader) -> Self {
        self.body = Some(body);
        self.get_body = None;
        self
    }

    /// Attach a body that can be re-obtained from `source` for a resend.
    pub fn with_body_source(mut self, source: BodySource) -> io::Result<Self> {
        self.body = Some(source()?);
        self.get_body = Some(source);
        Ok(self)
    }

    /// Attach an in-memory body; always replayable.
    pub fn with_bytes(mut self, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        self.body = Some(Box::new(Cursor::new(bytes.to_vec())));
        self.get_body = Some(Arc::new(move || {
            Ok(Box::new(Cursor::new(bytes.to_vec())) as BodyReader)
        }));
        self
    }

    pub fn method(&self) -> &'static str {
        Self::METHOD
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Replace every value of `name` with `value`.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Add every header from `defaults` whose name the request does not carry.
    pub fn merge_headers(&mut self, defaults: &HeaderMap) {
        for name in defaults.keys() {
            if self.headers.contains_key(name) {
                continue;
            }
            for value in defaults.get_all(name) {
                self.headers.append(name.clone(), value.clone());
            }
        }
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some() || self.body_sent
    }

    pub fn is_replayable(&self) -> bool {
        self.get_body.is_some()
    }

    /// Make the body readable again after a send.
    ///
    /// Fails with [`TunnelError::BodyNotReplayable`] when a body was sent and
    /// there is no way to obtain it again.
    pub fn rewind_body(&mut self) -> Result<(), TunnelError> {
        if !self.body_sent {
            return Ok(());
        }
        match &self.get_body {
            Some(source) => {
                self.body = Some(source()?);
                self.body_sent = false;
                Ok(())
            }
            None => Err(TunnelError::BodyNotReplayable),
        }
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("target", &self.target)
            .field("headers", &self.headers.len())
            .field("has_body", &self.has_body())
            .field("replayable", &self.is_replayable())
            .finish()
    }
}

/// Serialize `request` onto `stream`. A body, if any, is consumed.
pub async fn write_request<W>(stream: &mut W, request: &mut ConnectRequest) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let body = match request.body.take() {
        Some(mut reader) => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            request.body_sent = true;
            Some(buf)
        }
        None => None,
    };

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!("{} {} HTTP/1.1\r\nHost: {}\r\n", ConnectRequest::METHOD, request.target, request.target)
            .as_bytes(),
    );
    for (name, value) in request.headers.iter() {
        // Framing comes from the body alone.
        if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(canonical_name(name.as_str()).as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if let Some(body) = &body {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(&body);
    }

    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// `proxy-authorization` -> `Proxy-Authorization`
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Status and headers of a proxy response. The body has already been
/// drained from the connection and only its length is kept.
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    status: StatusCode,
    headers: HeaderMap,
    body_len: u64,
}

impl ConnectResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_len(&self) -> u64 {
        self.body_len
    }
}

#[derive(Debug, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Chunked,
    Length(u64),
    UntilEof,
}

/// Read the response to `request` from `stream` and discard its body.
pub async fn read_response<R>(stream: &mut R, request: &ConnectRequest) -> Result<ConnectResponse, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let head = read_head(stream).await?;

    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_buf);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(TunnelError::MalformedResponse("incomplete response head".into()));
        }
        Err(e) => return Err(TunnelError::MalformedResponse(e.to_string())),
    }

    let code = parsed
        .code
        .ok_or_else(|| TunnelError::MalformedResponse("missing status code".into()))?;
    let status = StatusCode::from_u16(code).map_err(|e| TunnelError::MalformedResponse(e.to_string()))?;

    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| TunnelError::MalformedResponse(e.to_string()))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| TunnelError::MalformedResponse(e.to_string()))?;
        headers.append(name, value);
    }

    let body_len = match body_framing(request, status, &headers)? {
        BodyFraming::Empty => 0,
        BodyFraming::Length(len) => discard_exact(stream, len).await?,
        BodyFraming::Chunked => discard_chunked(stream).await?,
        BodyFraming::UntilEof => tokio::io::copy(stream, &mut tokio::io::sink()).await?,
    };

    Ok(ConnectResponse { status, headers, body_len })
}

fn body_framing(
    request: &ConnectRequest,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<BodyFraming, TunnelError> {
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(BodyFraming::Empty);
    }
    // A successful CONNECT turns the connection into the tunnel.
    if status.is_success() && request.method() == ConnectRequest::METHOD {
        return Ok(BodyFraming::Empty);
    }

    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    let mut lengths = headers.get_all(CONTENT_LENGTH).iter();
    let Some(first) = lengths.next() else {
        return Ok(BodyFraming::UntilEof);
    };
    if lengths.any(|other| other != first) {
        return Err(TunnelError::MalformedResponse("conflicting Content-Length headers".into()));
    }
    let len: u64 = first
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| TunnelError::MalformedResponse("invalid Content-Length".into()))?;
    Ok(BodyFraming::Length(len))
}

/// Read the response head up to and including the blank line.
async fn read_head<R>(stream: &mut R) -> Result<Vec<u8>, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
            return Ok(buf);
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(TunnelError::ResponseTooLarge(MAX_HEADER_BYTES));
        }
    }
}

async fn read_line<R>(stream: &mut R) -> Result<String, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_BYTES {
            return Err(TunnelError::ResponseTooLarge(MAX_LINE_BYTES));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Skip exactly `len` bytes.
async fn discard_exact<R>(stream: &mut R, len: u64) -> Result<u64, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *stream).take(len), &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "response body truncated").into());
    }
    Ok(copied)
}

async fn discard_chunked<R>(stream: &mut R) -> Result<u64, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;
    loop {
        let line = read_line(stream).await?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| TunnelError::MalformedResponse(format!("invalid chunk size {:?}", size_str)))?;

        if size == 0 {
            // Trailer section ends with an empty line.
            while !read_line(stream).await?.is_empty() {}
            return Ok(total);
        }

        total += discard_exact(stream, size).await?;
        if !read_line(stream).await?.is_empty() {
            return Err(TunnelError::MalformedResponse("missing CRLF after chunk".into()));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
