//! HTTP side of the connection: decoding the upgrade request, building the
//! RFC6455 handshake, and writing plain HTTP responses.
//!
//! Once the 101 response is on the wire the stream is handed to
//! `tokio-tungstenite`, which owns frame encoding and the close handshake
//! (the close acknowledgement is queued by the codec and flushed when the
//! writer closes its sink).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, TRANSFER_ENCODING, UPGRADE,
};
use tokio_tungstenite::tungstenite::http::{HeaderValue, Method, Request, Response, StatusCode, Version};
use tracing::debug;

use crate::error::ConnectionError;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// The only protocol version the frame codec speaks.
pub const SUPPORTED_VERSION: &str = "13";

/// A fully read HTTP request, or the reason it could not be decoded.
#[derive(Debug)]
pub struct HttpRequest {
    head: Request<()>,
    decode_failure: Option<String>,
}

impl HttpRequest {
    fn decoded(head: Request<()>) -> Self {
        Self {
            head,
            decode_failure: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            head: Request::default(),
            decode_failure: Some(reason.into()),
        }
    }

    pub fn is_decoded(&self) -> bool {
        self.decode_failure.is_none()
    }

    pub fn decode_failure(&self) -> Option<&str> {
        self.decode_failure.as_deref()
    }

    pub fn head(&self) -> &Request<()> {
        &self.head
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Carries `Upgrade: websocket`.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header(UPGRADE.as_str())
            .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

enum Parsed {
    Partial,
    Failed(String),
    Complete {
        request: HttpRequest,
        head_len: usize,
        content_length: usize,
    },
}

fn parse_head(buf: &[u8]) -> Parsed {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Parsed::Partial,
        Err(e) => return Parsed::Failed(e.to_string()),
    };

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(req.method.unwrap_or_default())
        .uri(req.path.unwrap_or_default())
        .version(version);
    for header in req.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    let head = match builder.body(()) {
        Ok(head) => head,
        Err(e) => return Parsed::Failed(e.to_string()),
    };

    if head.headers().contains_key(TRANSFER_ENCODING) {
        return Parsed::Failed("chunked request bodies are not supported".to_string());
    }
    let content_length = match head.headers().get(CONTENT_LENGTH) {
        None => 0,
        Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse::<usize>().ok()) {
            Some(n) => n,
            None => return Parsed::Failed("invalid content-length".to_string()),
        },
    };

    Parsed::Complete {
        request: HttpRequest::decoded(head),
        head_len,
        content_length,
    }
}

/// Reads one HTTP request off `reader`, body included.
///
/// Returns `Ok(None)` when the peer goes away before a complete request
/// arrives. Anything unparseable or larger than `max_bytes` comes back as a
/// failed request so the caller can answer it. Bytes read past the end of the
/// request are returned alongside it.
pub async fn read_request<R>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<(HttpRequest, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match parse_head(&buf) {
            Parsed::Partial => {
                if buf.len() >= max_bytes {
                    return Ok(Some((HttpRequest::failed("request head too large"), Vec::new())));
                }
            }
            Parsed::Failed(reason) => {
                debug!("Failed to decode HTTP request: {}", reason);
                return Ok(Some((HttpRequest::failed(reason), Vec::new())));
            }
            Parsed::Complete {
                request,
                head_len,
                content_length,
            } => {
                let total = match head_len.checked_add(content_length) {
                    Some(total) if total <= max_bytes => total,
                    _ => return Ok(Some((HttpRequest::failed("request too large"), Vec::new()))),
                };
                while buf.len() < total {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        return Ok(None);
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let leftover = buf.split_off(total);
                return Ok(Some((request, leftover)));
            }
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Server side of an RFC6455 handshake for one request.
#[derive(Debug, Clone)]
pub struct Handshaker {
    endpoint: String,
    accept_key: HeaderValue,
}

impl Handshaker {
    /// Fails with `UnsupportedHandshakeVersion` when the client asks for
    /// anything but version 13, and `MalformedHandshakeRequest` when the
    /// request cannot be answered at all.
    pub fn new(endpoint: &str, request: &HttpRequest) -> Result<Self, ConnectionError> {
        let version = request.header(SEC_WEBSOCKET_VERSION.as_str()).map(str::trim);
        if version != Some(SUPPORTED_VERSION) {
            return Err(ConnectionError::UnsupportedHandshakeVersion(
                version.unwrap_or("none").to_string(),
            ));
        }

        if request.head().method() != Method::GET {
            return Err(ConnectionError::MalformedHandshakeRequest(format!(
                "upgrade requires GET, got {}",
                request.head().method()
            )));
        }

        let key = request
            .header(SEC_WEBSOCKET_KEY.as_str())
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ConnectionError::MalformedHandshakeRequest("missing Sec-WebSocket-Key".to_string())
            })?;

        let accept_key = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
            .map_err(|e| ConnectionError::MalformedHandshakeRequest(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            accept_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The 101 response completing the upgrade.
    pub fn handshake_response(&self) -> Response<String> {
        let mut response = Response::new(String::new());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, self.accept_key.clone());
        response
    }
}

/// Error response whose body is the status line text, e.g. `400 Bad Request`.
pub fn error_response(status: StatusCode) -> Response<String> {
    let mut response = Response::new(status.to_string());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=UTF-8"),
    );
    response
}

/// 426 advertising the version this server speaks.
pub fn unsupported_version_response() -> Response<String> {
    let mut response = Response::new(String::new());
    *response.status_mut() = StatusCode::UPGRADE_REQUIRED;
    response.headers_mut().insert(
        SEC_WEBSOCKET_VERSION,
        HeaderValue::from_static(SUPPORTED_VERSION),
    );
    response
}

/// Whether the connection has to be closed once `response` is flushed.
pub fn closes_connection(response: &Response<String>) -> bool {
    !matches!(
        response.status(),
        StatusCode::OK | StatusCode::SWITCHING_PROTOCOLS
    )
}

fn encode_response(response: &Response<String>) -> Vec<u8> {
    let status = response.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();

    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if status != StatusCode::SWITCHING_PROTOCOLS && !response.headers().contains_key(CONTENT_LENGTH) {
        out.extend_from_slice(format!("content-length: {}\r\n", response.body().len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(response.body().as_bytes());
    out
}

/// Writes and flushes `response`, shutting the write side down afterwards for
/// anything but 200 and 101. Returns whether the connection was closed.
pub async fn send_http_response<W>(writer: &mut W, response: &Response<String>) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_response(response)).await?;
    writer.flush().await?;

    if closes_connection(response) {
        writer.shutdown().await?;
        return Ok(true);
    }
    Ok(false)
}
