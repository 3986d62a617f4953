use bytes::{BufMut, Bytes, BytesMut};
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version,
    header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING, UPGRADE},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::Prebuffered;

/// Upper bound for the number of header lines in one request.
const MAX_HEADERS: usize = 64;

/// Parsed HTTP/1.x request line and header section.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Request target exactly as sent, query string included.
    pub target: String,
    /// Protocol version from the request line.
    pub version: Version,
    /// Header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

/// How the body following a request header section is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body.
    Empty,
    /// `Content-Length` delimited body.
    Fixed(u64),
    /// A transfer coding we do not decode; the connection cannot be reused.
    Unknown,
}

impl HttpRequest {
    /// Reads until one complete header section sits in `reader`'s buffer.
    ///
    /// The header section is left in the buffer; callers consume it (or hand
    /// the whole buffer to the splicer) themselves. Returns the header section
    /// length and the request, or `None` if the peer closed the connection
    /// before sending anything.
    ///
    /// Fails when the header section does not fit into the buffer, the
    /// request is malformed, or the peer closes mid-header.
    pub async fn peek(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Option<(usize, Self)>> {
        loop {
            if !reader.buffer().is_empty() {
                if let Some(request) = Self::parse_with_len(reader.buffer())? {
                    return Ok(Some(request));
                }
            }
            if reader.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "Buffer size limit reached before end of request header section",
                )
                .into());
            }
            if reader.fill().await? == 0 {
                if reader.buffer().is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed inside request header section",
                )
                .into());
            }
        }
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, req)| req))
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                Self::from_request(req).map(|req| Some((header_len, req)))
            }
        }
    }

    fn from_request(req: httparse::Request) -> Result<Self> {
        let method = req.method.context("Missing HTTP method")?;
        let method = Method::from_bytes(method.as_bytes()).std_context("Invalid HTTP method")?;
        let target = req.path.context("Missing request target")?;
        ensure_any!(!target.is_empty(), "Empty request target");
        let version = match req.version.context("Missing HTTP version")? {
            0 => Version::HTTP_10,
            1 => Version::HTTP_11,
            other => return Err(anyerr!("Unsupported HTTP/1.{other}")),
        };
        let headers = HeaderMap::from_iter(req.headers.iter().flat_map(|h| {
            let value = HeaderValue::from_bytes(h.value).ok()?;
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            Some((name, value))
        }));
        Ok(Self {
            method,
            target: target.to_string(),
            version,
            headers,
        })
    }

    /// Returns the `Host` header if it is present, non-empty and free of
    /// control characters.
    pub fn host(&self) -> Option<&str> {
        let host = self.headers.get(http::header::HOST)?.to_str().ok()?;
        let host = host.trim();
        if host.is_empty() || host.chars().any(char::is_control) {
            None
        } else {
            Some(host)
        }
    }

    /// Returns the protocol named by the `Upgrade` header, if any.
    pub fn upgrade(&self) -> Option<&str> {
        self.headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Whether this request asks to switch to the WebSocket protocol.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.upgrade().is_some_and(|proto| {
            proto
                .split(',')
                .any(|p| p.trim().eq_ignore_ascii_case("websocket"))
        })
    }

    /// Whether the client allows the connection to serve another request.
    pub fn keep_alive(&self) -> bool {
        if self.version == Version::HTTP_11 {
            !self.has_connection_token("close")
        } else {
            self.has_connection_token("keep-alive")
        }
    }

    /// Whether `Connection` carries the `upgrade` token.
    pub fn connection_upgrade(&self) -> bool {
        self.has_connection_token("upgrade")
    }

    fn has_connection_token(&self, token: &str) -> bool {
        self.headers.get_all(CONNECTION).iter().any(|value| {
            value.to_str().is_ok_and(|value| {
                value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case(token))
            })
        })
    }

    /// Determines how the request body is delimited.
    pub fn body_length(&self) -> BodyLength {
        if self.headers.contains_key(TRANSFER_ENCODING) {
            return BodyLength::Unknown;
        }
        match self.headers.get(CONTENT_LENGTH) {
            None => BodyLength::Empty,
            Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse().ok()) {
                Some(0) => BodyLength::Empty,
                Some(len) => BodyLength::Fixed(len),
                None => BodyLength::Unknown,
            },
        }
    }
}

/// A small, fully buffered HTTP/1.1 response.
#[derive(derive_more::Debug, Clone)]
pub struct HttpResponse {
    /// Status code for the status line.
    pub status: StatusCode,
    /// Headers, excluding `Content-Length` which is derived from the body.
    pub headers: HeaderMap<HeaderValue>,
    /// Response body.
    #[debug("{} bytes", body.len())]
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Sets the body together with its `Content-Type`.
    pub fn with_body(mut self, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.body = body.into();
        self
    }

    /// Marks the response as the last one on this connection.
    pub fn close(mut self) -> Self {
        self.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
        self
    }

    /// Announces a persistent connection to an HTTP/1.0 client.
    pub fn keep_alive(mut self) -> Self {
        self.headers
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        self
    }

    /// Formats a status line suitable for an HTTP/1.1 response.
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        )
    }

    /// Serializes the response; `HEAD` responses omit the body but keep its length.
    pub fn encode(&self, include_body: bool) -> Bytes {
        let mut out = BytesMut::with_capacity(256 + self.body.len());
        out.put_slice(self.status_line().as_bytes());
        for (key, value) in self.headers.iter() {
            out.put_slice(key.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(format!("content-length: {}\r\n\r\n", self.body.len()).as_bytes());
        if include_body {
            out.put_slice(&self.body);
        }
        out.freeze()
    }

    /// Writes the response, retrying partial writes until done.
    pub async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Unpin),
        include_body: bool,
    ) -> io::Result<()> {
        writer.write_all(&self.encode(include_body)).await?;
        writer.flush().await
    }
}
