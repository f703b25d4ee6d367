//! HTTP/1.1 upgrade request heads
//!
//! The transport server reads only the request head. Bytes that arrive after
//! the blank line belong to the WebSocket stream and are kept as lookahead.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue, Uri};

/// Maximum number of headers parsed from a request head
const MAX_HEADERS: usize = 64;

/// Initial read buffer capacity per connection
const INITIAL_BUF_SIZE: usize = 4096;

/// Errors that can occur while reading a request head
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("request head exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("timed out waiting for request head")]
    Timeout,

    #[error("connection closed before request head was complete")]
    ConnectionClosed,

    #[error("invalid header value for {0}")]
    InvalidHeader(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of an incoming HTTP request
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    method: String,
    target: String,
    headers: HeaderMap,
    peer_addr: Option<SocketAddr>,
}

impl UpgradeRequest {
    /// Create request metadata from its parts
    pub fn new(method: impl Into<String>, target: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers,
            peer_addr: None,
        }
    }

    /// Attach the remote address of the connection
    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    /// Parse a request head from the start of `buf`
    ///
    /// Returns the request and the length of the head, or `None` if the head
    /// is not complete yet.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let mut map = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| RequestError::InvalidHeader(header.name.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| RequestError::InvalidHeader(header.name.to_string()))?;
            map.append(name, value);
        }

        let request = Self::new(
            req.method.unwrap_or_default(),
            req.path.unwrap_or_default(),
            map,
        );
        Ok(Some((request, head_len)))
    }

    /// Request method
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw request target as sent by the client
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Request headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Remote address, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Get a header value as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Path component of the request target
    ///
    /// Query and fragment are ignored. A malformed target has no path.
    pub fn path(&self) -> Option<String> {
        let target = self.target.split('#').next().unwrap_or_default();
        if target.is_empty() {
            return None;
        }
        let uri: Uri = target.parse().ok()?;
        match uri.path() {
            "" => None,
            path => Some(path.to_string()),
        }
    }

    /// Whether the client asked for a protocol upgrade
    pub fn is_upgrade(&self) -> bool {
        self.headers.contains_key("upgrade")
            && self
                .header("connection")
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
                .unwrap_or(false)
    }
}

/// Read a request head from `stream`
///
/// Returns the request and whatever bytes followed the head.
pub async fn read_head<S>(
    stream: &mut S,
    max_bytes: usize,
    timeout: Duration,
) -> Result<(UpgradeRequest, Bytes), RequestError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_until_head(stream, max_bytes))
        .await
        .map_err(|_| RequestError::Timeout)?
}

async fn read_until_head<S>(
    stream: &mut S,
    max_bytes: usize,
) -> Result<(UpgradeRequest, Bytes), RequestError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    loop {
        if let Some((request, head_len)) = UpgradeRequest::parse(&buf)? {
            if head_len > max_bytes {
                return Err(RequestError::TooLarge { max_bytes });
            }
            let _ = buf.split_to(head_len);
            return Ok((request, buf.freeze()));
        }
        if buf.len() >= max_bytes {
            return Err(RequestError::TooLarge { max_bytes });
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::ConnectionClosed);
        }
    }
}
