//! The inbound request descriptor.
//!
//! Requests are either parsed from raw HTTP/1.x bytes with the [`httparse`]
//! crate or assembled programmatically with [`Request::new`].

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method, date};

/// Errors that can occur while parsing an HTTP/1.x request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// An inbound request: method token, target, protocol string, headers and body.
///
/// # Examples
///
/// ```
/// use servlet_core::http::{Method, Request};
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.protocol(), "HTTP/1.1");
/// assert_eq!(request.query_string(), Some("name=world"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    protocol: String,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a request with no headers and an empty body.
    ///
    /// `target` may carry a query string after `?`.
    pub fn new(method: Method, target: &str, protocol: impl Into<String>) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path,
            query,
            protocol: protocol.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a header, builder style.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body, builder style.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw HTTP/1.x request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req.method {
            Some(token) => match token.parse::<Method>() {
                Ok(method) => method,
                Err(never) => match never {},
            },
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let (path, query) = split_target(target);
        let body = Bytes::copy_from_slice(&buf[body_offset..]);

        Ok((
            Self {
                method,
                path,
                query,
                protocol: format!("HTTP/1.{version}"),
                headers: header_map,
                body,
            },
            body_offset,
        ))
    }

    /// Returns the method token.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the protocol string, e.g. `HTTP/1.1`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns a date header as epoch milliseconds.
    ///
    /// `None` when the header is absent or is not a valid HTTP-date.
    pub fn date_header(&self, name: &str) -> Option<i64> {
        self.headers.get(name).and_then(date::parse_millis)
    }

    // Points the request at a new target for an async redispatch.
    pub(crate) fn retarget(&mut self, target: &str) {
        let (path, query) = split_target(target);
        self.path = path;
        self.query = query;
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.protocol(), "HTTP/1.1");
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn parse_http10_protocol() {
        let raw = b"DELETE /item HTTP/1.0\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.protocol(), "HTTP/1.0");
        assert_eq!(req.method(), &Method::Delete);
    }

    #[test]
    fn parse_keeps_custom_method() {
        let raw = b"MKCOL /dav HTTP/1.1\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.method(), &Method::Custom("MKCOL".into()));
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn body_follows_headers() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (req, body_offset) = Request::parse(raw).unwrap();
        assert_eq!(&raw[body_offset..], b"hello");
        assert_eq!(req.body().as_ref(), b"hello");
    }

    #[test]
    fn date_header_parses_http_date() {
        let req = Request::new(Method::Get, "/", "HTTP/1.1")
            .header("If-Modified-Since", "Thu, 01 Jan 1970 00:08:20 GMT");
        assert_eq!(req.date_header("if-modified-since"), Some(500_000));
        assert_eq!(req.date_header("last-modified"), None);
    }

    #[test]
    fn retarget_splits_query() {
        let mut req = Request::new(Method::Get, "/a?x=1", "HTTP/1.1");
        req.retarget("/b?y=2");
        assert_eq!(req.path(), "/b");
        assert_eq!(req.query_string(), Some("y=2"));
        req.retarget("/c");
        assert_eq!(req.query_string(), None);
    }
}
