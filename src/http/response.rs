//! The outbound response descriptor.
//!
//! Unlike a one-shot builder, a `Response` is mutated in place by handler
//! operations while an exchange is being dispatched. Once it is committed the
//! status line and headers are frozen; attempts to change them fail fast with
//! [`StateError::Committed`].

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode, date, header};
use crate::body::{BodySink, OutputMode, OutputStream, PrintWriter, Target};
use crate::error::StateError;

/// A mutable HTTP response.
///
/// # Examples
///
/// ```
/// use std::io::Write;
/// use servlet_core::http::{Response, StatusCode};
///
/// let mut response = Response::new();
/// response.set_header("Content-Type", "application/json").unwrap();
/// response.output_stream().unwrap().write_all(br#"{"status":"ok"}"#).unwrap();
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: BytesMut,
    mode: OutputMode,
    // Installed while a HEAD request is emulated through the GET path.
    sink: Option<BodySink>,
    content_length: Option<u64>,
    message: Option<String>,
    committed: bool,
    closed: bool,
}

impl Response {
    /// Creates an uncommitted `200 OK` response with an empty body.
    pub fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Headers::new(),
            body: BytesMut::new(),
            mode: OutputMode::Unused,
            sink: None,
            content_length: None,
            message: None,
            committed: false,
            closed: false,
        }
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the bytes buffered for the transport.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The message passed to the last [`send_error`](Self::send_error), if any.
    pub fn error_message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The Content-Length explicitly set on this response, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), StateError> {
        self.ensure_uncommitted()?;
        self.status = status;
        Ok(())
    }

    /// Replaces any existing values of `name`.
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), StateError> {
        self.ensure_uncommitted()?;
        let name = name.into();
        let value = value.into();
        self.track_length(&name, &value);
        self.headers.set(name, value);
        Ok(())
    }

    /// Appends a value for `name`, keeping existing ones.
    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), StateError> {
        self.ensure_uncommitted()?;
        let name = name.into();
        let value = value.into();
        self.track_length(&name, &value);
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// Sets `name` to the HTTP-date for `millis` since the epoch.
    pub fn set_date_header(&mut self, name: &str, millis: i64) -> Result<(), StateError> {
        self.set_header(name, date::format_millis(millis))
    }

    /// Reads `name` back as epoch milliseconds.
    pub fn date_header(&self, name: &str) -> Option<i64> {
        self.headers.get(name).and_then(date::parse_millis)
    }

    pub fn set_content_length(&mut self, len: u64) -> Result<(), StateError> {
        self.set_header(header::CONTENT_LENGTH, len.to_string())
    }

    pub fn set_content_type(&mut self, content_type: &str) -> Result<(), StateError> {
        self.set_header(header::CONTENT_TYPE, content_type)
    }

    /// Replaces the body with an error message and commits the response.
    ///
    /// Nothing may be written after this; further header changes and output
    /// requests fail with [`StateError::Committed`].
    pub fn send_error(&mut self, status: StatusCode, message: &str) -> Result<(), StateError> {
        self.ensure_uncommitted()?;
        self.status = status;
        self.body.clear();
        // a HEAD response carries no body, not even an error page
        if self.sink.is_none() {
            self.body.put_slice(message.as_bytes());
        }
        self.headers.set(header::CONTENT_TYPE, "text/plain; charset=utf-8");
        self.headers.remove(header::CONTENT_LENGTH);
        self.content_length = None;
        self.message = Some(message.to_owned());
        self.committed = true;
        self.closed = true;
        Ok(())
    }

    /// Commits the status line and headers. Body output remains open.
    pub fn flush_buffer(&mut self) {
        self.committed = true;
    }

    /// Obtains the byte-oriented body output.
    pub fn output_stream(&mut self) -> Result<OutputStream<'_>, StateError> {
        if self.closed {
            return Err(StateError::Committed);
        }
        match &mut self.sink {
            Some(sink) => sink.output_stream(),
            None => {
                self.mode.claim(OutputMode::Stream)?;
                Ok(OutputStream::new(Target::Transport(&mut self.body)))
            }
        }
    }

    /// Obtains the character-oriented body output.
    pub fn writer(&mut self) -> Result<PrintWriter<'_>, StateError> {
        if self.closed {
            return Err(StateError::Committed);
        }
        match &mut self.sink {
            Some(sink) => sink.writer(),
            None => {
                self.mode.claim(OutputMode::Writer)?;
                Ok(PrintWriter::new(Target::Transport(&mut self.body)))
            }
        }
    }

    // Routes body output into a counting sink until `end_head` or
    // `restore_body` removes it.
    pub(crate) fn divert_body(&mut self) {
        self.sink = Some(BodySink::new());
    }

    pub(crate) fn restore_body(&mut self) -> Option<BodySink> {
        self.sink.take()
    }

    pub(crate) fn is_diverted(&self) -> bool {
        self.sink.is_some()
    }

    // Removes the counting sink and, unless a length was set or the headers
    // are already out, advertises the counted length.
    pub(crate) fn end_head(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        if self.content_length.is_none() && !self.committed {
            self.headers.set(header::CONTENT_LENGTH, sink.len().to_string());
            self.content_length = Some(sink.len());
        }
    }

    // Final close once the exchange has fully terminated.
    pub(crate) fn close(&mut self) {
        self.committed = true;
        self.closed = true;
    }

    fn ensure_uncommitted(&self) -> Result<(), StateError> {
        if self.committed {
            Err(StateError::Committed)
        } else {
            Ok(())
        }
    }

    fn track_length(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case(header::CONTENT_LENGTH) {
            self.content_length = value.trim().parse().ok();
        }
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length`, taken from the explicit value when one was set and from
    ///   the buffered body otherwise.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.content_length.unwrap_or(self.body.len() as u64);

        if !self.body.is_empty() && !self.headers.contains(header::CONTENT_TYPE) {
            self.headers
                .insert(header::CONTENT_TYPE, "text/plain; charset=utf-8");
        }
        self.headers.remove(header::CONTENT_LENGTH);

        let estimated_size = 128 + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(&self.body[..]);
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;
    use std::io::Write as _;

    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let mut r = Response::new();
        r.output_stream().unwrap().print("Hello").unwrap();
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn explicit_content_length_wins_over_body() {
        let mut r = Response::new();
        r.set_content_length(37).unwrap();
        let s = to_string(r.into_bytes());
        assert!(s.contains("Content-Length: 37\r\n"));
        assert_eq!(s.matches("Content-Length").count(), 1);
    }

    #[test]
    fn content_length_header_is_tracked() {
        let mut r = Response::new();
        r.add_header("content-length", "12").unwrap();
        assert_eq!(r.content_length(), Some(12));
    }

    #[test]
    fn headers_are_frozen_after_commit() {
        let mut r = Response::new();
        r.flush_buffer();
        assert_eq!(r.set_header("X-Late", "1"), Err(StateError::Committed));
        assert_eq!(r.set_status(StatusCode::NotFound), Err(StateError::Committed));
        // body output is still open after a plain commit
        r.output_stream().unwrap().write_all(b"tail").unwrap();
        assert_eq!(r.body(), b"tail");
    }

    #[test]
    fn send_error_replaces_body_and_closes() {
        let mut r = Response::new();
        r.writer().unwrap().write_str("partial").unwrap();
        r.send_error(StatusCode::MethodNotAllowed, "HTTP method POST is not supported")
            .unwrap();
        assert_eq!(r.status(), StatusCode::MethodNotAllowed);
        assert_eq!(r.body(), b"HTTP method POST is not supported");
        assert!(r.output_stream().is_err());
        assert_eq!(
            r.send_error(StatusCode::BadRequest, "again"),
            Err(StateError::Committed)
        );
    }

    #[test]
    fn stream_and_writer_are_exclusive() {
        let mut r = Response::new();
        r.writer().unwrap();
        assert!(matches!(
            r.output_stream(),
            Err(StateError::OutputMode { .. })
        ));
    }

    #[test]
    fn diverted_body_is_counted_not_buffered() {
        let mut r = Response::new();
        r.divert_body();
        r.output_stream().unwrap().write_all(b"discarded").unwrap();
        let sink = r.restore_body().unwrap();
        assert_eq!(sink.len(), 9);
        assert!(r.body().is_empty());
    }

    #[test]
    fn ending_head_advertises_counted_length_once() {
        let mut r = Response::new();
        r.divert_body();
        assert!(r.is_diverted());
        r.output_stream().unwrap().write_all(b"0123456789").unwrap();
        r.end_head();
        assert!(!r.is_diverted());
        assert_eq!(r.content_length(), Some(10));
        assert_eq!(r.headers().get("content-length"), Some("10"));
        assert!(r.body().is_empty());

        let mut committed = Response::new();
        committed.divert_body();
        committed.output_stream().unwrap().write_all(b"late").unwrap();
        committed.flush_buffer();
        committed.end_head();
        assert_eq!(committed.content_length(), None);
    }

    #[test]
    fn date_header_round_trip() {
        let mut r = Response::new();
        r.set_date_header("Last-Modified", 1_000_000).unwrap();
        assert_eq!(
            r.headers().get("last-modified"),
            Some("Thu, 01 Jan 1970 00:16:40 GMT")
        );
        assert_eq!(r.date_header("Last-Modified"), Some(1_000_000));
    }
}
