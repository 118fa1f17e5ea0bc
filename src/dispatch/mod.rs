//! Method dispatch: route an exchange to the handler operation for its method.
//!
//! A [`Handler`] declares which operations it implements by supplying them to
//! its builder; the resulting [`Capabilities`] drive both the default failure
//! for missing operations and the `Allow` header of introspection responses.
//!
//! [`DispatchEngine::dispatch`] applies the protocol-level processing around
//! those operations:
//!
//! | Method    | Behavior                                                           |
//! |-----------|--------------------------------------------------------------------|
//! | `GET`     | conditional GET against the handler's last-modified timestamp      |
//! | `HEAD`    | GET with the body diverted into a counting sink                    |
//! | `POST`/`PUT`/`DELETE` | direct call, or protocol-dependent rejection           |
//! | `OPTIONS` | `Allow` header listing the implemented methods                     |
//! | `TRACE`   | `message/http` echo of the request line and headers                |
//! | other     | protocol-dependent rejection                                       |

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::ServiceError;
use crate::exchange::Exchange;
use crate::http::{Method, Request, StatusCode, date, header};

/// A handler operation bound to one method.
pub type Operation = Arc<dyn Fn(&mut Exchange) -> Result<(), ServiceError> + Send + Sync>;

/// Reports a resource's last modification time in epoch milliseconds; negative means unknown.
pub type LastModified = Arc<dyn Fn(&Request) -> i64 + Send + Sync>;

/// The set of operations a handler implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    bits: u8,
}

impl Capabilities {
    const GET: u8 = 1;
    const HEAD: u8 = 1 << 1;
    const POST: u8 = 1 << 2;
    const PUT: u8 = 1 << 3;
    const DELETE: u8 = 1 << 4;

    fn bit(method: &Method) -> u8 {
        match method {
            Method::Get => Self::GET,
            Method::Head => Self::HEAD,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Delete => Self::DELETE,
            _ => 0,
        }
    }

    fn with(mut self, method: &Method) -> Self {
        self.bits |= Self::bit(method);
        // GET can always be answered as HEAD by emulation.
        if *method == Method::Get {
            self.bits |= Self::HEAD;
        }
        self
    }

    /// `true` if a request with `method` will reach a handler operation or an
    /// engine-provided one (`OPTIONS`, `TRACE`).
    pub fn allows(self, method: &Method) -> bool {
        match method {
            Method::Options | Method::Trace => true,
            other => {
                let bit = Self::bit(other);
                bit != 0 && self.bits & bit != 0
            }
        }
    }

    /// Allowed methods in canonical order.
    pub fn methods(self) -> Vec<Method> {
        [
            Method::Get,
            Method::Head,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Options,
            Method::Trace,
        ]
        .into_iter()
        .filter(|m| self.allows(m))
        .collect()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for method in self.methods() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(method.as_str())?;
            first = false;
        }
        Ok(())
    }
}

/// A handler's explicit capability descriptor.
///
/// # Examples
///
/// ```
/// use std::io::Write;
/// use servlet_core::dispatch::Handler;
/// use servlet_core::http::Method;
///
/// let handler = Handler::new()
///     .get(|ex| {
///         ex.response_mut().output_stream()?.write_all(b"hello")?;
///         Ok(())
///     })
///     .put(|_ex| Ok(()));
///
/// assert_eq!(handler.capabilities().to_string(), "GET, HEAD, PUT, OPTIONS, TRACE");
/// assert!(!handler.capabilities().allows(&Method::Post));
/// ```
#[derive(Clone, Default)]
pub struct Handler {
    get: Option<Operation>,
    head: Option<Operation>,
    post: Option<Operation>,
    put: Option<Operation>,
    delete: Option<Operation>,
    last_modified: Option<LastModified>,
}

impl Handler {
    /// A handler that implements nothing.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get<F>(mut self, op: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.get = Some(Arc::new(op));
        self
    }

    /// Overrides HEAD instead of emulating it through GET.
    #[must_use]
    pub fn head<F>(mut self, op: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.head = Some(Arc::new(op));
        self
    }

    #[must_use]
    pub fn post<F>(mut self, op: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(op));
        self
    }

    #[must_use]
    pub fn put<F>(mut self, op: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.put = Some(Arc::new(op));
        self
    }

    #[must_use]
    pub fn delete<F>(mut self, op: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.delete = Some(Arc::new(op));
        self
    }

    /// Supplies the last-modified query used for conditional GET.
    #[must_use]
    pub fn last_modified<F>(mut self, query: F) -> Self
    where
        F: Fn(&Request) -> i64 + Send + Sync + 'static,
    {
        self.last_modified = Some(Arc::new(query));
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        [
            (&self.get, Method::Get),
            (&self.head, Method::Head),
            (&self.post, Method::Post),
            (&self.put, Method::Put),
            (&self.delete, Method::Delete),
        ]
        .into_iter()
        .filter(|(op, _)| op.is_some())
        .fold(Capabilities::default(), |caps, (_, method)| caps.with(&method))
    }

    fn last_modified_of(&self, request: &Request) -> i64 {
        self.last_modified.as_ref().map_or(-1, |query| query(request))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("capabilities", &self.capabilities().to_string())
            .field("last_modified", &self.last_modified.is_some())
            .finish()
    }
}

/// Stateless method router; one instance can serve any number of exchanges concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchEngine;

impl DispatchEngine {
    pub fn new() -> Self {
        Self
    }

    /// Routes `exchange` to the operation of `handler` that matches its method.
    ///
    /// Unsupported and unknown methods are answered with a status-coded
    /// response, never an error. Errors come only from the handler operation
    /// itself or from illegal response mutations.
    pub fn dispatch(&self, exchange: &mut Exchange, handler: &Handler) -> Result<(), ServiceError> {
        let method = exchange.request().method().clone();
        debug!(
            exchange = exchange.id(),
            method = %method,
            path = %exchange.request().path(),
            kind = ?exchange.dispatch_kind(),
            "dispatching exchange"
        );

        match method {
            Method::Get => self.get(exchange, handler),
            Method::Head => self.head(exchange, handler),
            Method::Post => invoke(exchange, handler.post.as_ref(), &method),
            Method::Put => invoke(exchange, handler.put.as_ref(), &method),
            Method::Delete => invoke(exchange, handler.delete.as_ref(), &method),
            Method::Options => self.options(exchange, handler),
            Method::Trace => self.trace(exchange),
            other => {
                let message = format!("Method {other} is not implemented by this handler");
                reject(exchange, &other, &message)
            }
        }
    }

    fn get(&self, exchange: &mut Exchange, handler: &Handler) -> Result<(), ServiceError> {
        let Some(op) = handler.get.as_ref() else {
            return reject_unsupported(exchange, &Method::Get);
        };

        let last_modified = handler.last_modified_of(exchange.request());
        if last_modified < 0 {
            return op(exchange);
        }

        let since = exchange
            .request()
            .date_header(header::IF_MODIFIED_SINCE)
            .map(date::floor_to_seconds);

        match since {
            Some(since) if since >= last_modified => {
                debug!(
                    exchange = exchange.id(),
                    since, last_modified, "conditional GET short-circuited"
                );
                exchange.response_mut().set_status(StatusCode::NotModified)?;
                Ok(())
            }
            _ => {
                maybe_set_last_modified(exchange, last_modified)?;
                op(exchange)
            }
        }
    }

    fn head(&self, exchange: &mut Exchange, handler: &Handler) -> Result<(), ServiceError> {
        if let Some(op) = handler.head.as_ref() {
            return op(exchange);
        }
        let Some(op) = handler.get.as_ref() else {
            return reject_unsupported(exchange, &Method::Head);
        };

        let last_modified = handler.last_modified_of(exchange.request());
        maybe_set_last_modified(exchange, last_modified)?;

        // An async redispatch of a HEAD request keeps counting into the sink
        // its originating dispatch installed.
        if !exchange.response().is_diverted() {
            exchange.response_mut().divert_body();
        }
        let outcome = op(exchange);
        // A suspended exchange may still write; the length is settled when it finishes.
        if exchange.is_async_started() {
            return outcome;
        }
        let response = exchange.response_mut();
        match outcome {
            Ok(()) => {
                response.end_head();
                Ok(())
            }
            Err(e) => {
                response.restore_body();
                Err(e)
            }
        }
    }

    fn options(&self, exchange: &mut Exchange, handler: &Handler) -> Result<(), ServiceError> {
        let allow = handler.capabilities().to_string();
        exchange.response_mut().add_header(header::ALLOW, allow)?;
        Ok(())
    }

    fn trace(&self, exchange: &mut Exchange) -> Result<(), ServiceError> {
        const CRLF: &str = "\r\n";

        let (request, response) = exchange.split();
        let mut echo = format!(
            "{} {} {}{CRLF}",
            request.method(),
            request.path(),
            request.protocol()
        );
        for (name, value) in request.headers().iter() {
            echo.push_str(name);
            echo.push_str(": ");
            echo.push_str(value);
            echo.push_str(CRLF);
        }

        response.set_content_type("message/http")?;
        response.set_content_length(echo.len() as u64)?;
        response.output_stream()?.print(&echo)?;
        Ok(())
    }
}

fn invoke(
    exchange: &mut Exchange,
    op: Option<&Operation>,
    method: &Method,
) -> Result<(), ServiceError> {
    match op {
        Some(op) => op(exchange),
        None => reject_unsupported(exchange, method),
    }
}

fn reject_unsupported(exchange: &mut Exchange, method: &Method) -> Result<(), ServiceError> {
    let message = format!("HTTP method {method} is not supported by this URL");
    reject(exchange, method, &message)
}

// 405 for HTTP/1.1 clients, 400 for anything older.
fn reject(exchange: &mut Exchange, method: &Method, message: &str) -> Result<(), ServiceError> {
    let status = if exchange.request().protocol().ends_with("1.1") {
        StatusCode::MethodNotAllowed
    } else {
        StatusCode::BadRequest
    };
    debug!(exchange = exchange.id(), method = %method, status = %status, "method rejected");
    exchange.response_mut().send_error(status, message)?;
    Ok(())
}

fn maybe_set_last_modified(exchange: &mut Exchange, last_modified: i64) -> Result<(), ServiceError> {
    let response = exchange.response_mut();
    if last_modified >= 0 && !response.contains_header(header::LAST_MODIFIED) {
        response.set_date_header(header::LAST_MODIFIED, last_modified)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn exchange(method: &str, protocol: &str) -> Exchange {
        let method: Method = method.parse().unwrap();
        Exchange::new(Request::new(method, "/res", protocol))
    }

    fn body_of(ex: &Exchange) -> &str {
        std::str::from_utf8(ex.response().body()).unwrap()
    }

    fn writes_37_bytes() -> Handler {
        Handler::new().get(|ex| {
            ex.response_mut().output_stream()?.write_all(&[b'x'; 37])?;
            Ok(())
        })
    }

    #[test]
    fn post_on_get_only_handler_is_405_on_http11() {
        let mut ex = exchange("POST", "HTTP/1.1");
        DispatchEngine::new()
            .dispatch(&mut ex, &Handler::new().get(|_| Ok(())))
            .unwrap();
        assert_eq!(ex.response().status(), StatusCode::MethodNotAllowed);
        assert!(body_of(&ex).contains("POST"));
        assert!(ex.response().error_message().unwrap().contains("POST"));
    }

    #[test]
    fn missing_operations_are_400_before_http11() {
        for method in ["GET", "POST", "PUT", "DELETE"] {
            let mut ex = exchange(method, "HTTP/1.0");
            DispatchEngine::new().dispatch(&mut ex, &Handler::new()).unwrap();
            assert_eq!(ex.response().status(), StatusCode::BadRequest, "{method}");
            assert!(body_of(&ex).contains(method));
        }
    }

    #[test]
    fn unknown_method_uses_the_same_failure_family() {
        let mut ex = exchange("PATCH", "HTTP/1.1");
        DispatchEngine::new()
            .dispatch(&mut ex, &Handler::new().get(|_| Ok(())))
            .unwrap();
        assert_eq!(ex.response().status(), StatusCode::MethodNotAllowed);
        assert!(body_of(&ex).contains("PATCH"));

        let mut ex = exchange("BREW", "HTTP/1.0");
        DispatchEngine::new().dispatch(&mut ex, &Handler::new()).unwrap();
        assert_eq!(ex.response().status(), StatusCode::BadRequest);
        assert!(body_of(&ex).contains("BREW"));
    }

    #[test]
    fn implemented_operations_are_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = Handler::new().delete(move |ex| {
            seen.fetch_add(1, Ordering::SeqCst);
            ex.response_mut().set_status(StatusCode::NoContent)?;
            Ok(())
        });
        let mut ex = exchange("DELETE", "HTTP/1.1");
        DispatchEngine::new().dispatch(&mut ex, &handler).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ex.response().status(), StatusCode::NoContent);
    }

    #[test]
    fn handler_errors_propagate() {
        let handler = Handler::new().put(|_| Err(ServiceError::handler("disk full")));
        let mut ex = exchange("PUT", "HTTP/1.1");
        let err = DispatchEngine::new().dispatch(&mut ex, &handler).unwrap_err();
        assert!(matches!(err, ServiceError::Handler(msg) if msg == "disk full"));
    }

    fn conditional(last_modified: i64, since: Option<&str>) -> (Exchange, usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = Handler::new()
            .get(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .last_modified(move |_| last_modified);
        let mut request = Request::new(Method::Get, "/res", "HTTP/1.1");
        if let Some(since) = since {
            request = request.header("If-Modified-Since", since);
        }
        let mut ex = Exchange::new(request);
        DispatchEngine::new().dispatch(&mut ex, &handler).unwrap();
        let n = calls.load(Ordering::SeqCst);
        (ex, n)
    }

    #[test]
    fn stale_copy_invokes_get_and_sets_last_modified() {
        // If-Modified-Since = 500,000 ms, resource modified at 1,000,000 ms
        let (ex, calls) = conditional(1_000_000, Some("Thu, 01 Jan 1970 00:08:20 GMT"));
        assert_eq!(calls, 1);
        assert_eq!(ex.response().status(), StatusCode::Ok);
        assert_eq!(ex.response().date_header("Last-Modified"), Some(1_000_000));
    }

    #[test]
    fn fresh_copy_short_circuits_with_304() {
        let (ex, calls) = conditional(1_000_000, Some("Thu, 01 Jan 1970 00:16:40 GMT"));
        assert_eq!(calls, 0);
        assert_eq!(ex.response().status(), StatusCode::NotModified);
        assert!(!ex.response().contains_header("Last-Modified"));
    }

    #[test]
    fn sub_second_modification_still_counts_as_newer() {
        // header rounds to 1,000,000; resource at 1,000,500 is strictly newer
        let (_, calls) = conditional(1_000_500, Some("Thu, 01 Jan 1970 00:16:40 GMT"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn unknown_last_modified_always_invokes_get() {
        let (ex, calls) = conditional(-1, Some("Thu, 01 Jan 2099 00:00:00 GMT"));
        assert_eq!(calls, 1);
        assert!(!ex.response().contains_header("Last-Modified"));
    }

    #[test]
    fn missing_or_bad_header_invokes_get() {
        assert_eq!(conditional(5_000, None).1, 1);
        assert_eq!(conditional(5_000, Some("not a date")).1, 1);
    }

    #[test]
    fn existing_last_modified_is_not_overwritten() {
        let handler = Handler::new()
            .get(|_| Ok(()))
            .last_modified(|_| 2_000_000);
        let mut ex = exchange("GET", "HTTP/1.1");
        ex.response_mut()
            .set_header("Last-Modified", "Thu, 01 Jan 1970 00:00:01 GMT")
            .unwrap();
        DispatchEngine::new().dispatch(&mut ex, &handler).unwrap();
        assert_eq!(ex.response().date_header("Last-Modified"), Some(1_000));
    }

    #[test]
    fn head_reports_length_without_body() {
        let mut ex = exchange("HEAD", "HTTP/1.1");
        DispatchEngine::new()
            .dispatch(&mut ex, &writes_37_bytes())
            .unwrap();
        assert_eq!(ex.response().content_length(), Some(37));
        assert!(ex.response().body().is_empty());
        assert_eq!(ex.response().headers().get("content-length"), Some("37"));
    }

    #[test]
    fn head_counts_writer_output() {
        let handler = Handler::new().get(|ex| {
            write!(ex.response_mut().writer()?, "{}", "ab".repeat(5))
                .map_err(|_| ServiceError::handler("fmt"))?;
            Ok(())
        });
        let mut ex = exchange("HEAD", "HTTP/1.1");
        DispatchEngine::new().dispatch(&mut ex, &handler).unwrap();
        assert_eq!(ex.response().content_length(), Some(10));
    }

    #[test]
    fn head_keeps_explicit_content_length() {
        let handler = Handler::new().get(|ex| {
            let response = ex.response_mut();
            response.set_content_length(1024)?;
            response.output_stream()?.write_all(b"short")?;
            Ok(())
        });
        let mut ex = exchange("HEAD", "HTTP/1.1");
        DispatchEngine::new().dispatch(&mut ex, &handler).unwrap();
        assert_eq!(ex.response().content_length(), Some(1024));
        assert!(ex.response().body().is_empty());
    }

    #[test]
    fn head_override_bypasses_emulation() {
        let handler = Handler::new()
            .get(|_| panic!("GET must not run"))
            .head(|ex| {
                ex.response_mut().set_header("X-Head", "custom")?;
                Ok(())
            });
        let mut ex = exchange("HEAD", "HTTP/1.1");
        DispatchEngine::new().dispatch(&mut ex, &handler).unwrap();
        assert_eq!(ex.response().headers().get("x-head"), Some("custom"));
        assert_eq!(ex.response().content_length(), None);
    }

    #[test]
    fn head_without_get_is_rejected() {
        let mut ex = exchange("HEAD", "HTTP/1.1");
        DispatchEngine::new().dispatch(&mut ex, &Handler::new()).unwrap();
        assert_eq!(ex.response().status(), StatusCode::MethodNotAllowed);
        assert!(ex.response().error_message().unwrap().contains("HEAD"));
    }

    #[test]
    fn mixed_output_forms_fail_fast() {
        let handler = Handler::new().get(|ex| {
            ex.response_mut().output_stream()?;
            ex.response_mut().writer()?;
            Ok(())
        });
        let mut ex = exchange("HEAD", "HTTP/1.1");
        let err = DispatchEngine::new().dispatch(&mut ex, &handler).unwrap_err();
        assert!(matches!(err, ServiceError::State(_)));
    }

    #[test]
    fn options_lists_capabilities_in_canonical_order() {
        let handler = Handler::new().put(|_| Ok(())).get(|_| Ok(()));
        let mut ex = exchange("OPTIONS", "HTTP/1.1");
        DispatchEngine::new().dispatch(&mut ex, &handler).unwrap();
        assert_eq!(
            ex.response().headers().get("allow"),
            Some("GET, HEAD, PUT, OPTIONS, TRACE")
        );
    }

    #[test]
    fn options_on_empty_handler() {
        let mut ex = exchange("OPTIONS", "HTTP/1.1");
        DispatchEngine::new().dispatch(&mut ex, &Handler::new()).unwrap();
        assert_eq!(ex.response().headers().get("allow"), Some("OPTIONS, TRACE"));
    }

    #[test]
    fn trace_echoes_request_line_and_headers() {
        let request = Request::new(Method::Trace, "/echo?x=1", "HTTP/1.1")
            .header("Host", "localhost")
            .header("X-Probe", "42");
        let mut ex = Exchange::new(request);
        DispatchEngine::new().dispatch(&mut ex, &Handler::new()).unwrap();

        let expected = "TRACE /echo HTTP/1.1\r\nHost: localhost\r\nX-Probe: 42\r\n";
        assert_eq!(body_of(&ex), expected);
        assert_eq!(
            ex.response().headers().get("content-type"),
            Some("message/http")
        );
        assert_eq!(ex.response().content_length(), Some(expected.len() as u64));
    }

    #[test]
    fn capabilities_allow() {
        let caps = Handler::new().post(|_| Ok(())).capabilities();
        assert!(caps.allows(&Method::Post));
        assert!(caps.allows(&Method::Options));
        assert!(!caps.allows(&Method::Head));
        assert!(!caps.allows(&Method::Patch));
    }
}
