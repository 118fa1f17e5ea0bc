//! # servlet-core
//!
//! Servlet-style request processing: synchronous method dispatch with
//! conditional GET and HEAD emulation, plus asynchronous suspension of an
//! exchange with listeners, timeouts and redispatch.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::io::Write;
//! use std::time::Duration;
//! use servlet_core::{Container, Handler, ManualTimer, Method, Request, StatusCode};
//!
//! let handler = Handler::new().get(|ex| {
//!     let ctx = ex.start_async()?;
//!     ctx.set_timeout(5_000)?;
//!     ex.response_mut().output_stream()?.write_all(b"working")?;
//!     Ok(())
//! });
//!
//! let timer = ManualTimer::new();
//! let container = Container::builder(handler).timer(timer.clone()).build().unwrap();
//! let exchange = container.admit(Request::new(Method::Get, "/jobs", "HTTP/1.1"));
//! container.service(&exchange).unwrap();
//! assert!(!exchange.lock().unwrap().is_finished());
//!
//! // nobody completes the exchange, so the timeout ends it with an error page
//! timer.advance(Duration::from_millis(5_000));
//! let ex = exchange.lock().unwrap();
//! assert!(ex.is_finished());
//! assert_eq!(ex.response().status(), StatusCode::InternalServerError);
//! ```

pub mod async_context;
pub mod body;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod exchange;
pub mod http;
pub mod wrapper;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use async_context::{AsyncContext, AsyncEvent, AsyncListener, AsyncState, ManualTimer, TokioTimer};
pub use config::ContainerConfig;
pub use container::{Container, ContainerError};
pub use dispatch::{DispatchEngine, Handler};
pub use error::{AsyncError, ServiceError, StateError};
pub use exchange::{DispatchKind, Exchange, SharedExchange};
pub use http::{Headers, Method, Request, Response, StatusCode};
