//! The container: admits exchanges, runs their originating dispatch and
//! supplies the collaborators async cycles rely on.
//!
//! ```
//! use std::io::Write;
//! use servlet_core::container::Container;
//! use servlet_core::dispatch::Handler;
//! use servlet_core::async_context::ManualTimer;
//! use servlet_core::http::{Method, Request, StatusCode};
//!
//! let handler = Handler::new().get(|ex| {
//!     ex.response_mut().output_stream()?.write_all(b"hi")?;
//!     Ok(())
//! });
//! let container = Container::builder(handler)
//!     .timer(ManualTimer::new())
//!     .build()
//!     .unwrap();
//!
//! let exchange = container.admit(Request::new(Method::Get, "/", "HTTP/1.1"));
//! container.service(&exchange).unwrap();
//!
//! let ex = exchange.lock().unwrap();
//! assert!(ex.is_finished());
//! assert_eq!(ex.response().status(), StatusCode::Ok);
//! assert_eq!(ex.response().body(), b"hi");
//! ```

use std::sync::{Arc, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::async_context::{Timer, TokioTimer};
use crate::config::ContainerConfig;
use crate::dispatch::{DispatchEngine, Handler};
use crate::error::{AsyncError, ServiceError};
use crate::exchange::{AsyncOrigin, DispatchKind, Exchange, SharedExchange};
use crate::http::{Request, StatusCode};

/// Errors produced while assembling a [`Container`].
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("no timer configured and no tokio runtime is running")]
    NoTimer,
}

/// Produces the response for a failed or timed-out async cycle.
pub trait ErrorDispatch: Send + Sync {
    fn dispatch_error(&self, status: StatusCode, exchange: &mut Exchange) -> Result<(), ServiceError>;
}

impl<F> ErrorDispatch for F
where
    F: Fn(StatusCode, &mut Exchange) -> Result<(), ServiceError> + Send + Sync,
{
    fn dispatch_error(&self, status: StatusCode, exchange: &mut Exchange) -> Result<(), ServiceError> {
        self(status, exchange)
    }
}

/// Plain-text error page; leaves committed responses alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorPage;

impl ErrorDispatch for DefaultErrorPage {
    fn dispatch_error(&self, status: StatusCode, exchange: &mut Exchange) -> Result<(), ServiceError> {
        let response = exchange.response_mut();
        if !response.is_committed() {
            response.send_error(status, status.canonical_reason())?;
        }
        Ok(())
    }
}

/// Notified once per exchange, after processing has fully terminated.
pub trait Completion: Send + Sync {
    fn finished(&self, exchange: &mut Exchange);
}

impl<F> Completion for F
where
    F: Fn(&mut Exchange) + Send + Sync,
{
    fn finished(&self, exchange: &mut Exchange) {
        self(exchange)
    }
}

/// Maps an async dispatch target to a handler.
pub trait Resolve: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Arc<Handler>>;
}

impl<F> Resolve for F
where
    F: Fn(&str) -> Option<Arc<Handler>> + Send + Sync,
{
    fn resolve(&self, path: &str) -> Option<Arc<Handler>> {
        self(path)
    }
}

// Everything an exchange needs from its container after admission.
pub(crate) struct Host {
    engine: DispatchEngine,
    handler: Arc<Handler>,
    resolver: Option<Arc<dyn Resolve>>,
    error_dispatch: Arc<dyn ErrorDispatch>,
    timer: Arc<dyn Timer>,
    completion: Option<Arc<dyn Completion>>,
    config: ContainerConfig,
}

impl Host {
    pub(crate) fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub(crate) fn timer(&self) -> &dyn Timer {
        self.timer.as_ref()
    }

    pub(crate) fn run(&self, exchange: &SharedExchange, handler: &Handler) -> Result<(), ServiceError> {
        let mut ex = lock(exchange);
        self.engine.dispatch(&mut ex, handler)
    }

    // Runs the first dispatch of a freshly admitted exchange.
    fn originate(&self, exchange: &SharedExchange) -> Result<(), AsyncError> {
        let (outcome, context) = {
            let mut ex = lock(exchange);
            let outcome = self.engine.dispatch(&mut ex, &self.handler);
            (outcome, ex.async_context().cloned())
        };

        if let Some(context) = context {
            return context.dispatch_returned(outcome);
        }
        if let Err(err) = outcome {
            error!(error = %err, "handler failed");
            self.error_dispatch(exchange, StatusCode::InternalServerError);
        }
        self.finish(exchange);
        Ok(())
    }

    pub(crate) fn prepare_redispatch(
        &self,
        exchange: &SharedExchange,
        target: Option<&str>,
    ) -> Result<Arc<Handler>, ServiceError> {
        let mut ex = lock(exchange);
        if !ex.extensions().contains::<AsyncOrigin>() {
            let origin = AsyncOrigin {
                request_uri: ex.request().path().to_owned(),
                query_string: ex.request().query_string().map(str::to_owned),
            };
            ex.extensions_mut().insert(origin);
        }
        ex.redispatch_as(DispatchKind::Async)?;

        let handler = match target {
            Some(target) => {
                ex.request_mut().retarget(target);
                self.resolve(ex.request().path())
            }
            None => Arc::clone(&self.handler),
        };
        debug!(exchange = ex.id(), path = %ex.request().path(), "async redispatch");
        Ok(handler)
    }

    fn resolve(&self, path: &str) -> Arc<Handler> {
        self.resolver
            .as_ref()
            .and_then(|resolver| resolver.resolve(path))
            .unwrap_or_else(|| Arc::clone(&self.handler))
    }

    pub(crate) fn error_dispatch(&self, exchange: &SharedExchange, status: StatusCode) {
        let mut ex = lock(exchange);
        if let Err(e) = ex.redispatch_as(DispatchKind::Error) {
            warn!(error = %e, "cannot tag error dispatch");
        }
        debug!(exchange = ex.id(), status = %status, "error dispatch");
        if let Err(e) = self.error_dispatch.dispatch_error(status, &mut ex) {
            error!(exchange = ex.id(), error = %e, "error dispatch failed");
        }
    }

    pub(crate) fn finish(&self, exchange: &SharedExchange) {
        let mut ex = lock(exchange);
        if !ex.finish() {
            return;
        }
        debug!(exchange = ex.id(), status = %ex.response().status(), "exchange finished");
        if let Some(completion) = &self.completion {
            completion.finished(&mut ex);
        }
    }
}

fn lock(exchange: &SharedExchange) -> MutexGuard<'_, Exchange> {
    exchange.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admits exchanges and runs them against one root handler.
#[derive(Clone)]
pub struct Container {
    host: Arc<Host>,
}

impl Container {
    pub fn builder(handler: Handler) -> ContainerBuilder {
        ContainerBuilder::new(handler)
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.host.config
    }

    /// Wraps `request` in a new exchange owned by this container.
    pub fn admit(&self, request: Request) -> SharedExchange {
        let host = self
            .host
            .config
            .async_supported
            .then(|| Arc::clone(&self.host));
        Exchange::admit(request, host)
    }

    /// Runs the originating dispatch of `exchange`.
    ///
    /// If the handler did not suspend the exchange, it is finished before this
    /// returns. Otherwise it stays open until its async cycle completes, and a
    /// `complete` or `dispatch` issued during the handler runs here.
    ///
    /// # Errors
    ///
    /// Listener faults raised by work done during this call.
    pub fn service(&self, exchange: &SharedExchange) -> Result<(), AsyncError> {
        self.host.originate(exchange)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("handler", &self.host.handler)
            .field("config", &self.host.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Container`].
#[must_use]
pub struct ContainerBuilder {
    handler: Handler,
    resolver: Option<Arc<dyn Resolve>>,
    error_dispatch: Arc<dyn ErrorDispatch>,
    timer: Option<Arc<dyn Timer>>,
    completion: Option<Arc<dyn Completion>>,
    config: ContainerConfig,
}

impl ContainerBuilder {
    fn new(handler: Handler) -> Self {
        Self {
            handler,
            resolver: None,
            error_dispatch: Arc::new(DefaultErrorPage),
            timer: None,
            completion: None,
            config: ContainerConfig::default(),
        }
    }

    pub fn resolver(mut self, resolver: impl Resolve + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn error_dispatch(mut self, error_dispatch: impl ErrorDispatch + 'static) -> Self {
        self.error_dispatch = Arc::new(error_dispatch);
        self
    }

    /// Timer for async timeouts and `AsyncContext::start`. Defaults to a
    /// [`TokioTimer`] on the current runtime.
    pub fn timer(mut self, timer: impl Timer + 'static) -> Self {
        self.timer = Some(Arc::new(timer));
        self
    }

    pub fn completion(mut self, completion: impl Completion + 'static) -> Self {
        self.completion = Some(Arc::new(completion));
        self
    }

    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Container, ContainerError> {
        let timer: Arc<dyn Timer> = match self.timer {
            Some(timer) => timer,
            None => Arc::new(TokioTimer::try_current().ok_or(ContainerError::NoTimer)?),
        };
        Ok(Container {
            host: Arc::new(Host {
                engine: DispatchEngine::new(),
                handler: Arc::new(self.handler),
                resolver: self.resolver,
                error_dispatch: self.error_dispatch,
                timer,
                completion: self.completion,
                config: self.config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::async_context::ManualTimer;
    use crate::http::Method;

    fn get(path: &str) -> Request {
        Request::new(Method::Get, path, "HTTP/1.1")
    }

    #[test]
    fn build_without_timer_needs_a_runtime() {
        assert!(matches!(
            Container::builder(Handler::new()).build(),
            Err(ContainerError::NoTimer)
        ));
    }

    #[test]
    fn synchronous_exchange_finishes_once() {
        let finished = Arc::new(AtomicUsize::new(0));
        let seen = finished.clone();
        let container = Container::builder(Handler::new().get(|_| Ok(())))
            .timer(ManualTimer::new())
            .completion(move |_: &mut Exchange| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        let exchange = container.admit(get("/"));
        container.service(&exchange).unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(lock(&exchange).is_finished());
        assert!(lock(&exchange).response().is_committed());
    }

    #[test]
    fn synchronous_fault_becomes_500() {
        let container = Container::builder(Handler::new().get(|_| Err(ServiceError::handler("boom"))))
            .timer(ManualTimer::new())
            .build()
            .unwrap();
        let exchange = container.admit(get("/"));
        container.service(&exchange).unwrap();

        let ex = lock(&exchange);
        assert_eq!(ex.response().status(), StatusCode::InternalServerError);
        assert_eq!(ex.dispatch_kind(), DispatchKind::Error);
        assert!(ex.is_finished());
    }

    #[test]
    fn suspended_forward_times_out_into_error_dispatch() {
        let handler = Handler::new().get(|ex| {
            ex.set_dispatch_kind(DispatchKind::Forwarded)?;
            ex.start_async()?.set_timeout(10)?;
            Ok(())
        });
        let timer = ManualTimer::new();
        let container = Container::builder(handler)
            .timer(timer.clone())
            .build()
            .unwrap();
        let exchange = container.admit(get("/"));
        container.service(&exchange).unwrap();
        assert_eq!(lock(&exchange).dispatch_kind(), DispatchKind::Forwarded);

        timer.advance(Duration::from_millis(10));
        let ex = lock(&exchange);
        assert_eq!(ex.dispatch_kind(), DispatchKind::Error);
        assert_eq!(ex.response().status(), StatusCode::InternalServerError);
        assert!(ex.is_finished());
    }

    #[test]
    fn async_can_be_disabled() {
        let config = ContainerConfig {
            async_supported: false,
            ..ContainerConfig::default()
        };
        let handler = Handler::new().get(|ex| {
            ex.start_async()?;
            Ok(())
        });
        let container = Container::builder(handler)
            .timer(ManualTimer::new())
            .config(config)
            .build()
            .unwrap();
        let exchange = container.admit(get("/"));
        container.service(&exchange).unwrap();

        let ex = lock(&exchange);
        assert!(!ex.is_async_supported());
        assert_eq!(ex.response().status(), StatusCode::InternalServerError);
    }

    #[test]
    fn resolver_falls_back_to_root_handler() {
        let other = Arc::new(Handler::new().post(|_| Ok(())));
        let container = Container::builder(Handler::new().get(|_| Ok(())))
            .timer(ManualTimer::new())
            .resolver(move |path: &str| (path == "/other").then(|| Arc::clone(&other)))
            .build()
            .unwrap();
        let host = &container.host;

        assert!(host.resolve("/other").capabilities().allows(&Method::Post));
        assert!(host.resolve("/missing").capabilities().allows(&Method::Get));
    }
}
