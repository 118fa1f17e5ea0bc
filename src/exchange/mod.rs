//! The exchange: one request/response unit flowing through the engine.
//!
//! Besides the request and response, an exchange carries its dispatch-kind
//! tag, a type-keyed attribute map, identity tokens for its undecorated
//! request and response, and (once suspended) its [`AsyncContext`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::async_context::AsyncContext;
use crate::container::Host;
use crate::error::{AsyncError, StateError};
use crate::http::{Request, Response};
use crate::wrapper::{self, Origin, Role, Wrap};

/// An exchange shared between the dispatching thread and async collaborators.
pub type SharedExchange = Arc<Mutex<Exchange>>;

/// Processing lineage of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    Original,
    Forwarded,
    Included,
    Async,
    Error,
}

impl DispatchKind {
    /// Validates a redispatch from `self` to `to`.
    ///
    /// Redispatches start only from an original or async dispatch, and
    /// nothing returns to `Original`.
    pub fn transition(self, to: DispatchKind) -> Result<DispatchKind, StateError> {
        let legal = matches!(self, Self::Original | Self::Async) && to != Self::Original;
        if legal {
            Ok(to)
        } else {
            Err(StateError::IllegalDispatchKind { from: self, to })
        }
    }
}

/// The target an exchange was addressed to before its first async redispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncOrigin {
    pub request_uri: String,
    pub query_string: Option<String>,
}

/// Type-erased attribute map. Handlers and collaborators stash per-exchange
/// state here without knowing about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }
}

// What a container grants an exchange so it can be suspended.
pub(crate) struct AsyncSupport {
    pub(crate) host: Arc<Host>,
    pub(crate) this: Weak<Mutex<Exchange>>,
}

/// One request/response processing unit.
pub struct Exchange {
    id: u64,
    request: Request,
    response: Response,
    kind: DispatchKind,
    extensions: Extensions,
    origin_request: Arc<dyn Wrap>,
    origin_response: Arc<dyn Wrap>,
    support: Option<AsyncSupport>,
    async_context: Option<AsyncContext>,
    finished: bool,
}

impl Exchange {
    /// A stand-alone exchange with a fresh `200 OK` response.
    ///
    /// Exchanges built this way cannot be suspended; exchanges admitted by a
    /// [`Container`](crate::container::Container) can.
    pub fn new(request: Request) -> Self {
        let id = wrapper::next_exchange_id();
        Self {
            id,
            request,
            response: Response::new(),
            kind: DispatchKind::Original,
            extensions: Extensions::new(),
            origin_request: Origin::new(Role::Request, id),
            origin_response: Origin::new(Role::Response, id),
            support: None,
            async_context: None,
            finished: false,
        }
    }

    pub(crate) fn admit(request: Request, host: Option<Arc<Host>>) -> SharedExchange {
        Arc::new_cyclic(|this| {
            let mut exchange = Exchange::new(request);
            exchange.support = host.map(|host| AsyncSupport {
                host,
                this: this.clone(),
            });
            Mutex::new(exchange)
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Borrows the request and the response at the same time.
    pub fn split(&mut self) -> (&Request, &mut Response) {
        (&self.request, &mut self.response)
    }

    pub fn dispatch_kind(&self) -> DispatchKind {
        self.kind
    }

    /// Redispatches the exchange under a new kind, e.g. for a forward.
    pub fn set_dispatch_kind(&mut self, kind: DispatchKind) -> Result<(), StateError> {
        self.kind = self.kind.transition(kind)?;
        Ok(())
    }

    // Async and error redispatches issued by the container for a suspended
    // exchange. The async cycle owns the lineage from then on, so a forward
    // that suspended may still time out into an error dispatch.
    pub(crate) fn redispatch_as(&mut self, kind: DispatchKind) -> Result<(), StateError> {
        match kind {
            DispatchKind::Async | DispatchKind::Error if self.async_context.is_some() => {
                self.kind = kind;
                Ok(())
            }
            _ => self.set_dispatch_kind(kind),
        }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Identity token of the undecorated request.
    pub fn request_handle(&self) -> Arc<dyn Wrap> {
        Arc::clone(&self.origin_request)
    }

    /// Identity token of the undecorated response.
    pub fn response_handle(&self) -> Arc<dyn Wrap> {
        Arc::clone(&self.origin_response)
    }

    pub fn is_async_supported(&self) -> bool {
        self.support.is_some()
    }

    /// `true` while an async cycle is live for this exchange.
    pub fn is_async_started(&self) -> bool {
        self.async_context
            .as_ref()
            .is_some_and(AsyncContext::is_live)
    }

    /// The async context, once the exchange has been suspended at least once.
    pub fn async_context(&self) -> Option<&AsyncContext> {
        self.async_context.as_ref()
    }

    /// Suspends the exchange with its undecorated request and response.
    pub fn start_async(&mut self) -> Result<AsyncContext, AsyncError> {
        let request = self.request_handle();
        let response = self.response_handle();
        self.start_async_with(request, response)
    }

    /// Suspends the exchange, recording the (possibly decorated) request and
    /// response that listeners will observe by default.
    pub fn start_async_with(
        &mut self,
        request: Arc<dyn Wrap>,
        response: Arc<dyn Wrap>,
    ) -> Result<AsyncContext, AsyncError> {
        if self.finished {
            return Err(StateError::Committed.into());
        }
        let support = self.support.as_ref().ok_or(StateError::AsyncNotSupported)?;
        let shared = support.this.upgrade().ok_or(StateError::AsyncNotSupported)?;
        let original = wrapper::same_layer(&request, &self.origin_request)
            && wrapper::same_layer(&response, &self.origin_response);

        let context = match &self.async_context {
            Some(context) => context.clone(),
            None => {
                let context = AsyncContext::new(Arc::clone(&support.host), Arc::downgrade(&shared));
                self.async_context = Some(context.clone());
                context
            }
        };
        context.suspend(shared, request, response, original)?;
        Ok(context)
    }

    // Marks the exchange done; `false` if it already was.
    pub(crate) fn finish(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.response.end_head();
        self.response.close();
        // Breaks the exchange <-> context reference cycle.
        self.async_context = None;
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("kind", &self.kind)
            .field("status", &self.response.status())
            .finish_non_exhaustive()
    }
}
