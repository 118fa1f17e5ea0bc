//! Async lifecycle listeners and their per-cycle registry.

use std::io;
use std::sync::Arc;

use tracing::warn;

use super::AsyncContext;
use crate::error::{EventKind, ListenerFaults, ServiceError};
use crate::wrapper::Wrap;

/// Observer of one async cycle.
///
/// Every callback defaults to doing nothing. An `Err` from a callback is
/// collected and reported once the whole notification pass has run; it never
/// keeps later listeners from being called.
pub trait AsyncListener: Send + Sync {
    fn on_complete(&self, _event: &AsyncEvent) -> io::Result<()> {
        Ok(())
    }

    fn on_timeout(&self, _event: &AsyncEvent) -> io::Result<()> {
        Ok(())
    }

    fn on_error(&self, _event: &AsyncEvent) -> io::Result<()> {
        Ok(())
    }

    /// Called when the exchange is suspended again. The listener is dropped
    /// from the registry at that point; re-register it with
    /// `event.context().add_listener(event.listener())` to follow the new cycle.
    fn on_start_async(&self, _event: &AsyncEvent) -> io::Result<()> {
        Ok(())
    }
}

/// What a listener receives with each notification.
pub struct AsyncEvent {
    context: AsyncContext,
    listener: Arc<dyn AsyncListener>,
    request: Option<Arc<dyn Wrap>>,
    response: Option<Arc<dyn Wrap>>,
    fault: Option<Arc<ServiceError>>,
}

impl AsyncEvent {
    pub fn context(&self) -> &AsyncContext {
        &self.context
    }

    /// The listener being notified.
    pub fn listener(&self) -> Arc<dyn AsyncListener> {
        Arc::clone(&self.listener)
    }

    /// The request captured at registration, else the one captured at suspension.
    pub fn request(&self) -> Option<&Arc<dyn Wrap>> {
        self.request.as_ref()
    }

    /// The response captured at registration, else the one captured at suspension.
    pub fn response(&self) -> Option<&Arc<dyn Wrap>> {
        self.response.as_ref()
    }

    /// The failure that caused an `on_error` notification.
    pub fn fault(&self) -> Option<&ServiceError> {
        self.fault.as_deref()
    }
}

#[derive(Clone)]
struct ListenerEntry {
    listener: Arc<dyn AsyncListener>,
    request: Option<Arc<dyn Wrap>>,
    response: Option<Arc<dyn Wrap>>,
}

/// Ordered listeners of the current async cycle.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    entries: Vec<ListenerEntry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `listener`; it will be notified after every earlier registration.
    pub fn register(
        &mut self,
        listener: Arc<dyn AsyncListener>,
        request: Option<Arc<dyn Wrap>>,
        response: Option<Arc<dyn Wrap>>,
    ) {
        self.entries.push(ListenerEntry {
            listener,
            request,
            response,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // Copy for an upcoming pass; registrations made during the pass do not join it.
    pub(crate) fn snapshot(
        &self,
        request: Option<Arc<dyn Wrap>>,
        response: Option<Arc<dyn Wrap>>,
    ) -> ListenerSnapshot {
        ListenerSnapshot {
            entries: self.entries.clone(),
            request,
            response,
        }
    }

    // Empties the registry, handing the old entries to one last pass.
    pub(crate) fn take(
        &mut self,
        request: Option<Arc<dyn Wrap>>,
        response: Option<Arc<dyn Wrap>>,
    ) -> ListenerSnapshot {
        ListenerSnapshot {
            entries: std::mem::take(&mut self.entries),
            request,
            response,
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// A frozen, ordered copy of the registry taken for one notification pass.
pub(crate) struct ListenerSnapshot {
    entries: Vec<ListenerEntry>,
    request: Option<Arc<dyn Wrap>>,
    response: Option<Arc<dyn Wrap>>,
}

impl ListenerSnapshot {
    pub(crate) fn notify(
        &self,
        kind: EventKind,
        context: &AsyncContext,
        fault: Option<&Arc<ServiceError>>,
    ) -> Result<(), ListenerFaults> {
        let mut faults = Vec::new();

        for entry in &self.entries {
            let event = AsyncEvent {
                context: context.clone(),
                listener: Arc::clone(&entry.listener),
                request: entry.request.clone().or_else(|| self.request.clone()),
                response: entry.response.clone().or_else(|| self.response.clone()),
                fault: fault.cloned(),
            };
            let outcome = match kind {
                EventKind::StartAsync => entry.listener.on_start_async(&event),
                EventKind::Complete => entry.listener.on_complete(&event),
                EventKind::Timeout => entry.listener.on_timeout(&event),
                EventKind::Error => entry.listener.on_error(&event),
            };
            if let Err(e) = outcome {
                warn!(event = %kind, error = %e, "async listener failed");
                faults.push(e);
            }
        }

        if faults.is_empty() {
            Ok(())
        } else {
            Err(ListenerFaults {
                event: kind,
                faults,
            })
        }
    }
}
