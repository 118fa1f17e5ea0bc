//! Asynchronous execution of a suspended exchange.
//!
//! Suspending an exchange ([`Exchange::start_async`](crate::exchange::Exchange::start_async))
//! yields an [`AsyncContext`]. The context moves through a small state machine:
//!
//! ```text
//!            suspend
//!   Idle ─────────────▶ Started ──┬─ dispatch ──▶ DispatchPending ──▶ Idle (target runs)
//!    ▲                            ├─ complete ──▶ Completing ───────▶ Idle (finished)
//!    │                            ├─ timer ─────▶ TimedOut ─┐
//!    │                            └─ fault ─────▶ Errored ──┴─▶ error dispatch ─▶ complete
//!    └─────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! While the dispatch that suspended the exchange is still running, `dispatch`
//! and `complete` are only recorded; they are replayed exactly once when that
//! dispatch returns. Every transition happens under the context's own lock;
//! listener callbacks and handler code always run with that lock released.

mod listener;
mod timer;

pub use listener::{AsyncEvent, AsyncListener, ListenerRegistry};
pub use timer::{ManualTimer, Task, Timer, TimerHandle, TokioTimer};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::container::Host;
use crate::error::{AsyncError, EventKind, ListenerFaults, ServiceError, StateError};
use crate::exchange::{Exchange, SharedExchange};
use crate::http::StatusCode;
use crate::wrapper::Wrap;
use listener::ListenerSnapshot;

/// Lifecycle state of an async cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncState {
    Idle,
    Started,
    DispatchPending,
    Completing,
    TimedOut,
    Errored,
}

// An action recorded while a dispatch window is open.
enum Deferred {
    Dispatch(Option<String>),
    Complete,
}

enum Step {
    Returned(Result<(), ServiceError>),
    Fault(ServiceError),
    Timeout,
    AfterNotify(StatusCode),
    ErrorDispatch(StatusCode),
    Dispatch(Option<String>),
    Complete,
    Done,
}

impl From<Deferred> for Step {
    fn from(deferred: Deferred) -> Self {
        match deferred {
            Deferred::Dispatch(target) => Step::Dispatch(target),
            Deferred::Complete => Step::Complete,
        }
    }
}

struct Cycle {
    state: AsyncState,
    timeout_ms: i64,
    original: bool,
    request: Option<Arc<dyn Wrap>>,
    response: Option<Arc<dyn Wrap>>,
    // Set while some thread owns the exchange (a dispatch, a notification
    // pass or an error dispatch); cleared when that owner lets go.
    in_dispatch: bool,
    deferred: Option<Deferred>,
    dispatched: bool,
    timeout_pending: bool,
    pending_fault: Option<ServiceError>,
    listeners: ListenerRegistry,
    timer: Option<Box<dyn TimerHandle>>,
    armed: u64,
    exchange: Option<SharedExchange>,
}

impl Cycle {
    fn snapshot(&self) -> ListenerSnapshot {
        self.listeners
            .snapshot(self.request.clone(), self.response.clone())
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.armed += 1;
    }
}

struct Shared {
    host: Arc<Host>,
    this: Weak<Mutex<Exchange>>,
    cycle: Mutex<Cycle>,
}

/// Handle on the async cycles of one exchange.
///
/// Cloning is cheap; every clone drives the same state machine and may be
/// sent to other threads.
#[derive(Clone)]
pub struct AsyncContext {
    shared: Arc<Shared>,
}

impl AsyncContext {
    pub(crate) fn new(host: Arc<Host>, this: Weak<Mutex<Exchange>>) -> Self {
        let timeout_ms = host.config().async_timeout_ms;
        Self {
            shared: Arc::new(Shared {
                host,
                this,
                cycle: Mutex::new(Cycle {
                    state: AsyncState::Idle,
                    timeout_ms,
                    original: true,
                    request: None,
                    response: None,
                    in_dispatch: false,
                    deferred: None,
                    dispatched: false,
                    timeout_pending: false,
                    pending_fault: None,
                    listeners: ListenerRegistry::new(),
                    timer: None,
                    armed: 0,
                    exchange: None,
                }),
            }),
        }
    }

    fn cycle(&self) -> MutexGuard<'_, Cycle> {
        self.shared
            .cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> AsyncState {
        self.cycle().state
    }

    /// `true` from suspension until the cycle returns to `Idle`.
    pub fn is_live(&self) -> bool {
        self.state() != AsyncState::Idle
    }

    /// `true` if the cycle was started with the exchange's undecorated request and response.
    pub fn has_original_request_and_response(&self) -> bool {
        self.cycle().original
    }

    /// The request recorded when the cycle started.
    pub fn request(&self) -> Option<Arc<dyn Wrap>> {
        self.cycle().request.clone()
    }

    /// The response recorded when the cycle started.
    pub fn response(&self) -> Option<Arc<dyn Wrap>> {
        self.cycle().response.clone()
    }

    /// Current timeout in milliseconds; zero or negative means none.
    pub fn timeout(&self) -> i64 {
        self.cycle().timeout_ms
    }

    /// Replaces the timeout of the current cycle and re-arms the timer.
    ///
    /// Only legal while the cycle is `Started` and its dispatch has not yet
    /// returned to the container.
    pub fn set_timeout(&self, timeout_ms: i64) -> Result<(), StateError> {
        let mut cycle = self.cycle();
        if cycle.state == AsyncState::Idle {
            return Err(StateError::NotStarted);
        }
        if cycle.state != AsyncState::Started || !cycle.in_dispatch {
            return Err(StateError::DispatchReturned);
        }
        cycle.timeout_ms = timeout_ms;
        self.arm(&mut cycle);
        debug!(timeout_ms, "async timeout changed");
        Ok(())
    }

    /// Registers `listener` for the rest of the current cycle.
    pub fn add_listener(&self, listener: Arc<dyn AsyncListener>) -> Result<(), StateError> {
        self.register(listener, None, None)
    }

    /// Registers `listener` with the request and response its events should carry.
    pub fn add_listener_with(
        &self,
        listener: Arc<dyn AsyncListener>,
        request: Arc<dyn Wrap>,
        response: Arc<dyn Wrap>,
    ) -> Result<(), StateError> {
        self.register(listener, Some(request), Some(response))
    }

    fn register(
        &self,
        listener: Arc<dyn AsyncListener>,
        request: Option<Arc<dyn Wrap>>,
        response: Option<Arc<dyn Wrap>>,
    ) -> Result<(), StateError> {
        let mut cycle = self.cycle();
        if cycle.state == AsyncState::Idle {
            return Err(StateError::NotStarted);
        }
        if !cycle.in_dispatch {
            return Err(StateError::DispatchReturned);
        }
        cycle.listeners.register(listener, request, response);
        Ok(())
    }

    /// Dispatches the exchange back to the target it was originally addressed to.
    pub fn dispatch(&self) -> Result<(), AsyncError> {
        self.redispatch(None)
    }

    /// Dispatches the exchange to `target` (a path, optionally with a query).
    pub fn dispatch_to(&self, target: &str) -> Result<(), AsyncError> {
        self.redispatch(Some(target.to_owned()))
    }

    fn redispatch(&self, target: Option<String>) -> Result<(), AsyncError> {
        let step = {
            let mut cycle = self.cycle();
            match cycle.state {
                AsyncState::Started | AsyncState::TimedOut | AsyncState::Errored => {}
                AsyncState::DispatchPending => return Err(StateError::DispatchAlreadyIssued.into()),
                AsyncState::Completing => return Err(StateError::AlreadyCompleting.into()),
                AsyncState::Idle if cycle.dispatched => {
                    return Err(StateError::DispatchAlreadyIssued.into());
                }
                AsyncState::Idle => return Err(StateError::NotStarted.into()),
            }
            debug!(path = ?target, deferred = cycle.in_dispatch, "async dispatch requested");
            cycle.state = AsyncState::DispatchPending;
            cycle.dispatched = true;
            cycle.disarm();
            if cycle.in_dispatch {
                cycle.deferred = Some(Deferred::Dispatch(target));
                None
            } else {
                cycle.in_dispatch = true;
                Some(Step::Dispatch(target))
            }
        };
        match step {
            Some(step) => self.drive(step),
            None => Ok(()),
        }
    }

    /// Completes the exchange, notifying `on_complete` listeners in order.
    pub fn complete(&self) -> Result<(), AsyncError> {
        let step = {
            let mut cycle = self.cycle();
            match cycle.state {
                AsyncState::Started
                | AsyncState::DispatchPending
                | AsyncState::TimedOut
                | AsyncState::Errored => {}
                AsyncState::Completing => return Err(StateError::AlreadyCompleting.into()),
                AsyncState::Idle => return Err(StateError::NotStarted.into()),
            }
            debug!(deferred = cycle.in_dispatch, "async complete requested");
            cycle.state = AsyncState::Completing;
            cycle.disarm();
            if cycle.in_dispatch {
                cycle.deferred = Some(Deferred::Complete);
                None
            } else {
                cycle.in_dispatch = true;
                Some(Step::Complete)
            }
        };
        match step {
            Some(step) => self.drive(step),
            None => Ok(()),
        }
    }

    /// Runs `task` on the timer's executor. An `Err` from the task is handled
    /// like a failed dispatch: listeners get `on_error`, then the error
    /// dispatch runs.
    pub fn start<F>(&self, task: F) -> Result<(), StateError>
    where
        F: FnOnce() -> Result<(), ServiceError> + Send + 'static,
    {
        if !self.is_live() {
            return Err(StateError::NotStarted);
        }
        let context = self.clone();
        self.shared.host.timer().execute(Box::new(move || {
            if let Err(err) = task() {
                if let Err(e) = context.fail(err) {
                    warn!(error = %e, "async task failure handling reported faults");
                }
            }
        }));
        Ok(())
    }

    /// Reports a failure of work done on behalf of the suspended exchange.
    ///
    /// Ignored once the cycle is completing or over.
    pub fn fail(&self, err: ServiceError) -> Result<(), AsyncError> {
        let step = {
            let mut cycle = self.cycle();
            if matches!(cycle.state, AsyncState::Idle | AsyncState::Completing) {
                warn!(error = %err, state = ?cycle.state, "fault reported outside a live cycle");
                return Ok(());
            }
            if cycle.in_dispatch {
                if cycle.pending_fault.is_none() {
                    cycle.pending_fault = Some(err);
                }
                None
            } else {
                cycle.in_dispatch = true;
                Some(Step::Fault(err))
            }
        };
        match step {
            Some(step) => self.drive(step),
            None => Ok(()),
        }
    }

    /// Runs `f` against the exchange if no dispatch currently holds it.
    ///
    /// `f` owns the exchange the way a dispatch does: a
    /// [`complete`](Self::complete) or `dispatch` it issues is recorded and
    /// carried out once `f` has returned and the exchange is unlocked. Listener
    /// faults from that work are logged.
    pub fn with_exchange<R>(&self, f: impl FnOnce(&mut Exchange) -> R) -> Result<R, StateError> {
        let exchange = self.shared.this.upgrade().ok_or(StateError::NotStarted)?;
        let mut guard = match exchange.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(StateError::ExchangeBusy),
        };
        let owns_window = {
            let mut cycle = self.cycle();
            let open = cycle.state != AsyncState::Idle && !cycle.in_dispatch;
            if open {
                cycle.in_dispatch = true;
            }
            open
        };

        let value = f(&mut guard);
        drop(guard);

        if owns_window {
            if let Err(e) = self.drive(Step::Returned(Ok(()))) {
                warn!(error = %e, "work issued against the exchange reported faults");
            }
        }
        Ok(value)
    }

    // Starts a new cycle. The caller's dispatch owns the exchange until it
    // reports back through `dispatch_returned`.
    pub(crate) fn suspend(
        &self,
        exchange: SharedExchange,
        request: Arc<dyn Wrap>,
        response: Arc<dyn Wrap>,
        original: bool,
    ) -> Result<(), AsyncError> {
        let previous = {
            let mut cycle = self.cycle();
            if cycle.state != AsyncState::Idle {
                return Err(StateError::AlreadyStarted.into());
            }
            cycle.state = AsyncState::Started;
            cycle.timeout_ms = self.shared.host.config().async_timeout_ms;
            cycle.original = original;
            cycle.request = Some(Arc::clone(&request));
            cycle.response = Some(Arc::clone(&response));
            cycle.in_dispatch = true;
            cycle.deferred = None;
            cycle.dispatched = false;
            cycle.timeout_pending = false;
            cycle.exchange = Some(exchange);
            self.arm(&mut cycle);
            debug!(timeout_ms = cycle.timeout_ms, original, "exchange suspended");
            cycle.listeners.take(Some(request), Some(response))
        };
        previous.notify(EventKind::StartAsync, self, None)?;
        Ok(())
    }

    // The dispatch that owned the exchange has returned.
    pub(crate) fn dispatch_returned(
        &self,
        outcome: Result<(), ServiceError>,
    ) -> Result<(), AsyncError> {
        self.drive(Step::Returned(outcome))
    }

    fn arm(&self, cycle: &mut Cycle) {
        cycle.disarm();
        if cycle.timeout_ms <= 0 {
            return;
        }
        let armed = cycle.armed;
        let context = Arc::downgrade(&self.shared);
        let task: Task = Box::new(move || {
            if let Some(shared) = context.upgrade() {
                AsyncContext { shared }.on_timer(armed);
            }
        });
        let delay = Duration::from_millis(cycle.timeout_ms.unsigned_abs());
        cycle.timer = Some(self.shared.host.timer().schedule(delay, task));
    }

    fn on_timer(&self, armed: u64) {
        let step = {
            let mut cycle = self.cycle();
            if armed != cycle.armed || cycle.state != AsyncState::Started {
                warn!(state = ?cycle.state, "ignoring stale async timeout");
                return;
            }
            cycle.timer = None;
            if cycle.in_dispatch {
                debug!("async timeout deferred until the dispatch returns");
                cycle.timeout_pending = true;
                return;
            }
            cycle.in_dispatch = true;
            Step::Timeout
        };
        if let Err(e) = self.drive(step) {
            warn!(error = %e, "async timeout handling reported faults");
        }
    }

    // Runs the state machine until nothing is left for this thread to do.
    // The first listener fault seen is returned once the run is over.
    fn drive(&self, first: Step) -> Result<(), AsyncError> {
        let mut faults: Option<ListenerFaults> = None;
        let mut record = |outcome: Result<(), ListenerFaults>| {
            if let Err(e) = outcome {
                faults.get_or_insert(e);
            }
        };

        let mut step = first;
        loop {
            step = match step {
                Step::Done => break,
                Step::Returned(outcome) => self.on_returned(outcome),
                Step::Fault(err) => {
                    error!(error = %err, "async execution failed");
                    let snapshot = {
                        let mut cycle = self.cycle();
                        cycle.state = AsyncState::Errored;
                        cycle.disarm();
                        cycle.snapshot()
                    };
                    let fault = Arc::new(err);
                    record(snapshot.notify(EventKind::Error, self, Some(&fault)));
                    Step::AfterNotify(StatusCode::InternalServerError)
                }
                Step::Timeout => {
                    let snapshot = {
                        let mut cycle = self.cycle();
                        cycle.timeout_pending = false;
                        if cycle.state != AsyncState::Started {
                            cycle.in_dispatch = false;
                            break;
                        }
                        cycle.state = AsyncState::TimedOut;
                        cycle.snapshot()
                    };
                    debug!("async cycle timed out");
                    record(snapshot.notify(EventKind::Timeout, self, None));
                    Step::AfterNotify(self.shared.host.config().timeout_error_status())
                }
                Step::AfterNotify(status) => {
                    let mut cycle = self.cycle();
                    if let Some(fault) = cycle.pending_fault.take() {
                        warn!(error = %fault, "fault raised while listeners were handling another");
                    }
                    match cycle.deferred.take() {
                        Some(deferred) => deferred.into(),
                        None => Step::ErrorDispatch(status),
                    }
                }
                Step::ErrorDispatch(status) => {
                    if let Some(exchange) = self.exchange() {
                        self.shared.host.error_dispatch(&exchange, status);
                    }
                    let mut cycle = self.cycle();
                    match cycle.deferred.take() {
                        Some(deferred) => deferred.into(),
                        None => {
                            debug!(status = %status, "forcing completion after error dispatch");
                            Step::Complete
                        }
                    }
                }
                Step::Dispatch(target) => self.run_dispatch(target),
                Step::Complete => {
                    let snapshot = {
                        let mut cycle = self.cycle();
                        cycle.state = AsyncState::Completing;
                        cycle.disarm();
                        cycle.deferred = None;
                        cycle.timeout_pending = false;
                        if let Some(fault) = cycle.pending_fault.take() {
                            warn!(error = %fault, "fault raised while the exchange was completing");
                        }
                        cycle.snapshot()
                    };
                    record(snapshot.notify(EventKind::Complete, self, None));
                    let exchange = {
                        let mut cycle = self.cycle();
                        cycle.state = AsyncState::Idle;
                        cycle.exchange.take()
                    };
                    if let Some(exchange) = exchange {
                        self.shared.host.finish(&exchange);
                    }
                    debug!("async cycle completed");
                    self.cycle().in_dispatch = false;
                    Step::Done
                }
            };
        }

        match faults {
            Some(faults) => Err(faults.into()),
            None => Ok(()),
        }
    }

    fn on_returned(&self, outcome: Result<(), ServiceError>) -> Step {
        let mut cycle = self.cycle();
        let fault = outcome.err().or_else(|| cycle.pending_fault.take());

        if let Some(deferred) = cycle.deferred.take() {
            if let Some(fault) = fault {
                warn!(error = %fault, "dispatch failed after async work was already scheduled");
            }
            return deferred.into();
        }
        if let Some(fault) = fault {
            return Step::Fault(fault);
        }
        if cycle.timeout_pending {
            return Step::Timeout;
        }
        if cycle.state == AsyncState::Idle {
            // an async dispatch returned without suspending again
            return Step::Complete;
        }
        cycle.in_dispatch = false;
        Step::Done
    }

    fn run_dispatch(&self, target: Option<String>) -> Step {
        let exchange = {
            let mut cycle = self.cycle();
            if cycle.state == AsyncState::Completing {
                return Step::Complete;
            }
            cycle.disarm();
            cycle.state = AsyncState::Idle;
            cycle.timeout_pending = false;
            cycle.exchange.clone()
        };
        let Some(exchange) = exchange else {
            self.cycle().in_dispatch = false;
            return Step::Done;
        };

        let host = &self.shared.host;
        let outcome = host
            .prepare_redispatch(&exchange, target.as_deref())
            .and_then(|handler| host.run(&exchange, &handler));
        Step::Returned(outcome)
    }

    fn exchange(&self) -> Option<SharedExchange> {
        self.cycle().exchange.clone()
    }
}

impl std::fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cycle = self.cycle();
        f.debug_struct("AsyncContext")
            .field("state", &cycle.state)
            .field("timeout_ms", &cycle.timeout_ms)
            .field("in_dispatch", &cycle.in_dispatch)
            .field("listeners", &cycle.listeners)
            .finish_non_exhaustive()
    }
}
