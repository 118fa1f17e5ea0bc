//! Error taxonomy shared by the dispatch engine and the async machinery.
//!
//! Protocol-level failures (unsupported or unknown methods) never appear here:
//! they are resolved into status-coded responses by the dispatch engine.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::exchange::DispatchKind;

/// An illegal state transition requested by handler code.
///
/// These are programming errors and are always surfaced synchronously to the
/// caller of the offending operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("asynchronous processing has already been started for this cycle")]
    AlreadyStarted,

    #[error("asynchronous processing has not been started")]
    NotStarted,

    #[error("a dispatch has already been issued for this asynchronous cycle")]
    DispatchAlreadyIssued,

    #[error("the asynchronous cycle is already completing")]
    AlreadyCompleting,

    #[error("the originating dispatch of this cycle has already returned to the container")]
    DispatchReturned,

    #[error("the response has already been committed")]
    Committed,

    #[error("cannot obtain the {requested} output while the {active} output is in use")]
    OutputMode {
        requested: &'static str,
        active: &'static str,
    },

    #[error("asynchronous processing is not supported for this exchange")]
    AsyncNotSupported,

    #[error("the exchange is held by an in-flight dispatch")]
    ExchangeBusy,

    #[error("illegal dispatch kind transition from {from:?} to {to:?}")]
    IllegalDispatchKind { from: DispatchKind, to: DispatchKind },
}

/// A failure raised while a handler operation was executing.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl ServiceError {
    /// Shorthand for a handler-level failure with a message.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

/// The kind of event delivered to async listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StartAsync,
    Complete,
    Timeout,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StartAsync => "onStartAsync",
            Self::Complete => "onComplete",
            Self::Timeout => "onTimeout",
            Self::Error => "onError",
        })
    }
}

/// I/O faults collected from listeners during a single notification pass.
///
/// A faulting listener never stops the pass; every fault is kept in
/// registration order and reported once the pass is over.
#[derive(Debug, Error)]
#[error("{} listener(s) failed during {event}", faults.len())]
pub struct ListenerFaults {
    pub event: EventKind,
    pub faults: Vec<io::Error>,
}

/// Errors returned by [`AsyncContext`](crate::async_context::AsyncContext) operations.
#[derive(Debug, Error)]
pub enum AsyncError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Listeners(#[from] ListenerFaults),
}

impl From<AsyncError> for ServiceError {
    fn from(err: AsyncError) -> Self {
        match err {
            AsyncError::State(e) => Self::State(e),
            AsyncError::Listeners(e) => Self::Io(io::Error::other(e.to_string())),
        }
    }
}
