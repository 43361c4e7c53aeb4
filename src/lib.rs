#![ doc = include_str!( concat!( env!( "CARGO_MANIFEST_DIR" ), "/", "README.md" ) ) ]
#![deny(missing_docs)]
use core::fmt;
use std::env;
use std::io::Write;

pub use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Typed remote/local capabilities and the dispatch seam
pub mod api;
/// Lifecycle-governed sub-units owned by workers or by the controller
pub mod component;
/// Runtime configuration and filesystem layout
pub mod config;
/// Per-process hub listener
pub mod connector;
/// Controller facade
pub mod controller;
/// Event catalog and postings
pub mod events;
/// Host runtime containing workers
pub mod host;
/// The shared mailbox store used for cross-process RPC and event buffering
pub mod hub;
/// The four-state lifecycle machine
pub mod lifecycle;
/// Wire model: requests, hub values, keyword arguments
pub mod payload;
/// Named-thread builder and task handles
pub mod task;
/// Workers and their execution context
pub mod worker;

/// The process id reserved for the controller's own process
pub const MAIN_PROCESS_ID: &str = "main";

/// The crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle guard violations
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateError {
    /// `open` called on an already opened object
    #[error("already opened")]
    AlreadyOpened,
    /// the object has never been opened
    #[error("not opened")]
    NotOpened,
    /// `start` called on a running object
    #[error("already running")]
    AlreadyRunning,
    /// `stop` called on an object which is not running
    #[error("not running")]
    NotRunning,
    /// the object is closed and accepts no further transitions
    #[error("closed")]
    Closed,
    /// `close` called on a running object
    #[error("still running")]
    StillRunning,
    /// `close` called on an object which was never opened
    #[error("never opened")]
    NeverOpened,
    /// the object must be closed (or never opened) first
    #[error("not closed")]
    NotClosed,
}

/// The composite lifecycle operation whose user hook failed
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hook {
    /// `on_open`
    #[error("open")]
    Open,
    /// `on_start`
    #[error("start")]
    Start,
    /// `on_stop`
    #[error("stop")]
    Stop,
    /// `on_close`
    #[error("close")]
    Close,
}

/// Unknown or duplicate hosts, workers, components and component methods
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupError {
    /// the process id matches no live host
    #[error("unknown process")]
    UnknownProcess,
    /// a host with this process id already exists
    #[error("process already exists")]
    ProcessAlreadyExists,
    /// the worker id matches no worker
    #[error("unknown worker")]
    UnknownWorker,
    /// a worker with this id is already added
    #[error("worker already added")]
    WorkerAlreadyAdded,
    /// the component id matches no component
    #[error("unknown component")]
    UnknownComponent,
    /// a component with this id is already added
    #[error("component already added")]
    ComponentAlreadyAdded,
    /// the component has no such method
    #[error("unknown component method")]
    UnknownComponentMethod,
}

/// Event subscription failures
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionError {
    /// the declared callback parameters are not a subset of the event's contract
    #[error("bad signature")]
    BadSignature,
    /// the event is not in the catalog
    #[error("unknown event")]
    UnknownEvent,
}

/// Failures of the hub transport itself
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    /// the request names a method the target does not dispatch
    #[error("unknown method")]
    UnknownMethod,
    /// a remote-only operation was invoked on a local capability
    #[error("not remote")]
    NotRemote,
    /// request arguments do not match the expected shape
    #[error("malformed payload")]
    MalformedPayload,
    /// the blocking call expired before a response landed
    #[error("call timed out")]
    CallTimeout,
    /// the process cannot be cleared while one of its calls is in flight
    #[error("call in flight")]
    CallInFlight,
}

/// Controller phase violations and setup failures
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreError {
    /// the controller has not been configured yet
    #[error("not configured")]
    NotConfigured,
    /// the controller is already configured
    #[error("already configured")]
    AlreadyConfigured,
    /// the controller has not been set up yet
    #[error("not setup")]
    NotSetup,
    /// the controller is closed
    #[error("closed")]
    Closed,
    /// the host did not report readiness within the launch timeout
    #[error("process launch failed")]
    ProcessLaunch,
    /// filesystem or configuration setup failed
    #[error("setup failed")]
    Setup,
}

/// The failure kind, used for programmatic pattern matching
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Lifecycle guard violation
    #[error("state error ({0})")]
    State(StateError),
    /// A user hook raised; the original cause is attached
    #[error("{0} hook failed")]
    MethodCall(Hook),
    /// Unknown host, worker, component or component method
    #[error("lookup error ({0})")]
    Lookup(LookupError),
    /// Callback incompatible with the event contract
    #[error("subscription error ({0})")]
    Subscription(SubscriptionError),
    /// Hub transport failure
    #[error("transport error ({0})")]
    Transport(TransportError),
    /// Controller phase violation
    #[error("core error ({0})")]
    Core(CoreError),
    /// Any other failure, message only
    #[error("operation failed")]
    Failed,
}

/// The crate error type: a structured chain `{kind, message, contexts, cause}`
/// rendered on a single line and carried as-is across the hub.
///
/// Each layer a failure crosses may add its own breadcrumb with
/// [`Error::context`]; the original cause stays attached and reachable
/// through [`Error::cause`] / [`std::error::Error::source`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    contexts: Vec<String>,
    cause: Option<Box<Error>>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for ctx in &self.contexts {
            write!(f, " <- {}", ctx)?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, " [caused by: {}]", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|e| &**e as _)
    }
}

impl Error {
    /// Creates a new error with the given kind and message
    pub fn new<S: fmt::Display>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.to_string(),
            contexts: Vec::new(),
            cause: None,
        }
    }
    /// Creates a new lifecycle guard error
    pub fn state<S: fmt::Display>(kind: StateError, message: S) -> Self {
        Self::new(ErrorKind::State(kind), message)
    }
    /// Creates a new hook failure wrapper
    pub fn method_call<S: fmt::Display>(hook: Hook, message: S) -> Self {
        Self::new(ErrorKind::MethodCall(hook), message)
    }
    /// Creates a new lookup error
    pub fn lookup<S: fmt::Display>(kind: LookupError, message: S) -> Self {
        Self::new(ErrorKind::Lookup(kind), message)
    }
    /// Creates a new subscription error
    pub fn subscription<S: fmt::Display>(kind: SubscriptionError, message: S) -> Self {
        Self::new(ErrorKind::Subscription(kind), message)
    }
    /// Creates a new transport error
    pub fn transport<S: fmt::Display>(kind: TransportError, message: S) -> Self {
        Self::new(ErrorKind::Transport(kind), message)
    }
    /// Creates a new controller phase error
    pub fn core<S: fmt::Display>(kind: CoreError, message: S) -> Self {
        Self::new(ErrorKind::Core(kind), message)
    }
    /// Creates a new generic failure
    pub fn failed<S: fmt::Display>(message: S) -> Self {
        Self::new(ErrorKind::Failed, message)
    }
    /// The failure kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    /// The base message
    pub fn message(&self) -> &str {
        &self.message
    }
    /// Breadcrumbs added by the layers the failure crossed, oldest first
    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }
    /// The original cause, if attached
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }
    /// Appends a context breadcrumb and returns the error
    #[must_use]
    pub fn context<S: fmt::Display>(mut self, ctx: S) -> Self {
        self.contexts.push(ctx.to_string());
        self
    }
    /// Attaches the original cause and returns the error
    #[must_use]
    pub fn caused_by(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::core(CoreError::Setup, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::transport(TransportError::MalformedPayload, err)
    }
}

/// Returns true if started in production mode (as a systemd unit)
pub fn is_production() -> bool {
    env::var("INVOCATION_ID").map_or(false, |v| !v.is_empty())
}

/// Configures stdout logger with the given filter. If started in production mode, does not log
/// timestamps
pub fn configure_logger(filter: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stdout);
    builder.filter_level(filter);
    if is_production() {
        builder.format(|buf, record| writeln!(buf, "{} {}", record.level(), record.args()));
    }
    builder.init();
}

/// Prelude module
pub mod prelude {
    pub use crate::api::{CoreApi, HostApi};
    pub use crate::component::{Component, ComponentCell};
    pub use crate::config::Config;
    pub use crate::connector::Connector;
    pub use crate::controller::Controller;
    pub use crate::events::{Event, EventRecord};
    pub use crate::hub::SharedHub;
    pub use crate::lifecycle::State;
    pub use crate::payload::{HubValue, Kwargs, Request};
    pub use crate::worker::{Routine, RunResult, Worker, WorkerContext};
    pub use bma_ts::Monotonic;
    pub use std::time::Duration;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_chain_rendering() {
        let err = Error::lookup(LookupError::UnknownComponent, "no such component")
            .context("call on P1");
        assert_eq!(err.kind(), ErrorKind::Lookup(LookupError::UnknownComponent));
        insta::assert_snapshot!(
            err.to_string(),
            @"lookup error (unknown component): no such component <- call on P1"
        );
    }

    #[test]
    fn test_error_cause_is_preserved() {
        let cause = Error::failed("disk on fire");
        let err =
            Error::method_call(Hook::Open, "worker 'w1': open hook failed").caused_by(cause);
        assert_eq!(err.kind(), ErrorKind::MethodCall(Hook::Open));
        assert_eq!(err.cause().map(Error::message), Some("disk on fire"));
        assert!(err.to_string().contains("caused by"));
    }
}
