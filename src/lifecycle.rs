use serde::{Deserialize, Serialize};

use crate::{Error, Result, StateError};

/// Lifecycle state of a worker or component.
///
/// The only legal trace is `Init, Opened, (Running, Opened)*, Closed`:
/// `Closed` is absorbing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    /// Freshly created, never opened
    #[default]
    Init,
    /// Opened (resources acquired, not executing)
    Opened,
    /// Executing
    Running,
    /// Closed, no further transitions accepted
    Closed,
}

/// Guard-and-set primitives shared by workers and components.
///
/// Guards never mutate the state; the owner sets the new state only after
/// its user hook has returned without failure.
#[derive(Debug, Default, Clone)]
pub struct Lifecycle {
    state: State,
    prefix: String,
}

impl Lifecycle {
    /// Creates a new lifecycle in `Init`, labelled with the owner's display prefix
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            state: State::Init,
            prefix: prefix.into(),
        }
    }
    /// Current state
    pub fn state(&self) -> State {
        self.state
    }
    /// The owner's display prefix used in guard error messages
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
    /// True if the object has been opened and not yet closed
    pub fn is_opened(&self) -> bool {
        matches!(self.state, State::Opened | State::Running)
    }
    /// True if the object is running
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }
    /// True if the object is closed
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }
    fn reject(&self, kind: StateError, op: &str) -> Error {
        Error::state(kind, format!("{}: cannot {}", self.prefix, op))
    }
    /// Guard for `open`: only legal from `Init`
    pub fn guard_open(&self) -> Result<()> {
        match self.state {
            State::Init => Ok(()),
            State::Opened | State::Running => Err(self.reject(StateError::AlreadyOpened, "open")),
            State::Closed => Err(self.reject(StateError::Closed, "open")),
        }
    }
    /// Guard for `start`: only legal from `Opened`
    pub fn guard_start(&self) -> Result<()> {
        match self.state {
            State::Opened => Ok(()),
            State::Init => Err(self.reject(StateError::NotOpened, "start")),
            State::Running => Err(self.reject(StateError::AlreadyRunning, "start")),
            State::Closed => Err(self.reject(StateError::Closed, "start")),
        }
    }
    /// Guard for `stop`: only legal from `Running`
    pub fn guard_stop(&self) -> Result<()> {
        match self.state {
            State::Running => Ok(()),
            State::Init => Err(self.reject(StateError::NotOpened, "stop")),
            State::Opened => Err(self.reject(StateError::NotRunning, "stop")),
            State::Closed => Err(self.reject(StateError::Closed, "stop")),
        }
    }
    /// Guard for `close`: only legal from `Opened`
    pub fn guard_close(&self) -> Result<()> {
        match self.state {
            State::Opened => Ok(()),
            State::Init => Err(self.reject(StateError::NeverOpened, "close")),
            State::Running => Err(self.reject(StateError::StillRunning, "close")),
            State::Closed => Err(self.reject(StateError::Closed, "close")),
        }
    }
    /// Sets the state. Call only after the matching guard passed and the
    /// user hook returned without failure.
    pub fn set(&mut self, state: State) {
        self.state = state;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;

    fn kind(err: Error) -> ErrorKind {
        err.kind()
    }

    #[test]
    fn test_legal_trace() {
        let mut lc = Lifecycle::new("unit");
        assert_eq!(lc.state(), State::Init);
        lc.guard_open().unwrap();
        lc.set(State::Opened);
        lc.guard_start().unwrap();
        lc.set(State::Running);
        lc.guard_stop().unwrap();
        lc.set(State::Opened);
        lc.guard_start().unwrap();
        lc.set(State::Running);
        lc.guard_stop().unwrap();
        lc.set(State::Opened);
        lc.guard_close().unwrap();
        lc.set(State::Closed);
        assert!(lc.is_closed());
    }

    #[test]
    fn test_guard_failures_do_not_mutate() {
        let lc = Lifecycle::new("unit");
        assert_eq!(
            kind(lc.guard_start().unwrap_err()),
            ErrorKind::State(StateError::NotOpened)
        );
        assert_eq!(
            kind(lc.guard_stop().unwrap_err()),
            ErrorKind::State(StateError::NotOpened)
        );
        assert_eq!(
            kind(lc.guard_close().unwrap_err()),
            ErrorKind::State(StateError::NeverOpened)
        );
        assert_eq!(lc.state(), State::Init);
    }

    #[test]
    fn test_closed_is_absorbing() {
        let mut lc = Lifecycle::new("unit");
        lc.set(State::Closed);
        for (err, expected) in [
            (lc.guard_open().unwrap_err(), StateError::Closed),
            (lc.guard_start().unwrap_err(), StateError::Closed),
            (lc.guard_stop().unwrap_err(), StateError::Closed),
            (lc.guard_close().unwrap_err(), StateError::Closed),
        ] {
            assert_eq!(kind(err), ErrorKind::State(expected));
        }
    }

    #[test]
    fn test_running_rejects_close() {
        let mut lc = Lifecycle::new("unit");
        lc.set(State::Running);
        assert_eq!(
            kind(lc.guard_close().unwrap_err()),
            ErrorKind::State(StateError::StillRunning)
        );
        assert_eq!(
            kind(lc.guard_open().unwrap_err()),
            ErrorKind::State(StateError::AlreadyOpened)
        );
        assert_eq!(lc.state(), State::Running);
    }
}
