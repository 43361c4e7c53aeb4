use std::sync::Arc;

use crate::lifecycle::{Lifecycle, State};
use crate::payload::{HubValue, Kwargs};
use crate::{Error, Hook, LookupError, Result};

/// A user-defined sub-unit sharing the lifecycle of its owner (a worker or
/// the controller).
///
/// All hooks default to no-ops. Components that expose methods to remote
/// callers implement [`Component::call`], the named-method entry point used
/// by the component-call paths.
pub trait Component: Send + Sync {
    /// Called once when the component is opened
    fn on_open(&self) -> Result<()> {
        Ok(())
    }
    /// Called when the component is started
    fn on_start(&self) -> Result<()> {
        Ok(())
    }
    /// Called when the component is stopped
    fn on_stop(&self) -> Result<()> {
        Ok(())
    }
    /// Called once when the component is closed
    fn on_close(&self) -> Result<()> {
        Ok(())
    }
    /// Dispatches a named method invocation on the component
    fn call(&self, method: &str, args: &[HubValue], kwargs: &Kwargs) -> Result<HubValue> {
        let _ = (args, kwargs);
        Err(Error::lookup(
            LookupError::UnknownComponentMethod,
            format!("no method '{}'", method),
        ))
    }
}

/// Lifecycle wrapper around a user component.
///
/// Guards run before hooks and the state mutates only after the hook has
/// returned without failure; a hook failure surfaces as a `MethodCall`
/// error with the cause attached.
pub struct ComponentCell {
    id: String,
    inner: Arc<dyn Component>,
    lifecycle: Lifecycle,
}

impl ComponentCell {
    /// Wraps a component under the given id
    pub fn new<S: Into<String>, C: Component + 'static>(id: S, component: C) -> Self {
        Self::from_arc(id, Arc::new(component))
    }
    /// Wraps an already shared component under the given id
    pub fn from_arc<S: Into<String>>(id: S, component: Arc<dyn Component>) -> Self {
        let id = id.into();
        let lifecycle = Lifecycle::new(format!("component '{}'", id));
        Self {
            id,
            inner: component,
            lifecycle,
        }
    }
    /// The component id
    pub fn id(&self) -> &str {
        &self.id
    }
    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }
    /// True if opened and not closed
    pub fn is_opened(&self) -> bool {
        self.lifecycle.is_opened()
    }
    /// True if running
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
    /// True if closed
    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
    fn run_hook<F: FnOnce() -> Result<()>>(&self, hook: Hook, f: F) -> Result<()> {
        f().map_err(|e| {
            Error::method_call(
                hook,
                format!("{}: {} hook failed", self.lifecycle.prefix(), hook),
            )
            .caused_by(e)
        })
    }
    /// Opens the component
    pub fn open(&mut self) -> Result<()> {
        self.lifecycle.guard_open()?;
        self.run_hook(Hook::Open, || self.inner.on_open())?;
        self.lifecycle.set(State::Opened);
        Ok(())
    }
    /// Starts the component
    pub fn start(&mut self) -> Result<()> {
        self.lifecycle.guard_start()?;
        self.run_hook(Hook::Start, || self.inner.on_start())?;
        self.lifecycle.set(State::Running);
        Ok(())
    }
    /// Stops the component
    pub fn stop(&mut self) -> Result<()> {
        self.lifecycle.guard_stop()?;
        self.run_hook(Hook::Stop, || self.inner.on_stop())?;
        self.lifecycle.set(State::Opened);
        Ok(())
    }
    /// Closes the component
    pub fn close(&mut self) -> Result<()> {
        self.lifecycle.guard_close()?;
        self.run_hook(Hook::Close, || self.inner.on_close())?;
        self.lifecycle.set(State::Closed);
        Ok(())
    }
    /// Invokes a named method on the inner component
    pub fn call(&self, method: &str, args: &[HubValue], kwargs: &Kwargs) -> Result<HubValue> {
        self.inner.call(method, args, kwargs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, StateError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        opened: AtomicUsize,
        fail_open: bool,
    }

    impl Component for Counter {
        fn on_open(&self) -> Result<()> {
            if self.fail_open {
                return Err(Error::failed("refusing to open"));
            }
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn call(&self, method: &str, args: &[HubValue], _kwargs: &Kwargs) -> Result<HubValue> {
            match method {
                "opened" => Ok(HubValue::from(self.opened.load(Ordering::Relaxed) as i64)),
                "add" => {
                    let a = args[0].as_i64().unwrap_or(0);
                    let b = args[1].as_i64().unwrap_or(0);
                    Ok(HubValue::from(a + b))
                }
                other => Err(Error::lookup(
                    LookupError::UnknownComponentMethod,
                    format!("no method '{}'", other),
                )),
            }
        }
    }

    #[test]
    fn test_full_lifecycle_and_call() {
        let mut cell = ComponentCell::new("c1", Counter::default());
        cell.open().unwrap();
        cell.start().unwrap();
        assert!(cell.is_running());
        cell.stop().unwrap();
        cell.close().unwrap();
        assert!(cell.is_closed());
        let sum = cell
            .call("add", &[HubValue::from(2), HubValue::from(3)], &Kwargs::new())
            .unwrap();
        assert_eq!(sum.as_i64(), Some(5));
    }

    #[test]
    fn test_hook_failure_wrapped_and_state_kept() {
        let mut cell = ComponentCell::new(
            "c1",
            Counter {
                fail_open: true,
                ..Default::default()
            },
        );
        let err = cell.open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodCall(Hook::Open));
        assert_eq!(err.cause().map(|c| c.message()), Some("refusing to open"));
        assert_eq!(cell.state(), State::Init);
    }

    #[test]
    fn test_guard_rejection_without_hook() {
        let mut cell = ComponentCell::new("c1", Counter::default());
        let err = cell.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State(StateError::NotOpened));
        assert_eq!(cell.state(), State::Init);
        let inner = cell.call("opened", &[], &Kwargs::new()).unwrap();
        assert_eq!(inner.as_i64(), Some(0));
    }
}
