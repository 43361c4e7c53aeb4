use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hub::SharedHub;
use crate::payload::{HubValue, Kwargs, Request};
use crate::worker::Worker;
use crate::{Error, Result, TransportError};

/// The dispatch seam of a capability: the side of a process which receives
/// requests from the hub and invokes the local implementation.
pub trait ApiTarget: Send + Sync {
    /// Dispatches a named request to the local implementation.
    ///
    /// Unknown methods fail with [`TransportError::UnknownMethod`].
    fn dispatch(&self, request: Request) -> Result<HubValue>;
}

/// A generic remote handle bound to one process id for its lifetime.
/// Marshals `(method, args, kwargs)` through the hub and re-raises remote
/// failures in the caller's context.
#[derive(Clone)]
pub struct RemoteHandle {
    process_id: String,
    hub: SharedHub,
}

impl RemoteHandle {
    /// Creates a handle bound to the given process id
    pub fn new<S: Into<String>>(process_id: S, hub: SharedHub) -> Self {
        Self {
            process_id: process_id.into(),
            hub,
        }
    }
    /// The process id the handle is bound to
    pub fn process_id(&self) -> &str {
        &self.process_id
    }
    /// Performs the blocking remote call. Remote failures come back with
    /// kind and message preserved plus this call's context breadcrumb.
    pub fn invoke(&self, request: Request) -> Result<HubValue> {
        self.hub
            .call(&self.process_id, request)
            .map_err(|e| e.context(format!("call on {}", self.process_id)))
    }
}

/// How a capability reaches its operations: an in-process target or a
/// remote handle. The binding is fixed at construction; there is no way
/// back from remote mode.
#[derive(Clone)]
pub enum Binding {
    /// Dispatches directly to the in-process target
    Local(Arc<dyn ApiTarget>),
    /// Forwards every operation through the hub
    Remote(RemoteHandle),
}

impl Binding {
    fn call(&self, request: Request) -> Result<HubValue> {
        match self {
            Binding::Local(target) => target.dispatch(request),
            Binding::Remote(handle) => handle.invoke(request),
        }
    }
    fn raw_call(&self, request: Request) -> Result<HubValue> {
        match self {
            Binding::Local(_) => Err(Error::transport(
                TransportError::NotRemote,
                format!("raw call '{}' on a local capability", request.method),
            )),
            Binding::Remote(handle) => handle.invoke(request),
        }
    }
}

/// A registry of dynamically registered methods, dispatched by name when no
/// typed operation matches.
#[derive(Default)]
pub struct RawCalls {
    handlers: Mutex<HashMap<String, RawHandler>>,
}

type RawHandler = Box<dyn Fn(&[HubValue], &Kwargs) -> Result<HubValue> + Send + Sync>;

impl RawCalls {
    /// Registers a handler under the method name
    pub fn register<S, F>(&self, method: S, handler: F)
    where
        S: Into<String>,
        F: Fn(&[HubValue], &Kwargs) -> Result<HubValue> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(method.into(), Box::new(handler));
    }
    /// Removes the handler. Idempotent.
    pub fn unregister(&self, method: &str) {
        self.handlers.lock().remove(method);
    }
    /// True if a handler is registered under the method name
    pub fn is_registered(&self, method: &str) -> bool {
        self.handlers.lock().contains_key(method)
    }
    /// Dispatches the request if a handler matches; fails with
    /// [`TransportError::UnknownMethod`] otherwise
    pub fn dispatch(&self, request: &Request) -> Result<HubValue> {
        let handlers = self.handlers.lock();
        match handlers.get(&request.method) {
            Some(handler) => handler(&request.args, &request.kwargs),
            None => Err(Error::transport(
                TransportError::UnknownMethod,
                format!("no method '{}' on this target", request.method),
            )),
        }
    }
}

fn expect_bool(value: HubValue) -> Result<bool> {
    value
        .as_data()
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| {
            Error::transport(TransportError::MalformedPayload, "expected a boolean reply")
        })
}

/// The capability of a host: every operation either dispatches to the
/// in-process host or forwards through the hub to the host's process.
#[derive(Clone)]
pub struct HostApi {
    process_id: String,
    binding: Binding,
}

impl HostApi {
    /// Creates the local-mode capability of an in-process host
    pub fn local<S: Into<String>>(process_id: S, target: Arc<dyn ApiTarget>) -> Self {
        Self {
            process_id: process_id.into(),
            binding: Binding::Local(target),
        }
    }
    /// Creates the remote-mode capability bound to the host's process id
    pub fn remote<S: Into<String>>(process_id: S, hub: SharedHub) -> Self {
        let process_id = process_id.into();
        Self {
            binding: Binding::Remote(RemoteHandle::new(process_id.clone(), hub)),
            process_id,
        }
    }
    /// The process id this capability is bound to
    pub fn process_id(&self) -> &str {
        &self.process_id
    }
    /// Adds a worker to the host
    pub fn add_worker(&self, worker: Worker) -> Result<()> {
        self.binding
            .call(Request::new("add_worker").arg(worker))
            .map(|_| ())
    }
    /// Adds a worker, opens it and starts it
    pub fn load_worker(&self, worker: Worker) -> Result<()> {
        self.binding
            .call(Request::new("load_worker").arg(worker))
            .map(|_| ())
    }
    /// Removes a worker which is not opened
    pub fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.binding
            .call(Request::new("remove_worker").arg(worker_id))
            .map(|_| ())
    }
    /// Opens a worker
    pub fn open_worker(&self, worker_id: &str) -> Result<()> {
        self.binding
            .call(Request::new("open_worker").arg(worker_id))
            .map(|_| ())
    }
    /// Starts a worker
    pub fn start_worker(&self, worker_id: &str) -> Result<()> {
        self.binding
            .call(Request::new("start_worker").arg(worker_id))
            .map(|_| ())
    }
    /// Stops a worker
    pub fn stop_worker(&self, worker_id: &str) -> Result<()> {
        self.binding
            .call(Request::new("stop_worker").arg(worker_id))
            .map(|_| ())
    }
    /// Closes a worker
    pub fn close_worker(&self, worker_id: &str) -> Result<()> {
        self.binding
            .call(Request::new("close_worker").arg(worker_id))
            .map(|_| ())
    }
    /// Stops, closes and removes a worker, swallowing lifecycle guard
    /// failures
    pub fn kill_worker(&self, worker_id: &str) -> Result<()> {
        self.binding
            .call(Request::new("kill_worker").arg(worker_id))
            .map(|_| ())
    }
    /// True if the host owns a worker with this id
    pub fn is_worker(&self, worker_id: &str) -> Result<bool> {
        self.binding
            .call(Request::new("is_worker").arg(worker_id))
            .and_then(expect_bool)
    }
    /// True if the worker is opened
    pub fn is_worker_opened(&self, worker_id: &str) -> Result<bool> {
        self.binding
            .call(Request::new("is_worker_opened").arg(worker_id))
            .and_then(expect_bool)
    }
    /// True if the worker is running
    pub fn is_worker_running(&self, worker_id: &str) -> Result<bool> {
        self.binding
            .call(Request::new("is_worker_running").arg(worker_id))
            .and_then(expect_bool)
    }
    /// True if the worker is closed
    pub fn is_worker_closed(&self, worker_id: &str) -> Result<bool> {
        self.binding
            .call(Request::new("is_worker_closed").arg(worker_id))
            .and_then(expect_bool)
    }
    /// Invokes a named method on a component of a worker
    pub fn call_worker_component(
        &self,
        worker_id: &str,
        component_id: &str,
        method: &str,
        args: Vec<HubValue>,
        kwargs: Kwargs,
    ) -> Result<HubValue> {
        let mut request = Request::new("call_worker_component")
            .arg(worker_id)
            .arg(component_id)
            .arg(method);
        request.args.extend(args);
        request.kwargs = kwargs;
        self.binding.call(request)
    }
    /// Closes the host: stops and closes every worker, then tears the
    /// process down
    pub fn close(&self) -> Result<()> {
        self.binding.call(Request::new("close")).map(|_| ())
    }
    /// Closes the host, swallowing worker failures
    pub fn kill(&self) -> Result<()> {
        self.binding.call(Request::new("kill")).map(|_| ())
    }
    /// Calls a dynamically registered method on the host. Remote mode only.
    pub fn raw_call(
        &self,
        method: &str,
        args: Vec<HubValue>,
        kwargs: Kwargs,
    ) -> Result<HubValue> {
        let mut request = Request::new(method);
        request.args = args;
        request.kwargs = kwargs;
        self.binding.raw_call(request)
    }
}

/// The capability of the controller process (`"main"`), handed to hosts so
/// components and routines can call controller-level operations
/// symmetrically.
#[derive(Clone)]
pub struct CoreApi {
    binding: Binding,
}

impl CoreApi {
    /// Creates the local-mode capability of the in-process controller
    pub fn local(target: Arc<dyn ApiTarget>) -> Self {
        Self {
            binding: Binding::Local(target),
        }
    }
    /// Creates the remote-mode capability of the controller process
    pub fn remote<S: Into<String>>(process_id: S, hub: SharedHub) -> Self {
        Self {
            binding: Binding::Remote(RemoteHandle::new(process_id, hub)),
        }
    }
    /// Invokes a named method on a controller-owned component
    pub fn call_core_component(
        &self,
        component_id: &str,
        method: &str,
        args: Vec<HubValue>,
        kwargs: Kwargs,
    ) -> Result<HubValue> {
        let mut request = Request::new("call_core_component")
            .arg(component_id)
            .arg(method);
        request.args.extend(args);
        request.kwargs = kwargs;
        self.binding.call(request)
    }
    /// Invokes a named method on a component of a worker anywhere in the
    /// fleet, routed by the controller's residency map
    pub fn call_worker_component(
        &self,
        worker_id: &str,
        component_id: &str,
        method: &str,
        args: Vec<HubValue>,
        kwargs: Kwargs,
    ) -> Result<HubValue> {
        let mut request = Request::new("call_worker_component")
            .arg(worker_id)
            .arg(component_id)
            .arg(method);
        request.args.extend(args);
        request.kwargs = kwargs;
        self.binding.call(request)
    }
    /// Calls a dynamically registered method on the controller. Remote mode
    /// only.
    pub fn raw_call(
        &self,
        method: &str,
        args: Vec<HubValue>,
        kwargs: Kwargs,
    ) -> Result<HubValue> {
        let mut request = Request::new(method);
        request.args = args;
        request.kwargs = kwargs;
        self.binding.raw_call(request)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, LookupError};
    use std::thread;
    use std::time::Duration;

    struct Echo;

    impl ApiTarget for Echo {
        fn dispatch(&self, request: Request) -> Result<HubValue> {
            match request.method.as_str() {
                "is_worker" => Ok(HubValue::from(true)),
                other => Err(Error::transport(
                    TransportError::UnknownMethod,
                    format!("no method '{}' on this target", other),
                )),
            }
        }
    }

    #[test]
    fn test_local_binding_dispatches_in_process() {
        let api = HostApi::local("P1", Arc::new(Echo));
        assert!(api.is_worker("w1").unwrap());
        assert_eq!(
            api.open_worker("w1").unwrap_err().kind(),
            ErrorKind::Transport(TransportError::UnknownMethod)
        );
    }

    #[test]
    fn test_raw_call_requires_remote_mode() {
        let api = HostApi::local("P1", Arc::new(Echo));
        let err = api.raw_call("custom", Vec::new(), Kwargs::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport(TransportError::NotRemote));
    }

    #[test]
    fn test_remote_failure_reraised_with_context() {
        let hub = SharedHub::new();
        let api = HostApi::remote("P1", hub.clone());
        let responder = thread::spawn(move || loop {
            if hub.get_call("P1").is_some() {
                hub.set_response(
                    "P1",
                    Err(Error::lookup(
                        LookupError::UnknownComponent,
                        "no such component",
                    )),
                );
                break;
            }
            thread::sleep(Duration::from_micros(100));
        });
        let err = api
            .call_worker_component("w1", "c1", "m", Vec::new(), Kwargs::new())
            .unwrap_err();
        responder.join().unwrap();
        assert_eq!(
            err.kind(),
            ErrorKind::Lookup(LookupError::UnknownComponent)
        );
        assert_eq!(err.message(), "no such component");
        assert_eq!(err.contexts(), ["call on P1"]);
    }

    #[test]
    fn test_raw_calls_registry() {
        let raw = RawCalls::default();
        raw.register("sum", |args, _| {
            Ok(HubValue::from(
                args.iter().filter_map(HubValue::as_i64).sum::<i64>(),
            ))
        });
        assert!(raw.is_registered("sum"));
        let req = Request::new("sum").arg(1).arg(2).arg(3);
        assert_eq!(raw.dispatch(&req).unwrap().as_i64(), Some(6));
        raw.unregister("sum");
        assert_eq!(
            raw.dispatch(&Request::new("sum")).unwrap_err().kind(),
            ErrorKind::Transport(TransportError::UnknownMethod)
        );
    }
}
