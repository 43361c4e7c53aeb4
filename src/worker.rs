use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use crate::api::CoreApi;
use crate::component::{Component, ComponentCell};
use crate::events::{Event, EventRecord};
use crate::hub::SharedHub;
use crate::lifecycle::{Lifecycle, State};
use crate::payload::{HubValue, Kwargs};
use crate::task::{Builder, Task};
use crate::{Error, Hook, LookupError, Result, MAIN_PROCESS_ID};

/// Result type, which must be returned by routines' `run` method
pub type RunResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The default bound on waiting for a worker thread to observe the stop flag
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep step of the default idle `run` body
const IDLE_STEP: Duration = Duration::from_millis(100);

/// Long-running user logic hosted by a worker.
///
/// All hooks default to no-ops; the default `run` body idles until the stop
/// flag is raised. The body MUST observe [`WorkerContext::should_stop`]
/// periodically, otherwise `stop` detaches the thread after its bounded
/// wait.
pub trait Routine: Send + Sync {
    /// Called once when the worker is opened
    fn on_open(&self) -> Result<()> {
        Ok(())
    }
    /// Called when the worker is started, before its thread spawns
    fn on_start(&self) -> Result<()> {
        Ok(())
    }
    /// Called when the worker is stopped, before its thread is joined
    fn on_stop(&self) -> Result<()> {
        Ok(())
    }
    /// Called once when the worker is closed
    fn on_close(&self) -> Result<()> {
        Ok(())
    }
    /// The worker body, started on a dedicated thread by `start`
    fn run(&self, ctx: &WorkerContext) -> RunResult {
        while !ctx.should_stop() {
            thread::sleep(IDLE_STEP);
        }
        Ok(())
    }
}

/// The context handed to a routine's `run` body: stop observation, event
/// triggering and the capability of the controller process.
pub struct WorkerContext {
    worker_id: String,
    process_id: String,
    stop: Arc<AtomicBool>,
    hub: Option<SharedHub>,
}

impl WorkerContext {
    /// True once `stop` has been requested; the body should return soon
    /// after
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
    /// The id of the worker this context belongs to
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
    /// The process id of the owning host (empty if the worker is not
    /// hosted)
    pub fn process_id(&self) -> &str {
        &self.process_id
    }
    /// Publishes an event on the bus. A no-op for unhosted workers.
    pub fn trigger(&self, event: Event, record: EventRecord) {
        if let Some(ref hub) = self.hub {
            hub.trigger(event, record);
        }
    }
    /// The remote capability of the controller process, for symmetric
    /// calls back into the core. `None` for unhosted workers.
    pub fn core(&self) -> Option<CoreApi> {
        self.hub
            .as_ref()
            .map(|hub| CoreApi::remote(MAIN_PROCESS_ID, hub.clone()))
    }
}

/// A lifecycle-governed user object owned by a host and running its own
/// thread while `Running`.
///
/// Workers own components and propagate every lifecycle transition to them:
/// components open/start before the worker's own hook and stop/close after
/// it.
pub struct Worker {
    id: String,
    routine: Arc<dyn Routine>,
    components: BTreeMap<String, ComponentCell>,
    lifecycle: Lifecycle,
    stop: Arc<AtomicBool>,
    task: Option<Task<()>>,
    stop_timeout: Duration,
    process_id: Option<String>,
    hub: Option<SharedHub>,
}

impl Worker {
    /// Creates a new worker with a unique id and its routine
    pub fn new<S: Into<String>, R: Routine + 'static>(id: S, routine: R) -> Self {
        let id = id.into();
        let lifecycle = Lifecycle::new(format!("worker '{}'", id));
        Self {
            id,
            routine: Arc::new(routine),
            components: BTreeMap::new(),
            lifecycle,
            stop: Arc::new(AtomicBool::new(false)),
            task: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            process_id: None,
            hub: None,
        }
    }
    /// Overrides the bound on waiting for the worker thread during `stop`,
    /// can be used as a build pattern
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
    /// The worker id
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
    /// Binds the worker to its owning host. Called when the worker is added.
    pub(crate) fn attach(&mut self, process_id: &str, hub: SharedHub) {
        self.process_id = Some(process_id.to_owned());
        self.hub = Some(hub);
    }
    /// Adds a component; the component must not be ahead of the worker's
    /// lifecycle, so components are added before `open`
    pub fn add_component<S: Into<String>, C: Component + 'static>(
        &mut self,
        id: S,
        component: C,
    ) -> Result<()> {
        let id = id.into();
        if self.components.contains_key(&id) {
            return Err(Error::lookup(
                LookupError::ComponentAlreadyAdded,
                format!("worker '{}': component '{}' is already added", self.id, id),
            ));
        }
        self.components.insert(id.clone(), ComponentCell::new(id, component));
        Ok(())
    }
    /// Removes a component. Idempotent.
    pub fn remove_component(&mut self, id: &str) {
        self.components.remove(id);
    }
    /// Borrows a component by id
    pub fn component(&self, id: &str) -> Option<&ComponentCell> {
        self.components.get(id)
    }
    /// Invokes a named method on a component of this worker
    pub fn call_component(
        &self,
        component_id: &str,
        method: &str,
        args: &[HubValue],
        kwargs: &Kwargs,
    ) -> Result<HubValue> {
        let cell = self.components.get(component_id).ok_or_else(|| {
            Error::lookup(
                LookupError::UnknownComponent,
                format!("worker '{}': unknown component '{}'", self.id, component_id),
            )
        })?;
        cell.call(method, args, kwargs)
    }
    fn wrap(&self, hook: Hook, err: Error) -> Error {
        Error::method_call(
            hook,
            format!("{}: {} hook failed", self.lifecycle.prefix(), hook),
        )
        .caused_by(err)
    }
    /// Opens the worker: components first, then the routine's `on_open`
    pub fn open(&mut self) -> Result<()> {
        self.lifecycle.guard_open()?;
        let routine = self.routine.clone();
        let result = (|| {
            for cell in self.components.values_mut() {
                cell.open()?;
            }
            routine.on_open()
        })();
        result.map_err(|e| self.wrap(Hook::Open, e))?;
        self.lifecycle.set(State::Opened);
        Ok(())
    }
    /// Starts the worker: components, then `on_start`, then the worker
    /// thread
    pub fn start(&mut self) -> Result<()> {
        self.lifecycle.guard_start()?;
        let routine = self.routine.clone();
        let result = (|| {
            for cell in self.components.values_mut() {
                cell.start()?;
            }
            routine.on_start()
        })();
        result.map_err(|e| self.wrap(Hook::Start, e))?;
        self.stop.store(false, Ordering::Relaxed);
        let ctx = WorkerContext {
            worker_id: self.id.clone(),
            process_id: self.process_id.clone().unwrap_or_default(),
            stop: self.stop.clone(),
            hub: self.hub.clone(),
        };
        let routine = self.routine.clone();
        let worker_id = self.id.clone();
        let task = Builder::new().name(&self.id).spawn(move || {
            if let Err(e) = routine.run(&ctx) {
                error!(worker = %worker_id, error = %e, "worker body terminated with an error");
            }
        })?;
        self.task = Some(task);
        self.lifecycle.set(State::Running);
        Ok(())
    }
    /// Stops the worker: `on_stop`, then components, then the thread is
    /// signalled and joined within the stop timeout
    pub fn stop(&mut self) -> Result<()> {
        self.lifecycle.guard_stop()?;
        let routine = self.routine.clone();
        let result = (|| {
            routine.on_stop()?;
            for cell in self.components.values_mut() {
                cell.stop()?;
            }
            Ok(())
        })();
        result.map_err(|e| self.wrap(Hook::Stop, e))?;
        self.stop_thread();
        self.lifecycle.set(State::Opened);
        Ok(())
    }
    /// Closes the worker: `on_close`, then components
    pub fn close(&mut self) -> Result<()> {
        self.lifecycle.guard_close()?;
        let routine = self.routine.clone();
        let result = (|| {
            routine.on_close()?;
            for cell in self.components.values_mut() {
                cell.close()?;
            }
            Ok(())
        })();
        result.map_err(|e| self.wrap(Hook::Close, e))?;
        self.lifecycle.set(State::Closed);
        Ok(())
    }
    /// Raises the stop flag and reaps the worker thread even when lifecycle
    /// hooks are failing. Used by the kill path.
    pub(crate) fn force_stop_thread(&mut self) {
        self.stop_thread();
    }
    /// Best-effort shutdown: stop if running, close if opened. Hook
    /// failures are logged and the transition forced so the next step still
    /// runs; the worker ends up closed (or untouched in `Init`).
    pub(crate) fn kill(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                error!(worker = %self.id, error = %e, "stop failed during kill");
                self.force_stop_thread();
                self.lifecycle.set(State::Opened);
            }
        }
        if self.lifecycle.state() == State::Opened {
            if let Err(e) = self.close() {
                error!(worker = %self.id, error = %e, "close failed during kill");
                self.lifecycle.set(State::Closed);
            }
        }
    }
    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let Some(task) = self.task.take() else {
            return;
        };
        match task.join_within(self.stop_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!(worker = %self.id, "worker thread panicked"),
            Err(task) => {
                warn!(
                    worker = %self.id,
                    timeout = ?self.stop_timeout,
                    "worker thread did not observe the stop flag, detaching"
                );
                drop(task);
            }
        }
    }
}
