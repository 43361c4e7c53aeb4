use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
#[cfg(unix)]
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::{error, info, warn};

use crate::api::{ApiTarget, CoreApi, HostApi, RawCalls};
use crate::component::{Component, ComponentCell};
use crate::config::{Config, Layout};
use crate::connector::{Connector, SubscriptionId};
use crate::events::{Event, EventRecord};
use crate::host::Host;
use crate::hub::SharedHub;
use crate::payload::{HubValue, Kwargs, Request};
use crate::task::Builder;
use crate::worker::Worker;
use crate::{CoreError, Error, LookupError, Result, MAIN_PROCESS_ID};

/// The default bound on waiting for a host to report readiness
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on waiting for a closed host's hub entry to clear
const CLOSE_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep step used while waiting for a closed host to leave the hub
const CLOSE_POLL_STEP: Duration = Duration::from_millis(1);

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Configured,
    Setup,
    Closed,
}

#[derive(Clone)]
struct HostRecord {
    process_id: String,
    api: HostApi,
}

struct SerialLocks {
    hosts: Mutex<()>,
    workers: Mutex<()>,
    components: Mutex<()>,
}

/// Shared controller state, also the dispatch target of the `"main"`
/// capability hosts call back into.
struct Core {
    layout: Layout,
    hub: SharedHub,
    phase: Mutex<Phase>,
    config: Mutex<Option<Config>>,
    components: Mutex<BTreeMap<String, ComponentCell>>,
    hosts: Mutex<Vec<HostRecord>>,
    residency: Mutex<HashMap<String, String>>,
    connector: Mutex<Option<Connector>>,
    raw: RawCalls,
    locks: SerialLocks,
    launch_timeout: Mutex<Duration>,
}

impl Core {
    fn guard_setup(&self) -> Result<()> {
        match *self.phase.lock() {
            Phase::Setup => Ok(()),
            Phase::Closed => Err(Error::core(CoreError::Closed, "the controller is closed")),
            Phase::Init | Phase::Configured => Err(Error::core(
                CoreError::NotSetup,
                "call setup() before using the controller",
            )),
        }
    }
    fn host_api(&self, process_id: &str) -> Result<HostApi> {
        self.hosts
            .lock()
            .iter()
            .find(|h| h.process_id == process_id)
            .map(|h| h.api.clone())
            .ok_or_else(|| {
                Error::lookup(
                    LookupError::UnknownProcess,
                    format!("no process '{}'", process_id),
                )
            })
    }
    fn process_id_of_worker(&self, worker_id: &str) -> Result<String> {
        self.residency
            .lock()
            .get(worker_id)
            .cloned()
            .ok_or_else(|| {
                Error::lookup(
                    LookupError::UnknownWorker,
                    format!("no worker '{}'", worker_id),
                )
            })
    }
    fn call_core_component(
        &self,
        component_id: &str,
        method: &str,
        args: &[HubValue],
        kwargs: &Kwargs,
    ) -> Result<HubValue> {
        let components = self.components.lock();
        let cell = components.get(component_id).ok_or_else(|| {
            Error::lookup(
                LookupError::UnknownComponent,
                format!("no component '{}'", component_id),
            )
        })?;
        cell.call(method, args, kwargs)
    }
    fn call_worker_component(
        &self,
        worker_id: &str,
        component_id: &str,
        method: &str,
        args: Vec<HubValue>,
        kwargs: Kwargs,
    ) -> Result<HubValue> {
        self.guard_setup()?;
        let process_id = self.process_id_of_worker(worker_id)?;
        let api = self.host_api(&process_id)?;
        api.call_worker_component(worker_id, component_id, method, args, kwargs)
    }
}

impl ApiTarget for Core {
    fn dispatch(&self, mut request: Request) -> Result<HubValue> {
        match request.method.as_str() {
            "call_core_component" => {
                let args = request.split_tail(2);
                self.call_core_component(
                    request.str_arg(0)?,
                    request.str_arg(1)?,
                    &args,
                    &request.kwargs,
                )
            }
            "call_worker_component" => {
                let args = request.split_tail(3);
                let kwargs = std::mem::take(&mut request.kwargs);
                self.call_worker_component(
                    request.str_arg(0)?,
                    request.str_arg(1)?,
                    request.str_arg(2)?,
                    args,
                    kwargs,
                )
            }
            _ => self.raw.dispatch(&request),
        }
    }
}

/// The facade of the runtime: creates hosts, routes worker and component
/// operations by residency, fans events out and coordinates shutdown.
///
/// The controller is cheap to clone; clones share the same runtime. It
/// moves through the phases `Init -> Configured -> Setup -> Closed`:
/// [`Controller::configure`] and [`Controller::setup`] must be called once
/// before anything else.
#[derive(Clone)]
pub struct Controller {
    core: Arc<Core>,
}

impl Controller {
    /// Creates a controller over the given runtime root. The root and its
    /// `logs/` and `persistence/` directories are created immediately.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let layout = Layout::create(root)?;
        Ok(Self {
            core: Arc::new(Core {
                layout,
                hub: SharedHub::new(),
                phase: Mutex::new(Phase::Init),
                config: Mutex::new(None),
                components: Mutex::new(BTreeMap::new()),
                hosts: Mutex::new(Vec::new()),
                residency: Mutex::new(HashMap::new()),
                connector: Mutex::new(None),
                raw: RawCalls::default(),
                locks: SerialLocks {
                    hosts: Mutex::new(()),
                    workers: Mutex::new(()),
                    components: Mutex::new(()),
                },
                launch_timeout: Mutex::new(DEFAULT_LAUNCH_TIMEOUT),
            }),
        })
    }
    /// The filesystem layout of the runtime root
    pub fn layout(&self) -> Layout {
        self.core.layout.clone()
    }
    /// The shared hub handle
    pub fn hub(&self) -> SharedHub {
        self.core.hub.clone()
    }
    /// The registry of dynamically registered methods reachable from hosts
    /// through `raw_call` on the `"main"` capability
    pub fn raw_calls(&self) -> &RawCalls {
        &self.core.raw
    }
    /// Overrides the bound on waiting for host readiness
    pub fn set_launch_timeout(&self, timeout: Duration) {
        *self.core.launch_timeout.lock() = timeout;
    }
    /// Applies the configuration. Can be called only once.
    pub fn configure(&self, config: Config) -> Result<()> {
        let mut phase = self.core.phase.lock();
        match *phase {
            Phase::Init => {
                *self.core.config.lock() = Some(config);
                *phase = Phase::Configured;
                Ok(())
            }
            Phase::Closed => Err(Error::core(CoreError::Closed, "the controller is closed")),
            Phase::Configured | Phase::Setup => Err(Error::core(
                CoreError::AlreadyConfigured,
                "a config method can be called only once",
            )),
        }
    }
    /// Loads a JSON configuration file and applies it
    pub fn configure_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.configure(Config::load_json(path)?)
    }
    /// The applied configuration
    pub fn config(&self) -> Option<Config> {
        self.core.config.lock().clone()
    }
    /// Sets the controller up: opens the registered components and starts
    /// the `"main"` connector. Idempotent once configured.
    pub fn setup(&self) -> Result<()> {
        let mut phase = self.core.phase.lock();
        match *phase {
            Phase::Setup => return Ok(()),
            Phase::Init => {
                return Err(Error::core(
                    CoreError::NotConfigured,
                    "call configure() before setup()",
                ))
            }
            Phase::Closed => {
                return Err(Error::core(CoreError::Closed, "the controller is closed"))
            }
            Phase::Configured => {}
        }
        {
            let mut components = self.core.components.lock();
            for cell in components.values_mut() {
                match cell.open() {
                    Ok(()) => {}
                    // components opened by hand before setup are fine
                    Err(e) if matches!(e.kind(), crate::ErrorKind::State(_)) => {}
                    Err(e) => {
                        return Err(e.context(format!("opening component '{}'", cell.id())))
                    }
                }
            }
        }
        let connector = Connector::new(
            MAIN_PROCESS_ID,
            self.core.clone() as Arc<dyn ApiTarget>,
            self.core.hub.clone(),
        )?;
        *self.core.connector.lock() = Some(connector);
        *phase = Phase::Setup;
        info!(root = %self.core.layout.root().display(), "controller ready");
        Ok(())
    }
    /// True if the controller reached the setup phase and is not closed
    pub fn is_setup(&self) -> bool {
        *self.core.phase.lock() == Phase::Setup
    }
    /// True if the controller is closed
    pub fn is_closed(&self) -> bool {
        *self.core.phase.lock() == Phase::Closed
    }

    // -- processes --

    /// Creates a host under a fresh process id and waits for its readiness
    /// signal within the launch timeout.
    pub fn create_process(&self, process_id: &str) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.hosts.lock();
        if process_id == MAIN_PROCESS_ID || self.is_process(process_id) {
            return Err(Error::lookup(
                LookupError::ProcessAlreadyExists,
                format!("a process '{}' already exists", process_id),
            ));
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let hub = self.core.hub.clone();
            let process_id = process_id.to_owned();
            Builder::new()
                .name(format!("spawn_{}", process_id))
                .spawn(move || {
                    let result = Host::launch(&process_id, hub).map(|_| ());
                    let _ = ready_tx.send(result);
                })?;
        }
        let timeout = *self.core.launch_timeout.lock();
        match ready_rx.recv_timeout(timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::core(
                    CoreError::ProcessLaunch,
                    format!("process '{}' failed to launch", process_id),
                )
                .caused_by(e))
            }
            Err(_) => {
                return Err(Error::core(
                    CoreError::ProcessLaunch,
                    format!(
                        "process '{}' did not report readiness within {:?}",
                        process_id, timeout
                    ),
                ))
            }
        }
        self.core.hosts.lock().push(HostRecord {
            process_id: process_id.to_owned(),
            api: HostApi::remote(process_id, self.core.hub.clone()),
        });
        Ok(())
    }
    /// True if a host with this process id exists
    pub fn is_process(&self, process_id: &str) -> bool {
        self.core
            .hosts
            .lock()
            .iter()
            .any(|h| h.process_id == process_id)
    }
    /// The live process ids in registration order
    pub fn process_ids(&self) -> Vec<String> {
        self.core
            .hosts
            .lock()
            .iter()
            .map(|h| h.process_id.clone())
            .collect()
    }
    /// The remote capability of a host
    pub fn process_api(&self, process_id: &str) -> Result<HostApi> {
        self.core.guard_setup()?;
        self.core.host_api(process_id)
    }
    fn wait_process_cleared(&self, process_id: &str) {
        let started = bma_ts::Monotonic::now();
        while self.core.hub.has_process_state(process_id) {
            if started.elapsed() >= CLOSE_SYNC_TIMEOUT {
                warn!(process = %process_id, "hub entry still present after close");
                return;
            }
            thread::sleep(CLOSE_POLL_STEP);
        }
    }
    fn drop_process_records(&self, process_id: &str) {
        self.core.hosts.lock().retain(|h| h.process_id != process_id);
        self.core
            .residency
            .lock()
            .retain(|_, owner| owner != process_id);
    }
    /// Closes a host: all of its workers are stopped and closed. With
    /// `kill`, worker failures are swallowed instead of raised.
    pub fn close_process(&self, process_id: &str, kill: bool) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.hosts.lock();
        let api = self.core.host_api(process_id)?;
        let result = if kill { api.kill() } else { api.close() };
        result.map_err(|e| e.context(format!("closing process '{}'", process_id)))?;
        self.wait_process_cleared(process_id);
        self.drop_process_records(process_id);
        Ok(())
    }

    // -- workers --

    /// Adds a worker to a host and records its residency
    pub fn add_worker(&self, process_id: &str, worker: Worker) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.workers.lock();
        let api = self.core.host_api(process_id)?;
        let worker_id = worker.id().to_owned();
        api.add_worker(worker)?;
        self.core
            .residency
            .lock()
            .insert(worker_id, process_id.to_owned());
        Ok(())
    }
    /// Adds a worker to a host, opens it and starts it
    pub fn load_worker(&self, process_id: &str, worker: Worker) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.workers.lock();
        let api = self.core.host_api(process_id)?;
        let worker_id = worker.id().to_owned();
        api.load_worker(worker)?;
        self.core
            .residency
            .lock()
            .insert(worker_id, process_id.to_owned());
        Ok(())
    }
    /// True if a worker with this id is resident anywhere
    pub fn is_worker(&self, worker_id: &str) -> bool {
        self.core.residency.lock().contains_key(worker_id)
    }
    /// The process id owning the worker
    pub fn process_id_of_worker(&self, worker_id: &str) -> Result<String> {
        self.core.process_id_of_worker(worker_id)
    }
    fn worker_api(&self, worker_id: &str) -> Result<HostApi> {
        let process_id = self.core.process_id_of_worker(worker_id)?;
        self.core.host_api(&process_id)
    }
    /// Removes a worker which was never opened or is closed
    pub fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.workers.lock();
        self.worker_api(worker_id)?.remove_worker(worker_id)?;
        self.core.residency.lock().remove(worker_id);
        Ok(())
    }
    /// Opens a worker
    pub fn open_worker(&self, worker_id: &str) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.workers.lock();
        self.worker_api(worker_id)?.open_worker(worker_id)
    }
    /// Starts a worker
    pub fn start_worker(&self, worker_id: &str) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.workers.lock();
        self.worker_api(worker_id)?.start_worker(worker_id)
    }
    /// Stops a worker
    pub fn stop_worker(&self, worker_id: &str) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.workers.lock();
        self.worker_api(worker_id)?.stop_worker(worker_id)
    }
    /// Closes a worker and removes it from its host
    pub fn close_worker(&self, worker_id: &str) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.workers.lock();
        self.worker_api(worker_id)?.close_worker(worker_id)?;
        self.core.residency.lock().remove(worker_id);
        Ok(())
    }
    /// Stops, closes and removes a worker, swallowing lifecycle guard
    /// failures
    pub fn kill_worker(&self, worker_id: &str) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.workers.lock();
        self.worker_api(worker_id)?.kill_worker(worker_id)?;
        self.core.residency.lock().remove(worker_id);
        Ok(())
    }
    /// True if the worker is opened
    pub fn is_worker_opened(&self, worker_id: &str) -> Result<bool> {
        self.core.guard_setup()?;
        self.worker_api(worker_id)?.is_worker_opened(worker_id)
    }
    /// True if the worker is running
    pub fn is_worker_running(&self, worker_id: &str) -> Result<bool> {
        self.core.guard_setup()?;
        self.worker_api(worker_id)?.is_worker_running(worker_id)
    }
    /// True if the worker is closed
    pub fn is_worker_closed(&self, worker_id: &str) -> Result<bool> {
        self.core.guard_setup()?;
        self.worker_api(worker_id)?.is_worker_closed(worker_id)
    }

    // -- components --

    /// Adds a controller-owned component
    pub fn add_component<S: Into<String>, C: Component + 'static>(
        &self,
        id: S,
        component: C,
    ) -> Result<()> {
        let _serial = self.core.locks.components.lock();
        let id = id.into();
        let mut components = self.core.components.lock();
        if components.contains_key(&id) {
            return Err(Error::lookup(
                LookupError::ComponentAlreadyAdded,
                format!("component '{}' is already added", id),
            ));
        }
        components.insert(id.clone(), ComponentCell::new(id, component));
        Ok(())
    }
    /// True if a controller-owned component with this id exists
    pub fn is_component(&self, component_id: &str) -> bool {
        self.core.components.lock().contains_key(component_id)
    }
    fn with_component<T>(
        &self,
        component_id: &str,
        f: impl FnOnce(&mut ComponentCell) -> Result<T>,
    ) -> Result<T> {
        let mut components = self.core.components.lock();
        let cell = components.get_mut(component_id).ok_or_else(|| {
            Error::lookup(
                LookupError::UnknownComponent,
                format!("no component '{}'", component_id),
            )
        })?;
        f(cell)
    }
    /// Removes a controller-owned component
    pub fn remove_component(&self, component_id: &str) -> Result<()> {
        let _serial = self.core.locks.components.lock();
        if self.core.components.lock().remove(component_id).is_none() {
            return Err(Error::lookup(
                LookupError::UnknownComponent,
                format!("no component '{}'", component_id),
            ));
        }
        Ok(())
    }
    /// Opens a controller-owned component
    pub fn open_component(&self, component_id: &str) -> Result<()> {
        let _serial = self.core.locks.components.lock();
        self.with_component(component_id, ComponentCell::open)
    }
    /// Starts a controller-owned component
    pub fn start_component(&self, component_id: &str) -> Result<()> {
        let _serial = self.core.locks.components.lock();
        self.with_component(component_id, ComponentCell::start)
    }
    /// Stops a controller-owned component
    pub fn stop_component(&self, component_id: &str) -> Result<()> {
        let _serial = self.core.locks.components.lock();
        self.with_component(component_id, ComponentCell::stop)
    }
    /// Closes a controller-owned component and removes it
    pub fn close_component(&self, component_id: &str) -> Result<()> {
        let _serial = self.core.locks.components.lock();
        self.with_component(component_id, ComponentCell::close)?;
        self.core.components.lock().remove(component_id);
        Ok(())
    }
    /// True if the controller-owned component is opened
    pub fn is_component_opened(&self, component_id: &str) -> Result<bool> {
        self.with_component(component_id, |c| Ok(c.is_opened()))
    }
    /// True if the controller-owned component is running
    pub fn is_component_running(&self, component_id: &str) -> Result<bool> {
        self.with_component(component_id, |c| Ok(c.is_running()))
    }
    /// Invokes a named method on a controller-owned component
    pub fn call_core_component(
        &self,
        component_id: &str,
        method: &str,
        args: &[HubValue],
        kwargs: &Kwargs,
    ) -> Result<HubValue> {
        self.core
            .call_core_component(component_id, method, args, kwargs)
    }
    /// Invokes a named method on a component of a worker, routed by
    /// residency through the owning host
    pub fn call_worker_component(
        &self,
        worker_id: &str,
        component_id: &str,
        method: &str,
        args: Vec<HubValue>,
        kwargs: Kwargs,
    ) -> Result<HubValue> {
        self.core
            .call_worker_component(worker_id, component_id, method, args, kwargs)
    }

    // -- events --

    fn with_connector<T>(&self, f: impl FnOnce(&Connector) -> T) -> Result<T> {
        let connector = self.core.connector.lock();
        match connector.as_ref() {
            Some(connector) => Ok(f(connector)),
            None => Err(Error::core(
                CoreError::NotSetup,
                "the event bus is available once setup() has run",
            )),
        }
    }
    /// Subscribes a callback to an event
    pub fn subscribe<F>(&self, event: Event, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.with_connector(|c| c.subscribe(event, callback))
    }
    /// Subscribes a callback declaring the parameter names it consumes
    pub fn subscribe_filtered<F>(
        &self,
        event: Event,
        params: &[&str],
        callback: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.with_connector(|c| c.subscribe_filtered(event, params, callback))?
    }
    /// Drops one local subscriber
    pub fn unsubscribe(&self, event: Event, subscription: SubscriptionId) {
        let _ = self.with_connector(|c| c.unsubscribe(event, subscription));
    }
    /// Publishes an event to every subscribed process
    pub fn trigger(&self, event: Event, record: EventRecord) {
        self.core.hub.trigger(event, record);
    }
    /// The local-mode `"main"` capability, for handing to in-process
    /// collaborators
    pub fn core_api(&self) -> CoreApi {
        CoreApi::local(self.core.clone() as Arc<dyn ApiTarget>)
    }

    // -- shutdown --

    /// Registers SIGINT and SIGTERM handlers which close the controller
    #[cfg(unix)]
    pub fn register_signals(&self) -> Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(Error::from)?;
        let controller = self.clone();
        Builder::new().name("sig").spawn(move || {
            if let Some(signal) = signals.forever().next() {
                warn!(signal, "termination signal received, closing");
                if let Err(e) = controller.close() {
                    error!(error = %e, "close on signal failed");
                }
            }
        })?;
        Ok(())
    }
    /// Closes the runtime: hosts in registration order (each stops and
    /// closes its workers), then controller components (failures logged),
    /// then the `"main"` connector. The controller ends up `Closed`.
    pub fn close(&self) -> Result<()> {
        self.core.guard_setup()?;
        let _serial = self.core.locks.hosts.lock();
        loop {
            let record = match self.core.hosts.lock().first() {
                Some(record) => record.clone(),
                None => break,
            };
            record
                .api
                .close()
                .map_err(|e| e.context(format!("closing process '{}'", record.process_id)))?;
            self.wait_process_cleared(&record.process_id);
            self.drop_process_records(&record.process_id);
        }
        {
            let mut components = self.core.components.lock();
            for cell in components.values_mut() {
                if cell.is_closed() || cell.state() == crate::lifecycle::State::Init {
                    continue;
                }
                if cell.is_running() {
                    if let Err(e) = cell.stop() {
                        warn!(component = cell.id(), error = %e, "component failed to stop");
                    }
                }
                if let Err(e) = cell.close() {
                    warn!(component = cell.id(), error = %e, "component failed to close");
                }
            }
            components.clear();
        }
        if let Some(connector) = self.core.connector.lock().take() {
            connector.close();
        }
        let _ = self.core.hub.clear_process(MAIN_PROCESS_ID);
        *self.core.phase.lock() = Phase::Closed;
        info!("controller closed");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::worker::{Routine, RunResult, WorkerContext};
    use crate::{ErrorKind, StateError};
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Idle;

    impl Routine for Idle {}

    struct Adder;

    impl Component for Adder {
        fn call(&self, method: &str, args: &[HubValue], kwargs: &Kwargs) -> Result<HubValue> {
            match method {
                "add" => {
                    let mut sum: i64 = args.iter().filter_map(HubValue::as_i64).sum();
                    sum += kwargs.values().filter_map(HubValue::as_i64).sum::<i64>();
                    Ok(HubValue::from(sum))
                }
                other => Err(Error::lookup(
                    LookupError::UnknownComponentMethod,
                    format!("no method '{}'", other),
                )),
            }
        }
    }

    #[derive(Default)]
    struct Store {
        count: AtomicI64,
    }

    impl Component for Store {
        fn call(&self, method: &str, _args: &[HubValue], _kwargs: &Kwargs) -> Result<HubValue> {
            match method {
                "put" => {
                    self.count.fetch_add(1, Ordering::Relaxed);
                    Ok(HubValue::Unit)
                }
                "get" => Ok(HubValue::from(self.count.load(Ordering::Relaxed))),
                other => Err(Error::lookup(
                    LookupError::UnknownComponentMethod,
                    format!("no method '{}'", other),
                )),
            }
        }
    }

    /// Reports into the controller-owned "store" component while running
    struct Reporter;

    impl Routine for Reporter {
        fn run(&self, ctx: &WorkerContext) -> RunResult {
            let core = ctx.core().ok_or("worker is not hosted")?;
            while !ctx.should_stop() {
                core.call_core_component("store", "put", Vec::new(), Kwargs::new())?;
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }
    }

    fn ready_controller() -> (Controller, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(dir.path().join("var")).unwrap();
        controller.configure(Config::default()).unwrap();
        controller.setup().unwrap();
        (controller, dir)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_phase_machine() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(dir.path().join("var")).unwrap();
        assert_eq!(
            controller.setup().unwrap_err().kind(),
            ErrorKind::Core(CoreError::NotConfigured)
        );
        assert_eq!(
            controller.create_process("P1").unwrap_err().kind(),
            ErrorKind::Core(CoreError::NotSetup)
        );
        controller.configure(Config::default()).unwrap();
        assert_eq!(
            controller.configure(Config::default()).unwrap_err().kind(),
            ErrorKind::Core(CoreError::AlreadyConfigured)
        );
        controller.setup().unwrap();
        controller.setup().unwrap();
        assert!(controller.is_setup());
        controller.close().unwrap();
        assert!(controller.is_closed());
        assert_eq!(
            controller.create_process("P1").unwrap_err().kind(),
            ErrorKind::Core(CoreError::Closed)
        );
        assert_eq!(
            controller.close().unwrap_err().kind(),
            ErrorKind::Core(CoreError::Closed)
        );
    }

    #[test]
    fn test_process_round_trip() {
        let (controller, _dir) = ready_controller();
        controller.set_launch_timeout(Duration::from_secs(5));
        controller.create_process("P1").unwrap();
        assert_eq!(
            controller.process_api("P1").unwrap().process_id(),
            "P1"
        );
        assert!(controller.is_process("P1"));
        assert_eq!(
            controller.create_process("P1").unwrap_err().kind(),
            ErrorKind::Lookup(LookupError::ProcessAlreadyExists)
        );
        assert_eq!(
            controller.create_process("main").unwrap_err().kind(),
            ErrorKind::Lookup(LookupError::ProcessAlreadyExists)
        );
        controller.close_process("P1", false).unwrap();
        assert!(!controller.is_process("P1"));
        assert!(!controller.hub().has_process_state("P1"));
        // the id is free again
        controller.create_process("P1").unwrap();
        controller.close().unwrap();
    }

    #[test]
    fn test_worker_routing_end_to_end() {
        let (controller, _dir) = ready_controller();
        controller.create_process("P1").unwrap();
        let mut worker = Worker::new("w1", Idle);
        worker.add_component("calc", Adder).unwrap();
        controller.add_worker("P1", worker).unwrap();
        assert!(controller.is_worker("w1"));
        assert_eq!(controller.process_id_of_worker("w1").unwrap(), "P1");
        controller.open_worker("w1").unwrap();
        controller.start_worker("w1").unwrap();
        assert!(controller.is_worker_running("w1").unwrap());
        let sum = controller
            .call_worker_component(
                "w1",
                "calc",
                "add",
                vec![HubValue::from(10), HubValue::from(20)],
                Kwargs::from([("a".to_owned(), HubValue::from(30))]),
            )
            .unwrap();
        assert_eq!(sum.as_i64(), Some(60));
        controller.stop_worker("w1").unwrap();
        controller.close_worker("w1").unwrap();
        assert!(!controller.is_worker("w1"));
        controller.close().unwrap();
    }

    #[test]
    fn test_lifecycle_rejection_is_propagated_untouched() {
        let (controller, _dir) = ready_controller();
        controller.create_process("P1").unwrap();
        controller.add_worker("P1", Worker::new("w1", Idle)).unwrap();
        let err = controller.start_worker("w1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State(StateError::NotOpened));
        assert!(!controller.is_worker_running("w1").unwrap());
        assert!(!controller.is_worker_opened("w1").unwrap());
        controller.kill_worker("w1").unwrap();
        controller.close().unwrap();
    }

    #[test]
    fn test_remote_failure_carries_call_context() {
        let (controller, _dir) = ready_controller();
        controller.create_process("P1").unwrap();
        controller.add_worker("P1", Worker::new("w1", Idle)).unwrap();
        let err = controller
            .call_worker_component("w1", "c1", "m", Vec::new(), Kwargs::new())
            .unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::Lookup(LookupError::UnknownComponent)
        );
        assert_eq!(err.contexts(), ["call on P1"]);
        controller.close_process("P1", true).unwrap();
        controller.close().unwrap();
    }

    #[test]
    fn test_shutdown_ordering_over_two_hosts() {
        let (controller, _dir) = ready_controller();
        let hub = controller.hub();
        hub.subscribe("obs", Event::ProcessClosed);
        for pid in ["P1", "P2"] {
            controller.create_process(pid).unwrap();
            controller
                .load_worker(pid, Worker::new(format!("w_{}", pid), Idle))
                .unwrap();
        }
        assert_eq!(controller.process_ids(), ["P1", "P2"]);
        controller.close().unwrap();
        let closed: Vec<String> = hub
            .get_events("obs", Event::ProcessClosed)
            .iter()
            .filter_map(|r| r.process_id().map(str::to_owned))
            .collect();
        assert_eq!(closed, ["P1", "P2"]);
        assert!(!controller.is_process("P1"));
        assert!(!controller.is_worker("w_P1"));
        assert!(!hub.has_process_state("P1"));
        assert!(!hub.has_process_state("P2"));
        assert!(!hub.has_process_state("main"));
    }

    #[test]
    fn test_event_fan_out_through_the_bus() {
        let (controller, _dir) = ready_controller();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            controller
                .subscribe_filtered(
                    Event::WorkerAdded,
                    &["process_id", "worker_id"],
                    move |record| {
                        seen.lock().push((
                            record.process_id().unwrap_or_default().to_owned(),
                            record.worker_id().unwrap_or_default().to_owned(),
                        ));
                    },
                )
                .unwrap();
        }
        controller.create_process("P1").unwrap();
        controller.add_worker("P1", Worker::new("w1", Idle)).unwrap();
        wait_for(|| seen.lock().len() == 1);
        assert_eq!(seen.lock()[0], ("P1".to_owned(), "w1".to_owned()));
        assert_eq!(
            controller
                .subscribe_filtered(Event::ProcessClosed, &["worker_id"], |_| {})
                .unwrap_err()
                .kind(),
            ErrorKind::Subscription(crate::SubscriptionError::BadSignature)
        );
        let sub = controller.subscribe(Event::WorkerRemoved, |_| {}).unwrap();
        controller.unsubscribe(Event::WorkerRemoved, sub);
        // manual triggers reach hub-level subscribers
        let hub = controller.hub();
        hub.subscribe("obs", Event::WorkerStopped);
        controller.trigger(Event::WorkerStopped, EventRecord::worker("PX", "wx"));
        assert_eq!(hub.get_events("obs", Event::WorkerStopped).len(), 1);
        controller.close().unwrap();
    }

    #[test]
    fn test_component_lifecycle_and_local_core_api() {
        let (controller, _dir) = ready_controller();
        assert!(controller.layout().persistence_dir().is_dir());
        assert_eq!(controller.config().unwrap().host, "127.0.0.1");
        controller.add_component("store", Store::default()).unwrap();
        controller.open_component("store").unwrap();
        assert!(controller.is_component_opened("store").unwrap());
        controller.start_component("store").unwrap();
        assert!(controller.is_component_running("store").unwrap());
        controller.stop_component("store").unwrap();
        let api = controller.core_api();
        api.call_core_component("store", "put", Vec::new(), Kwargs::new())
            .unwrap();
        let count = controller
            .call_core_component("store", "get", &[], &Kwargs::new())
            .unwrap();
        assert_eq!(count.as_i64(), Some(1));
        // local capabilities refuse raw calls
        assert_eq!(
            api.raw_call("custom", Vec::new(), Kwargs::new())
                .unwrap_err()
                .kind(),
            ErrorKind::Transport(crate::TransportError::NotRemote)
        );
        controller.close_component("store").unwrap();
        controller.add_component("tmp", Store::default()).unwrap();
        controller.remove_component("tmp").unwrap();
        assert!(!controller.is_component("tmp"));
        controller.close().unwrap();
    }

    #[test]
    fn test_controller_raw_call_reachable_from_hosts() {
        let (controller, _dir) = ready_controller();
        controller
            .raw_calls()
            .register("version", |_, _| Ok(HubValue::from("1.0")));
        let core = CoreApi::remote(MAIN_PROCESS_ID, controller.hub());
        assert_eq!(
            core.raw_call("version", Vec::new(), Kwargs::new())
                .unwrap()
                .as_str(),
            Some("1.0")
        );
        controller.close().unwrap();
    }

    #[test]
    fn test_controller_components_and_symmetric_calls() {
        let (controller, _dir) = ready_controller();
        controller.add_component("store", Store::default()).unwrap();
        assert_eq!(
            controller
                .add_component("store", Store::default())
                .unwrap_err()
                .kind(),
            ErrorKind::Lookup(LookupError::ComponentAlreadyAdded)
        );
        controller.open_component("store").unwrap();
        controller.create_process("P1").unwrap();
        controller
            .load_worker("P1", Worker::new("w1", Reporter))
            .unwrap();
        let get = || {
            controller
                .call_core_component("store", "get", &[], &Kwargs::new())
                .unwrap()
                .as_i64()
                .unwrap_or(0)
        };
        wait_for(|| get() > 0);
        controller.kill_worker("w1").unwrap();
        assert!(!controller.is_worker("w1"));
        controller.close_component("store").unwrap();
        assert!(!controller.is_component("store"));
        controller.close().unwrap();
    }
}
