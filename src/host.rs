use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::api::{ApiTarget, CoreApi, RawCalls};
use crate::connector::Connector;
use crate::events::{Event, EventRecord};
use crate::hub::SharedHub;
use crate::payload::{HubValue, Kwargs, Request};
use crate::task::Builder;
use crate::worker::Worker;
use crate::{Error, Hook, LookupError, Result, StateError, MAIN_PROCESS_ID};

/// Bound on waiting for the last in-flight call to drain during teardown
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A worker container listening on the hub under its own process id.
///
/// The host lives as long as its listener: [`Host::launch`] registers the
/// process with the hub, starts the connector and publishes
/// `ProcessCreated`; `close`/`kill` shut the workers down and tear the
/// process state out of the hub. The host also holds the remote capability
/// of the controller process (`"main"`) so its workers can call
/// controller-level operations symmetrically.
pub struct Host {
    process_id: String,
    hub: SharedHub,
    workers: Mutex<BTreeMap<String, Worker>>,
    connector: Mutex<Option<Connector>>,
    core: CoreApi,
    raw: RawCalls,
}

impl Host {
    /// Creates the host, its connector and listener, and publishes
    /// `ProcessCreated`
    pub fn launch<S: Into<String>>(process_id: S, hub: SharedHub) -> Result<Arc<Self>> {
        let process_id = process_id.into();
        let host = Arc::new(Self {
            process_id: process_id.clone(),
            hub: hub.clone(),
            workers: Mutex::new(BTreeMap::new()),
            connector: Mutex::new(None),
            core: CoreApi::remote(MAIN_PROCESS_ID, hub.clone()),
            raw: RawCalls::default(),
        });
        let connector = Connector::new(
            &process_id,
            host.clone() as Arc<dyn ApiTarget>,
            hub.clone(),
        )?;
        *host.connector.lock() = Some(connector);
        hub.trigger(Event::ProcessCreated, EventRecord::process(&process_id));
        info!(process = %process_id, "host launched");
        Ok(host)
    }
    /// The host's process id
    pub fn process_id(&self) -> &str {
        &self.process_id
    }
    /// The remote capability of the controller process
    pub fn core(&self) -> &CoreApi {
        &self.core
    }
    /// The registry of dynamically registered methods reachable through
    /// `raw_call`
    pub fn raw_calls(&self) -> &RawCalls {
        &self.raw
    }
    fn prefix(&self) -> String {
        format!("host '{}'", self.process_id)
    }
    fn with_connector<T>(&self, f: impl FnOnce(&Connector) -> T) -> Result<T> {
        let connector = self.connector.lock();
        match connector.as_ref() {
            Some(connector) => Ok(f(connector)),
            None => Err(Error::state(
                StateError::Closed,
                format!("{} is closed", self.prefix()),
            )),
        }
    }
    /// Subscribes a callback to an event on this host's process
    pub fn subscribe<F>(&self, event: Event, callback: F) -> Result<crate::connector::SubscriptionId>
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.with_connector(|c| c.subscribe(event, callback))
    }
    /// Drops one local subscriber
    pub fn unsubscribe(&self, event: Event, subscription: crate::connector::SubscriptionId) {
        let _ = self.with_connector(|c| c.unsubscribe(event, subscription));
    }
    /// Publishes an event on the bus
    pub fn trigger(&self, event: Event, record: EventRecord) {
        self.hub.trigger(event, record);
    }
    /// Adds a worker to the host and emits `WorkerAdded`
    pub fn add_worker(&self, mut worker: Worker) -> Result<()> {
        let mut workers = self.workers.lock();
        let id = worker.id().to_owned();
        if workers.contains_key(&id) {
            return Err(Error::lookup(
                LookupError::WorkerAlreadyAdded,
                format!("{}: worker '{}' is already added", self.prefix(), id),
            ));
        }
        worker.attach(&self.process_id, self.hub.clone());
        workers.insert(id.clone(), worker);
        drop(workers);
        self.trigger(
            Event::WorkerAdded,
            EventRecord::worker(&self.process_id, &id),
        );
        Ok(())
    }
    /// Adds a worker, opens it and starts it
    pub fn load_worker(&self, worker: Worker) -> Result<()> {
        let id = worker.id().to_owned();
        self.add_worker(worker)?;
        self.open_worker(&id)?;
        self.start_worker(&id)
    }
    fn unknown_worker(&self, worker_id: &str) -> Error {
        Error::lookup(
            LookupError::UnknownWorker,
            format!("{}: unknown worker '{}'", self.prefix(), worker_id),
        )
    }
    fn with_worker<T>(
        &self,
        worker_id: &str,
        f: impl FnOnce(&mut Worker) -> Result<T>,
    ) -> Result<T> {
        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| self.unknown_worker(worker_id))?;
        f(worker)
    }
    /// True if the host owns a worker with this id
    pub fn is_worker(&self, worker_id: &str) -> bool {
        self.workers.lock().contains_key(worker_id)
    }
    /// True if the worker is opened
    pub fn is_worker_opened(&self, worker_id: &str) -> Result<bool> {
        self.with_worker(worker_id, |w| Ok(w.is_opened()))
    }
    /// True if the worker is running
    pub fn is_worker_running(&self, worker_id: &str) -> Result<bool> {
        self.with_worker(worker_id, |w| Ok(w.is_running()))
    }
    /// True if the worker is closed
    pub fn is_worker_closed(&self, worker_id: &str) -> Result<bool> {
        self.with_worker(worker_id, |w| Ok(w.is_closed()))
    }
    /// Removes a worker which was never opened or is closed; emits
    /// `WorkerRemoved`
    pub fn remove_worker(&self, worker_id: &str) -> Result<()> {
        let mut workers = self.workers.lock();
        let worker = workers
            .get(worker_id)
            .ok_or_else(|| self.unknown_worker(worker_id))?;
        if worker.is_opened() {
            return Err(Error::state(
                StateError::NotClosed,
                format!(
                    "{}: worker '{}' must be closed before removal",
                    self.prefix(),
                    worker_id
                ),
            ));
        }
        workers.remove(worker_id);
        drop(workers);
        self.trigger(
            Event::WorkerRemoved,
            EventRecord::worker(&self.process_id, worker_id),
        );
        Ok(())
    }
    /// Opens a worker and emits `WorkerOpened`
    pub fn open_worker(&self, worker_id: &str) -> Result<()> {
        self.with_worker(worker_id, |w| w.open())
            .map_err(|e| e.context(format!("{}: open worker '{}'", self.prefix(), worker_id)))?;
        self.trigger(
            Event::WorkerOpened,
            EventRecord::worker(&self.process_id, worker_id),
        );
        Ok(())
    }
    /// Starts a worker and emits `WorkerStarted`
    pub fn start_worker(&self, worker_id: &str) -> Result<()> {
        self.with_worker(worker_id, |w| w.start())
            .map_err(|e| e.context(format!("{}: start worker '{}'", self.prefix(), worker_id)))?;
        self.trigger(
            Event::WorkerStarted,
            EventRecord::worker(&self.process_id, worker_id),
        );
        Ok(())
    }
    /// Stops a worker and emits `WorkerStopped`
    pub fn stop_worker(&self, worker_id: &str) -> Result<()> {
        self.with_worker(worker_id, |w| w.stop())
            .map_err(|e| e.context(format!("{}: stop worker '{}'", self.prefix(), worker_id)))?;
        self.trigger(
            Event::WorkerStopped,
            EventRecord::worker(&self.process_id, worker_id),
        );
        Ok(())
    }
    /// Closes a worker, removes it and emits `WorkerClosed` (then
    /// `WorkerRemoved`)
    pub fn close_worker(&self, worker_id: &str) -> Result<()> {
        self.with_worker(worker_id, |w| w.close())
            .map_err(|e| e.context(format!("{}: close worker '{}'", self.prefix(), worker_id)))?;
        self.trigger(
            Event::WorkerClosed,
            EventRecord::worker(&self.process_id, worker_id),
        );
        self.remove_worker(worker_id)
    }
    /// Stops, closes and removes a worker, swallowing everything but
    /// `UnknownWorker`; `WorkerRemoved` is always emitted
    pub fn kill_worker(&self, worker_id: &str) -> Result<()> {
        {
            let mut workers = self.workers.lock();
            let worker = workers
                .get_mut(worker_id)
                .ok_or_else(|| self.unknown_worker(worker_id))?;
            worker.kill();
            workers.remove(worker_id);
        }
        self.trigger(
            Event::WorkerRemoved,
            EventRecord::worker(&self.process_id, worker_id),
        );
        Ok(())
    }
    /// Invokes a named method on a component of a worker
    pub fn call_worker_component(
        &self,
        worker_id: &str,
        component_id: &str,
        method: &str,
        args: &[HubValue],
        kwargs: &Kwargs,
    ) -> Result<HubValue> {
        let workers = self.workers.lock();
        let worker = workers
            .get(worker_id)
            .ok_or_else(|| self.unknown_worker(worker_id))?;
        worker.call_component(component_id, method, args, kwargs)
    }
    /// Stops and closes every worker over a snapshot of the registry.
    /// Failures are collected; on any failure the aggregate is raised as a
    /// close `MethodCall` error and the host stays up so the caller may
    /// retry or `kill`. On success the host tears down.
    pub fn close(&self) -> Result<()> {
        let failures = self.close_workers();
        if !failures.is_empty() {
            let mut err = Error::method_call(
                Hook::Close,
                format!(
                    "{}: {} worker(s) failed to close",
                    self.prefix(),
                    failures.len()
                ),
            );
            let mut failures = failures.into_iter();
            if let Some(first) = failures.next() {
                err = err.caused_by(first);
            }
            for other in failures {
                err = err.context(other.to_string());
            }
            return Err(err);
        }
        self.teardown();
        Ok(())
    }
    /// Closes the host, logging and swallowing worker failures
    pub fn kill(&self) -> Result<()> {
        for failure in self.close_workers() {
            error!(process = %self.process_id, error = %failure, "worker failure during kill");
        }
        let ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.kill_worker(&id);
        }
        self.teardown();
        Ok(())
    }
    fn close_workers(&self) -> Vec<Error> {
        let mut failures = Vec::new();
        let ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        for id in ids {
            let result = (|| {
                if self.is_worker_running(&id)? {
                    self.stop_worker(&id)?;
                }
                if self.is_worker_opened(&id)? {
                    self.close_worker(&id)
                } else {
                    self.remove_worker(&id)
                }
            })();
            if let Err(e) = result {
                failures.push(e);
            }
        }
        failures
    }
    /// Emits `ProcessClosed`, closes the connector and clears the hub
    /// entry. Runs on its own thread so the reply to an in-flight `close`
    /// request can still be delivered through the listener.
    fn teardown(&self) {
        let hub = self.hub.clone();
        let process_id = self.process_id.clone();
        let connector = self.connector.lock().take();
        let spawned = Builder::new()
            .name(format!("fin_{}", process_id))
            .spawn(move || {
                hub.trigger(Event::ProcessClosed, EventRecord::process(&process_id));
                if let Some(connector) = connector {
                    connector.close();
                }
                if let Err(e) = hub.clear_process_when_idle(&process_id, TEARDOWN_TIMEOUT) {
                    warn!(process = %process_id, error = %e, "hub entry not cleared");
                } else {
                    info!(process = %process_id, "host closed");
                }
            });
        if let Err(e) = spawned {
            error!(process = %self.process_id, error = %e, "host teardown failed to spawn");
        }
    }
}

impl ApiTarget for Host {
    fn dispatch(&self, mut request: Request) -> Result<HubValue> {
        match request.method.as_str() {
            "add_worker" => {
                let worker = request.take_worker_arg(0)?;
                self.add_worker(worker).map(|_| HubValue::Unit)
            }
            "load_worker" => {
                let worker = request.take_worker_arg(0)?;
                self.load_worker(worker).map(|_| HubValue::Unit)
            }
            "remove_worker" => self.remove_worker(request.str_arg(0)?).map(|_| HubValue::Unit),
            "open_worker" => self.open_worker(request.str_arg(0)?).map(|_| HubValue::Unit),
            "start_worker" => self.start_worker(request.str_arg(0)?).map(|_| HubValue::Unit),
            "stop_worker" => self.stop_worker(request.str_arg(0)?).map(|_| HubValue::Unit),
            "close_worker" => self.close_worker(request.str_arg(0)?).map(|_| HubValue::Unit),
            "kill_worker" => self.kill_worker(request.str_arg(0)?).map(|_| HubValue::Unit),
            "is_worker" => Ok(HubValue::from(self.is_worker(request.str_arg(0)?))),
            "is_worker_opened" => self
                .is_worker_opened(request.str_arg(0)?)
                .map(HubValue::from),
            "is_worker_running" => self
                .is_worker_running(request.str_arg(0)?)
                .map(HubValue::from),
            "is_worker_closed" => self
                .is_worker_closed(request.str_arg(0)?)
                .map(HubValue::from),
            "call_worker_component" => {
                let args = request.split_tail(3);
                self.call_worker_component(
                    request.str_arg(0)?,
                    request.str_arg(1)?,
                    request.str_arg(2)?,
                    &args,
                    &request.kwargs,
                )
            }
            "close" => self.close().map(|_| HubValue::Unit),
            "kill" => self.kill().map(|_| HubValue::Unit),
            _ => self.raw.dispatch(&request),
        }
    }
}
