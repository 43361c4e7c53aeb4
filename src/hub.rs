use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bma_ts::Monotonic;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::events::{Event, EventRecord};
use crate::payload::{HubValue, Request};
use crate::{Error, ErrorKind, LookupError, Result, TransportError};

/// A reply delivered through a process's response slot: an arbitrary value
/// or the failure carrier.
pub type Reply = Result<HubValue>;

/// Sleep step used when polling for an in-flight call to drain
const CLEAR_POLL_STEP: Duration = Duration::from_millis(1);

/// The process-addressed mailbox store.
///
/// Holds one request slot and one response slot per process plus one FIFO
/// queue per `(process, event)` pair with an active subscription. The hub
/// handle is cheap to clone and is shared by the controller and every host.
///
/// Request/response on one process slot is strictly serialized: a caller
/// cannot install a second request until the first response is drained.
pub struct SharedHub {
    inner: Arc<HubInner>,
}

impl Clone for SharedHub {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for SharedHub {
    fn default() -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                call_locks: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct HubInner {
    state: Mutex<HubState>,
    call_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Default)]
struct HubState {
    processes: BTreeSet<String>,
    calls: HashMap<String, Request>,
    responses: HashMap<String, Arc<Waiter>>,
    events: HashMap<String, HashMap<Event, VecDeque<EventRecord>>>,
    call_timeout: Option<Duration>,
}

#[derive(Default)]
struct Waiter {
    reply: Mutex<Option<Reply>>,
    ready: Condvar,
}

impl Waiter {
    fn put(&self, reply: Reply) {
        let mut slot = self.reply.lock();
        *slot = Some(reply);
        self.ready.notify_one();
    }
    /// Blocks until a reply lands or the timeout expires
    fn wait(&self, timeout: Option<Duration>) -> Option<Reply> {
        let mut slot = self.reply.lock();
        let Some(timeout) = timeout else {
            while slot.is_none() {
                self.ready.wait(&mut slot);
            }
            return slot.take();
        };
        let started = Monotonic::now();
        while slot.is_none() {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return None;
            }
            self.ready.wait_for(&mut slot, timeout - elapsed);
        }
        slot.take()
    }
}

impl SharedHub {
    /// Creates a new hub with no call timeout (callers block until a
    /// response lands)
    pub fn new() -> Self {
        Self::default()
    }
    /// Sets a deadline for blocking calls, can be used as a build pattern.
    /// Expired calls fail with [`TransportError::CallTimeout`] and their
    /// late responses are dropped.
    pub fn with_call_timeout(self, timeout: Duration) -> Self {
        self.inner.state.lock().call_timeout = Some(timeout);
        self
    }
    /// Registers a process on first hub contact
    pub fn register_process(&self, process_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.processes.insert(process_id.to_owned()) {
            return Err(Error::lookup(
                LookupError::ProcessAlreadyExists,
                format!("process '{}' is already registered to the hub", process_id),
            ));
        }
        Ok(())
    }
    fn call_lock(&self, process_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .call_locks
            .lock()
            .entry(process_id.to_owned())
            .or_default()
            .clone()
    }
    /// Calls a method of a process and blocks until its listener delivers
    /// the response.
    ///
    /// The request-install and response-drain critical sections are
    /// serialized on the hub state lock; the wait itself blocks outside of
    /// them. A per-process call lock keeps a second caller out until this
    /// response is drained.
    pub fn call(&self, process_id: &str, request: Request) -> Reply {
        let serial = self.call_lock(process_id);
        let _serial = serial.lock();
        let waiter = Arc::new(Waiter::default());
        let timeout = {
            let mut state = self.inner.state.lock();
            state
                .responses
                .insert(process_id.to_owned(), waiter.clone());
            state.calls.insert(process_id.to_owned(), request);
            state.call_timeout
        };
        let reply = waiter.wait(timeout);
        let mut state = self.inner.state.lock();
        state.responses.remove(process_id);
        match reply {
            Some(reply) => reply,
            None => {
                // expiry also cancels the request if nobody picked it up
                state.calls.remove(process_id);
                Err(Error::transport(
                    TransportError::CallTimeout,
                    format!("call on {} expired", process_id),
                ))
            }
        }
    }
    /// Returns and clears the pending request for the process, if any
    pub fn get_call(&self, process_id: &str) -> Option<Request> {
        self.inner.state.lock().calls.remove(process_id)
    }
    /// Delivers a reply to the process's response slot and signals the
    /// waiter. Late replies (no waiter) are dropped.
    pub fn set_response(&self, process_id: &str, reply: Reply) {
        let state = self.inner.state.lock();
        if let Some(waiter) = state.responses.get(process_id) {
            waiter.put(reply);
        } else {
            debug!(process = process_id, "late response dropped");
        }
    }
    /// Registers interest of a process in an event. Idempotent.
    pub fn subscribe(&self, process_id: &str, event: Event) {
        let mut state = self.inner.state.lock();
        state
            .events
            .entry(process_id.to_owned())
            .or_default()
            .entry(event)
            .or_default();
    }
    /// Drops interest of a process in an event, discarding anything still
    /// queued. Idempotent.
    pub fn unsubscribe(&self, process_id: &str, event: Event) {
        let mut state = self.inner.state.lock();
        if let Some(queues) = state.events.get_mut(process_id) {
            queues.remove(&event);
            if queues.is_empty() {
                state.events.remove(process_id);
            }
        }
    }
    /// Appends the posting to the queue of every process subscribed to the
    /// event at this instant
    pub fn trigger(&self, event: Event, record: EventRecord) {
        let mut state = self.inner.state.lock();
        for queues in state.events.values_mut() {
            if let Some(queue) = queues.get_mut(&event) {
                queue.push_back(record.clone());
            }
        }
    }
    /// Atomically drains the queued postings for `(process, event)` in FIFO
    /// order; empty if unsubscribed
    pub fn get_events(&self, process_id: &str, event: Event) -> Vec<EventRecord> {
        let mut state = self.inner.state.lock();
        state
            .events
            .get_mut(process_id)
            .and_then(|queues| queues.get_mut(&event))
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }
    /// Removes the call, response and event state of a process.
    ///
    /// Refused with [`TransportError::CallInFlight`] while a call on the
    /// process is still waiting for its response.
    pub fn clear_process(&self, process_id: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.responses.contains_key(process_id) {
                return Err(Error::transport(
                    TransportError::CallInFlight,
                    format!("process '{}' has a call in flight", process_id),
                ));
            }
            state.calls.remove(process_id);
            state.events.remove(process_id);
            state.processes.remove(process_id);
        }
        self.inner.call_locks.lock().remove(process_id);
        Ok(())
    }
    /// Retries [`SharedHub::clear_process`] until the in-flight call (if
    /// any) drains or the deadline expires
    pub fn clear_process_when_idle(&self, process_id: &str, deadline: Duration) -> Result<()> {
        let started = Monotonic::now();
        loop {
            match self.clear_process(process_id) {
                Err(e)
                    if e.kind() == ErrorKind::Transport(TransportError::CallInFlight)
                        && started.elapsed() < deadline =>
                {
                    thread::sleep(CLEAR_POLL_STEP);
                }
                other => return other,
            }
        }
    }
    /// True if the hub still holds a registration or any call, response or
    /// event state for the process
    pub fn has_process_state(&self, process_id: &str) -> bool {
        let state = self.inner.state.lock();
        state.processes.contains(process_id)
            || state.calls.contains_key(process_id)
            || state.responses.contains_key(process_id)
            || state.events.contains_key(process_id)
    }
}
