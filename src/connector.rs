use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::error;

use crate::api::ApiTarget;
use crate::events::{Event, EventRecord};
use crate::hub::SharedHub;
use crate::task::{Builder, Task};
use crate::{Error, Result, SubscriptionError};

/// Idle sleep of the listener loop when no request or event was pending
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// A callback invoked with every posting of a subscribed event
pub type EventCallback = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// A token identifying one local subscription, returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: u64,
    callback: EventCallback,
}

struct ConnectorShared {
    process_id: String,
    callbacks: Mutex<BTreeMap<Event, Vec<Subscriber>>>,
    alive: AtomicBool,
    next_subscription: AtomicU64,
}

/// The per-process listener bridging local objects and the shared hub.
///
/// On construction the connector registers its process with the hub and
/// spawns a listener thread which drains the process's event queues
/// (dispatching each posting to every local subscriber on a short-lived
/// thread) and its request slot (dispatching to the local capability and
/// publishing the reply) until `close`.
pub struct Connector {
    hub: SharedHub,
    shared: Arc<ConnectorShared>,
    listener: Mutex<Option<Task<()>>>,
}

impl Connector {
    /// Registers the process with the hub and starts the listener
    pub fn new<S: Into<String>>(
        process_id: S,
        api: Arc<dyn ApiTarget>,
        hub: SharedHub,
    ) -> Result<Self> {
        let process_id = process_id.into();
        hub.register_process(&process_id)?;
        let shared = Arc::new(ConnectorShared {
            process_id: process_id.clone(),
            callbacks: Mutex::new(BTreeMap::new()),
            alive: AtomicBool::new(true),
            next_subscription: AtomicU64::new(0),
        });
        let listener = {
            let shared = shared.clone();
            let hub = hub.clone();
            Builder::new()
                .name(format!("lst_{}", process_id))
                .spawn(move || listen(&shared, &api, &hub))?
        };
        Ok(Self {
            hub,
            shared,
            listener: Mutex::new(Some(listener)),
        })
    }
    /// The process id this connector serves
    pub fn process_id(&self) -> &str {
        &self.shared.process_id
    }
    /// Subscribes a callback to an event. The hub starts buffering the
    /// event for this process on the first local subscriber.
    pub fn subscribe<F>(&self, event: Event, callback: F) -> SubscriptionId
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared
            .callbacks
            .lock()
            .entry(event)
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        self.hub.subscribe(&self.shared.process_id, event);
        SubscriptionId(id)
    }
    /// Subscribes a callback which declares the parameter names it
    /// consumes; the declaration must be a subset of the event's contract.
    pub fn subscribe_filtered<F>(
        &self,
        event: Event,
        params: &[&str],
        callback: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        let allowed = event.params();
        if let Some(unknown) = params.iter().copied().find(|p| !allowed.contains(p)) {
            return Err(Error::subscription(
                SubscriptionError::BadSignature,
                format!(
                    "event '{}' has no parameter '{}', expected a subset of {:?}",
                    event, unknown, allowed
                ),
            ));
        }
        Ok(self.subscribe(event, callback))
    }
    /// Drops one local subscriber; the hub stops buffering the event for
    /// this process when the last one leaves. Idempotent.
    pub fn unsubscribe(&self, event: Event, subscription: SubscriptionId) {
        let mut callbacks = self.shared.callbacks.lock();
        if let Some(subscribers) = callbacks.get_mut(&event) {
            subscribers.retain(|s| s.id != subscription.0);
            if subscribers.is_empty() {
                callbacks.remove(&event);
                self.hub.unsubscribe(&self.shared.process_id, event);
            }
        }
    }
    /// Publishes an event to every subscribed process
    pub fn trigger(&self, event: Event, record: EventRecord) {
        self.hub.trigger(event, record);
    }
    /// Stops the listener and waits for it to observe the flag. Pending
    /// hub slots are not drained.
    pub fn close(&self) {
        self.shared.alive.store(false, Ordering::Relaxed);
        if let Some(listener) = self.listener.lock().take() {
            if listener.join().is_err() {
                error!(
                    process = %self.shared.process_id,
                    "connector listener panicked"
                );
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

fn listen(shared: &Arc<ConnectorShared>, api: &Arc<dyn ApiTarget>, hub: &SharedHub) {
    let process_id = shared.process_id.clone();
    while shared.alive.load(Ordering::Relaxed) {
        let mut busy = false;
        let subscribed: Vec<Event> = shared.callbacks.lock().keys().copied().collect();
        for event in subscribed {
            for record in hub.get_events(&process_id, event) {
                busy = true;
                let subscribers: Vec<EventCallback> = shared
                    .callbacks
                    .lock()
                    .get(&event)
                    .map(|subs| subs.iter().map(|s| s.callback.clone()).collect())
                    .unwrap_or_default();
                for callback in subscribers {
                    deliver(&process_id, event, record.clone(), callback);
                }
            }
        }
        if let Some(request) = hub.get_call(&process_id) {
            busy = true;
            let reply = api.dispatch(request);
            hub.set_response(&process_id, reply);
        }
        if !busy {
            thread::sleep(IDLE_SLEEP);
        }
    }
}

/// Events are fire-and-forget: each posting goes to each subscriber on a
/// short-lived thread and subscriber failures are logged, never propagated
fn deliver(process_id: &str, event: Event, record: EventRecord, callback: EventCallback) {
    let spawned = Builder::new().name(format!("ev_{}", event)).spawn({
        let process_id = process_id.to_owned();
        move || {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
                error!(process = %process_id, event = %event, "event callback panicked");
            }
        }
    });
    if let Err(e) = spawned {
        error!(process = %process_id, event = %event, error = %e, "event delivery failed");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payload::{HubValue, Request};
    use crate::{ErrorKind, TransportError};
    use std::sync::atomic::AtomicUsize;

    struct Arith;

    impl ApiTarget for Arith {
        fn dispatch(&self, request: Request) -> Result<HubValue> {
            match request.method.as_str() {
                "mul" => {
                    let a = request.args[0].as_i64().unwrap_or(0);
                    let b = request.args[1].as_i64().unwrap_or(0);
                    Ok(HubValue::from(a * b))
                }
                other => Err(Error::transport(
                    TransportError::UnknownMethod,
                    format!("no method '{}' on this target", other),
                )),
            }
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_request_dispatch_round_trip() {
        let hub = SharedHub::new();
        let connector = Connector::new("P1", Arc::new(Arith), hub.clone()).unwrap();
        let reply = hub
            .call("P1", Request::new("mul").arg(6).arg(7))
            .unwrap();
        assert_eq!(reply.as_i64(), Some(42));
        let err = hub.call("P1", Request::new("nope")).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::Transport(TransportError::UnknownMethod)
        );
        connector.close();
    }

    #[test]
    fn test_event_delivery_and_unsubscribe() {
        let hub = SharedHub::new();
        let connector = Connector::new("P1", Arc::new(Arith), hub.clone()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = {
            let seen = seen.clone();
            connector.subscribe(Event::WorkerStarted, move |record| {
                assert_eq!(record.process_id(), Some("P3"));
                assert_eq!(record.worker_id(), Some("w1"));
                seen.fetch_add(1, Ordering::Relaxed);
            })
        };
        connector.trigger(Event::WorkerStarted, EventRecord::worker("P3", "w1"));
        wait_for(|| seen.load(Ordering::Relaxed) == 1);
        connector.unsubscribe(Event::WorkerStarted, sub);
        // the hub no longer buffers for this process
        connector.trigger(Event::WorkerStarted, EventRecord::worker("P3", "w1"));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
        connector.close();
        hub.clear_process("P1").unwrap();
        assert!(!hub.has_process_state("P1"));
    }

    #[test]
    fn test_filtered_subscription_signature_check() {
        let hub = SharedHub::new();
        let connector = Connector::new("P1", Arc::new(Arith), hub).unwrap();
        let err = connector
            .subscribe_filtered(Event::ProcessCreated, &["worker_id"], |_| {})
            .unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::Subscription(SubscriptionError::BadSignature)
        );
        connector
            .subscribe_filtered(Event::WorkerAdded, &["process_id", "worker_id"], |_| {})
            .unwrap();
        connector.close();
    }

    #[test]
    fn test_panicking_callback_does_not_stop_the_listener() {
        let hub = SharedHub::new();
        let connector = Connector::new("P1", Arc::new(Arith), hub.clone()).unwrap();
        connector.subscribe(Event::ProcessClosed, |_| panic!("subscriber bug"));
        connector.trigger(Event::ProcessClosed, EventRecord::process("P9"));
        thread::sleep(Duration::from_millis(20));
        let reply = hub.call("P1", Request::new("mul").arg(2).arg(3)).unwrap();
        assert_eq!(reply.as_i64(), Some(6));
        connector.close();
    }
}
