use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The event catalog.
///
/// Every event declares the parameter names its callbacks may consume; the
/// bus refuses filtered subscriptions declaring anything outside that set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// A host finished launching and is listening on the hub
    ProcessCreated,
    /// A host closed and left the hub
    ProcessClosed,
    /// A worker was added to a host
    WorkerAdded,
    /// A worker was removed from a host
    WorkerRemoved,
    /// A worker was opened
    WorkerOpened,
    /// A worker was started
    WorkerStarted,
    /// A worker was stopped
    WorkerStopped,
    /// A worker was closed
    WorkerClosed,
}

impl Event {
    /// The event name on the wire
    pub fn name(self) -> &'static str {
        match self {
            Event::ProcessCreated => "process_created",
            Event::ProcessClosed => "process_closed",
            Event::WorkerAdded => "worker_added",
            Event::WorkerRemoved => "worker_removed",
            Event::WorkerOpened => "worker_opened",
            Event::WorkerStarted => "worker_started",
            Event::WorkerStopped => "worker_stopped",
            Event::WorkerClosed => "worker_closed",
        }
    }
    /// The parameter names a callback for this event may declare
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Event::ProcessCreated | Event::ProcessClosed => &["process_id"],
            _ => &["process_id", "worker_id"],
        }
    }
}

impl core::fmt::Display for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single event posting: positional arguments plus named arguments,
/// exactly as handed to `trigger`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Positional arguments
    pub args: Vec<Value>,
    /// Named arguments
    pub kwargs: BTreeMap<String, Value>,
}

impl EventRecord {
    /// Creates a posting with positional arguments only
    pub fn new<I, V>(args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            kwargs: BTreeMap::new(),
        }
    }
    /// Creates a posting for a worker event (`process_id`, `worker_id`)
    pub fn worker(process_id: &str, worker_id: &str) -> Self {
        Self::new([process_id, worker_id])
    }
    /// Creates a posting for a process event (`process_id`)
    pub fn process(process_id: &str) -> Self {
        Self::new([process_id])
    }
    /// The first positional argument as a string (the process id for every
    /// catalog event)
    pub fn process_id(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }
    /// The second positional argument as a string (the worker id for worker
    /// events)
    pub fn worker_id(&self) -> Option<&str> {
        self.args.get(1).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_catalog_params() {
        assert_eq!(Event::ProcessCreated.params(), &["process_id"]);
        assert_eq!(Event::WorkerStarted.params(), &["process_id", "worker_id"]);
        insta::assert_snapshot!(Event::WorkerStopped.name(), @"worker_stopped");
    }

    #[test]
    fn test_record_accessors() {
        let rec = EventRecord::worker("P3", "w1");
        assert_eq!(rec.process_id(), Some("P3"));
        assert_eq!(rec.worker_id(), Some("w1"));
        assert!(rec.kwargs.is_empty());
        let rec = EventRecord::process("P1");
        assert_eq!(rec.process_id(), Some("P1"));
        assert_eq!(rec.worker_id(), None);
    }
}
