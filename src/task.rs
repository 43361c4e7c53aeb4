use core::fmt;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bma_ts::Monotonic;

use crate::{Error, Result};

/// Sleep step used while waiting for a task to finish
const JOIN_POLL_STEP: Duration = Duration::from_millis(1);

/// A named-thread builder, similar to [`thread::Builder`]
#[derive(Default, Clone)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

macro_rules! impl_builder_from {
    ($t: ty) => {
        impl From<$t> for Builder {
            fn from(s: $t) -> Self {
                Builder::new().name(s)
            }
        }
    };
}

impl_builder_from!(&str);
impl_builder_from!(String);

impl Builder {
    /// Creates a new task builder
    pub fn new() -> Self {
        Self::default()
    }
    /// The task name SHOULD be 15 characters or less to set a proper thread name
    pub fn name<N: fmt::Display>(mut self, name: N) -> Self {
        self.name = Some(name.to_string());
        self
    }
    /// Overrides the default stack size
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
    /// Spawns a task
    pub fn spawn<F, T>(self, f: F) -> Result<Task<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(ref name) = self.name {
            builder = builder.name(name.clone());
        }
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(f).map_err(Error::from)?;
        Ok(Task {
            name: self.name.unwrap_or_default(),
            handle,
        })
    }
}

/// A handle to a spawned task
pub struct Task<T> {
    name: String,
    handle: JoinHandle<T>,
}

impl<T> Task<T> {
    /// The task name
    pub fn name(&self) -> &str {
        &self.name
    }
    /// True if the task has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
    /// Joins the task
    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }
    /// Waits for the task to finish within the timeout and joins it.
    /// Returns the handle back on expiry so the caller may detach or retry.
    pub fn join_within(self, timeout: Duration) -> std::result::Result<thread::Result<T>, Self> {
        let started = Monotonic::now();
        while !self.handle.is_finished() {
            if started.elapsed() >= timeout {
                return Err(self);
            }
            thread::sleep(JOIN_POLL_STEP);
        }
        Ok(self.handle.join())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_spawn_and_join() {
        let task = Builder::new().name("sum").spawn(|| 2 + 2).unwrap();
        assert_eq!(task.name(), "sum");
        assert_eq!(task.join().unwrap(), 4);
    }

    #[test]
    fn test_join_within_expiry_returns_handle() {
        let task = Builder::new()
            .name("slow")
            .spawn(|| thread::sleep(Duration::from_millis(200)))
            .unwrap();
        let task = match task.join_within(Duration::from_millis(10)) {
            Err(task) => task,
            Ok(_) => panic!("task should not have finished yet"),
        };
        task.join_within(Duration::from_secs(2)).ok().unwrap().unwrap();
    }
}
