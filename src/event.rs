//! A single-slot signal that tasks can wait on.
//!
//! An [`Event`] holds at most one value. [`Event::signal`] stores a value and wakes
//! every task currently waiting; the value stays in the slot so that later waits
//! return immediately, until [`Event::reset`] empties it again.

use std::{sync::Mutex, time::Duration};

use thiserror::Error;
use tokio::{sync::Notify, time::Instant};

/// How long a wait may last before giving up
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait forever
    #[default]
    Never,
    /// Wait for a duration counted from the start of the wait
    After(Duration),
    /// Wait until a fixed point in time
    At(Instant),
}

impl Timeout {
    /// The absolute deadline this represents, if any, relative to now
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Never => None,
            Timeout::After(duration) => Some(Instant::now() + duration),
            Timeout::At(instant) => Some(instant),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        Timeout::After(value)
    }
}

impl From<Instant> for Timeout {
    fn from(value: Instant) -> Self {
        Timeout::At(value)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(value: Option<Duration>) -> Self {
        value.map(Timeout::After).unwrap_or(Timeout::Never)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Timed out waiting for event")]
pub struct WaitTimeout;

/// Single-slot wait/notify primitive
#[derive(Debug)]
pub struct Event<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Event {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

impl<T: Clone> Event<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value and wake everything currently waiting
    pub fn signal(&self, value: T) {
        *self.slot.lock().unwrap() = Some(value);
        self.notify.notify_waiters();
    }

    /// Empty the slot, so that the next wait blocks until a new signal
    pub fn reset(&self) {
        *self.slot.lock().unwrap() = None;
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Wait until the event holds a value, and return a copy of it.
    ///
    /// If a value is already present this returns immediately, even with a zero
    /// timeout.
    pub async fn wait(&self, timeout: impl Into<Timeout>) -> Result<T, WaitTimeout> {
        let deadline = timeout.into().deadline();
        let wait = async {
            loop {
                // Register interest before checking, so a signal between the check
                // and the await is not lost
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let current = self.slot.lock().unwrap().clone();
                if let Some(value) = current {
                    return value;
                }
                notified.await;
            }
        };
        match deadline {
            None => Ok(wait.await),
            Some(deadline) => tokio::time::timeout_at(deadline, wait)
                .await
                .map_err(|_| WaitTimeout),
        }
    }
}
