//! Single PV access, always holding the latest value

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::{select, time::Instant};
use tracing::debug;

use crate::{
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrValue},
    event::{Event, Timeout},
    monitor::Monitor,
    sources::{Request, SourceError, SubscriptionSource, Update},
    utils::get_default_pv_timeout,
};

#[derive(Debug, Error)]
pub enum PvError {
    #[error("Timed out waiting for an update from {0}")]
    Timeout(String),
    #[error("The monitor on {0} has been closed")]
    Closed(String),
    #[error("A PV array needs at least one PV")]
    EmptyArray,
    #[error("Expected {expected} values to write, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Callback run after every update to a [`Pv`]
pub type PvListener = Arc<dyn Fn(&PvState) + Send + Sync>;

/// The cached state of a single PV, shared with its monitor
pub struct PvState {
    name: String,
    latest: Mutex<Option<Update>>,
    event: Event<Update>,
    on_update: Mutex<Option<PvListener>>,
}

impl PvState {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The most recent report, or None if nothing has arrived yet
    pub fn latest(&self) -> Option<Update> {
        self.latest.lock().unwrap().clone()
    }

    /// The most recent value, if there is one and it is valid
    pub fn value(&self) -> Option<Dbr> {
        self.latest().flatten()
    }

    /// Whether the most recent report was valid data
    pub fn ok(&self) -> bool {
        matches!(*self.latest.lock().unwrap(), Some(Some(_)))
    }

    fn on_update(&self, update: Update) {
        *self.latest.lock().unwrap() = Some(update.clone());
        self.event.signal(update);
        // Don't hold the lock whilst calling out, the listener may replace itself
        let listener = self.on_update.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener(self);
        }
    }
}

/// Wraps access to a single PV as a persistent object.
///
/// The latest value is kept up to date by a monitor for as long as the `Pv` exists.
/// Dropping it, or calling [`Pv::close`], ends the subscription.
pub struct Pv<S: SubscriptionSource> {
    state: Arc<PvState>,
    monitor: Monitor,
    source: S,
    request: Request,
    /// Timeout for the first get, fixed when the PV is connected
    deadline: Timeout,
}

impl<S: SubscriptionSource> Pv<S> {
    /// Connect to a PV with default options
    pub async fn connect(source: S, name: &str) -> Result<Pv<S>, PvError> {
        PvBuilder::new(name).connect(source).await
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Returns the current value.
    ///
    /// If no update has arrived yet, waits for one until the deadline set when the PV
    /// was connected. A PV reported as disconnected gives `Ok(None)`.
    pub async fn get(&self) -> Result<Update, PvError> {
        match self.state.latest() {
            Some(update) => Ok(update),
            None => self.get_next(self.deadline, false).await,
        }
    }

    /// Returns the value of the last update, or waits for the next one.
    ///
    /// This only waits if nothing has arrived since the last [`Pv::reset`]; pass
    /// `reset = true` to always wait for an update newer than this call. Fails with
    /// [`PvError::Closed`] if the monitor ends with nothing left to return.
    pub async fn get_next(&self, timeout: impl Into<Timeout>, reset: bool) -> Result<Update, PvError> {
        if reset {
            self.reset();
        }
        select! {
            biased;
            update = self.state.event.wait(timeout) => {
                update.map_err(|_| PvError::Timeout(self.name().to_owned()))
            }
            _ = self.monitor.closed() => Err(PvError::Closed(self.name().to_owned())),
        }
    }

    /// Ensures that [`Pv::get_next`] will wait until an update occurs
    pub fn reset(&self) {
        self.state.event.reset();
    }

    /// The latest report, without waiting
    pub fn latest(&self) -> Option<Update> {
        self.state.latest()
    }

    pub fn ok(&self) -> bool {
        self.state.ok()
    }

    /// Replace the callback run after each update
    pub fn set_on_update(&self, listener: impl Fn(&PvState) + Send + Sync + 'static) {
        *self.state.on_update.lock().unwrap() = Some(Arc::new(listener));
    }

    /// Write a value to the PV through the source
    pub async fn put(&self, value: impl Into<DbrValue>) -> Result<(), PvError> {
        Ok(self.source.write(self.name(), value.into()).await?)
    }

    /// Read the PV directly from the source, bypassing the cache
    pub async fn caget(&self) -> Result<Dbr, PvError> {
        Ok(self.source.read(self.name(), self.request).await?)
    }

    /// Stop monitoring. Safe to call more than once.
    pub fn close(&self) {
        self.monitor.close();
    }

    pub fn is_closed(&self) -> bool {
        self.monitor.is_closed()
    }
}

/// Configure and connect a [`Pv`]
pub struct PvBuilder {
    name: String,
    timeout: Duration,
    request: Request,
    on_update: Option<PvListener>,
}

impl PvBuilder {
    pub fn new(name: &str) -> Self {
        PvBuilder {
            name: name.to_owned(),
            timeout: get_default_pv_timeout(),
            request: Request::default(),
            on_update: None,
        }
    }
    /// How long the first [`Pv::get`] waits for a value
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    /// Ask for values converted to this type
    pub fn data_type(mut self, data_type: DbrBasicType) -> Self {
        self.request.data_type = Some(data_type);
        self
    }
    /// Ask for a fixed number of elements
    pub fn count(mut self, count: usize) -> Self {
        self.request.count = count;
        self
    }
    pub fn category(mut self, category: DbrCategory) -> Self {
        self.request.category = category;
        self
    }
    /// Deliver disconnections as updates; otherwise the last value is kept
    pub fn notify_disconnect(mut self, notify: bool) -> Self {
        self.request.notify_disconnect = notify;
        self
    }
    pub fn on_update(mut self, listener: impl Fn(&PvState) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(listener));
        self
    }

    pub async fn connect<S: SubscriptionSource>(self, source: S) -> Result<Pv<S>, PvError> {
        let state = Arc::new(PvState {
            name: self.name,
            latest: Mutex::new(None),
            event: Event::new(),
            on_update: Mutex::new(self.on_update),
        });
        let feed = source.subscribe(&state.name, self.request).await?;
        let monitor = Monitor::spawn(feed, Arc::downgrade(&state), PvState::on_update);
        debug!("Connected PV {}", state.name);
        let deadline = Instant::now()
            .checked_add(self.timeout)
            .map(Timeout::At)
            .unwrap_or(Timeout::Never);
        Ok(Pv {
            state,
            monitor,
            source,
            request: self.request,
            deadline,
        })
    }
}
