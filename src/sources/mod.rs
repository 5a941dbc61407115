//! Interface between the PV caches and whatever delivers values to them
//!
//! A [`SubscriptionSource`] is usually a CA client, but can be anything that can look
//! up a PV by name, feed its updates, and read or write it on request. The built-in
//! [`IntercomSource`] serves PVs held in-process.

pub mod intercom;
pub use intercom::IntercomSource;

use std::future::Future;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::dbr::{ConvertError, Dbr, DbrBasicType, DbrCategory, DbrType};

/// A single report delivered by a monitor.
///
/// `None` reports that the PV disconnected, or otherwise has no valid data.
pub type Update = Option<Dbr>;

/// Errors a source can report for subscriptions, reads and writes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Could not find PV '{0}'")]
    NotFound(String),
    #[error("PV '{0}' is not connected")]
    Disconnected(String),
    #[error("Timed out accessing PV '{0}'")]
    Timeout(String),
    #[error("{0}")]
    NoConvert(#[from] ConvertError),
    #[error("Could not interpret written value '{0}'")]
    InvalidValue(String),
    #[error("No write access to PV '{0}'")]
    NoWriteAccess(String),
    #[error("The source is closed")]
    Closed,
}

/// What a monitor or read asks the source for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Basic type to convert values to. `None` for the native type of the PV.
    pub data_type: Option<DbrBasicType>,
    /// Number of elements to deliver. `0` for the native length.
    pub count: usize,
    /// Which metadata to attach
    pub category: DbrCategory,
    /// Whether monitors deliver disconnection reports, or silently skip them
    pub notify_disconnect: bool,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            data_type: None,
            count: 0,
            category: DbrCategory::Time,
            notify_disconnect: false,
        }
    }
}

impl Request {
    /// Shape a native value into what this request asked for
    pub fn apply(&self, dbr: &Dbr) -> Result<Dbr, ConvertError> {
        let basic_type = self.data_type.unwrap_or_else(|| dbr.value().get_type());
        let mut shaped = dbr.convert_to(DbrType::new(basic_type, self.category))?;
        if self.count > 0 {
            // Enums are always a single element, so there is nothing to resize
            let _ = shaped.value_mut().resize(self.count);
        }
        Ok(shaped)
    }
}

/// The stream of updates for one monitored PV.
///
/// Dropping the feed releases the subscription.
#[derive(Debug)]
pub struct MonitorFeed {
    name: String,
    request: Request,
    initial: Option<Update>,
    updates: broadcast::Receiver<Update>,
}

impl MonitorFeed {
    /// Wrap a broadcast of native updates.
    ///
    /// `initial` is delivered before anything from `updates`, if present; sources
    /// pass the current value here for PVs that are already connected.
    pub fn new(
        name: &str,
        request: Request,
        initial: Option<Update>,
        updates: broadcast::Receiver<Update>,
    ) -> Self {
        MonitorFeed {
            name: name.to_owned(),
            request,
            initial,
            updates,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next update, shaped to the request.
    ///
    /// Returns `None` once the source has closed the feed. Values that cannot be
    /// converted to the requested type are reported as invalid (`Some(None)`).
    pub async fn recv(&mut self) -> Option<Update> {
        loop {
            let update = match self.initial.take() {
                Some(update) => update,
                None => match self.updates.recv().await {
                    Ok(update) => update,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Monitor on {} fell behind, skipped {n} updates", self.name);
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                },
            };
            let Some(dbr) = update else {
                if self.request.notify_disconnect {
                    return Some(None);
                }
                continue;
            };
            return Some(match self.request.apply(&dbr) {
                Ok(shaped) => Some(shaped),
                Err(e) => {
                    warn!("Could not shape update for {}: {e}", self.name);
                    None
                }
            });
        }
    }
}

/// Provides PV subscriptions, reads and writes to the caches
///
/// Implementations are cheap handles onto shared state, cloned into each cache that
/// uses them.
pub trait SubscriptionSource: Clone + Send + Sync + 'static {
    /// Start monitoring a PV.
    ///
    /// Fails if the PV cannot be found. Once connected, the feed delivers the
    /// current value first, and then every subsequent change in order.
    fn subscribe(
        &self,
        name: &str,
        request: Request,
    ) -> impl Future<Output = Result<MonitorFeed, SourceError>> + Send;

    /// Fetch the current value of a PV
    fn read(
        &self,
        name: &str,
        request: Request,
    ) -> impl Future<Output = Result<Dbr, SourceError>> + Send;

    /// Write a new value to a PV
    fn write(
        &self,
        name: &str,
        value: crate::dbr::DbrValue,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;
}
