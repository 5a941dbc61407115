//! Background delivery of monitor updates into a cache

use std::sync::Weak;

use tokio::select;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, debug_span, trace};

use crate::sources::{MonitorFeed, Update};

/// Owning handle to a running monitor.
///
/// The delivery task only holds a weak reference to its target, so dropping the
/// owner of the target (and with it this handle) ends the subscription. The handle
/// counts as closed once either side has ended: an explicit close, or the source
/// closing the feed.
#[derive(Debug)]
pub(crate) struct Monitor {
    name: String,
    cancel: CancellationToken,
}

impl Monitor {
    /// Deliver every update from `feed` to `target` for as long as it is alive
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn<X, F>(mut feed: MonitorFeed, target: Weak<X>, deliver: F) -> Monitor
    where
        X: Send + Sync + 'static,
        F: Fn(&X, Update) + Send + 'static,
    {
        let name = feed.name().to_owned();
        let cancel = CancellationToken::new();
        let inner_cancel = cancel.clone();
        let inner_name = name.clone();
        tokio::spawn(async move {
            loop {
                let update = select! {
                    _ = inner_cancel.cancelled() => break,
                    update = feed.recv() => match update {
                        Some(update) => update,
                        None => {
                            debug!("Source closed the monitor on {inner_name}");
                            break;
                        }
                    },
                };
                let Some(target) = target.upgrade() else {
                    debug!("Owner of monitor on {inner_name} has gone; stopping");
                    break;
                };
                let _span = debug_span!("deliver", pv = %inner_name).entered();
                trace!("Delivering update: {update:?}");
                deliver(&target, update);
            }
            // Dropping the feed here releases the subscription
            inner_cancel.cancel();
            trace!("Monitor task for {inner_name} finished");
        });
        Monitor { name, cancel }
    }

    /// Stop delivering updates. Only the first call has any effect.
    pub(crate) fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Closing monitor on {}", self.name);
            self.cancel.cancel();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the monitor has closed, from either end
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tokio::sync::broadcast;

    use super::*;
    use crate::{
        dbr::{Dbr, DbrValue},
        sources::Request,
    };

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<Update>>,
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_until_closed() {
        let (tx, rx) = broadcast::channel(4);
        let collector = Arc::new(Collector::default());
        let feed = MonitorFeed::new("TEST", Request::default(), None, rx);
        let monitor = Monitor::spawn(feed, Arc::downgrade(&collector), |c: &Collector, u| {
            c.seen.lock().unwrap().push(u)
        });
        tx.send(Some(Dbr::Basic(DbrValue::Int(vec![1])))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(collector.seen.lock().unwrap().len(), 1);

        monitor.close();
        monitor.close();
        assert!(monitor.is_closed());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tx.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_target_dropped() {
        let (tx, rx) = broadcast::channel(4);
        let collector = Arc::new(Collector::default());
        let feed = MonitorFeed::new("TEST", Request::default(), None, rx);
        let _monitor = Monitor::spawn(feed, Arc::downgrade(&collector), |c: &Collector, u| {
            c.seen.lock().unwrap().push(u)
        });
        drop(collector);
        tx.send(Some(Dbr::Basic(DbrValue::Int(vec![1])))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tx.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closes_when_feed_ends() {
        let (tx, rx) = broadcast::channel::<Update>(4);
        let collector = Arc::new(Collector::default());
        let feed = MonitorFeed::new("TEST", Request::default(), None, rx);
        let monitor = Monitor::spawn(feed, Arc::downgrade(&collector), |c: &Collector, u| {
            c.seen.lock().unwrap().push(u)
        });
        assert!(!monitor.is_closed());
        drop(tx);
        monitor.closed().await;
        assert!(monitor.is_closed());
        // Closing afterwards is harmless
        monitor.close();
    }
}
