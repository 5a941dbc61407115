//! Access to a list of PVs as a single waveform

use std::{
    fmt::Debug,
    ops::Index,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::time::timeout_at;
use tracing::{debug, warn};

use crate::{
    dbr::{ConvertError, Dbr, DbrCategory, DbrValue, IntoDbrBasicType},
    event::Timeout,
    monitor::Monitor,
    pv::PvError,
    sources::{Request, SubscriptionSource, Update},
};

/// Element types a [`PvArray`] can hold
pub trait ArrayElement: Clone + Default + Debug + Send + Sync + IntoDbrBasicType + 'static {
    fn from_dbr_value(value: &DbrValue) -> Result<Vec<Self>, ConvertError>;
    fn into_dbr_value(values: Vec<Self>) -> DbrValue;
}

macro_rules! impl_array_element {
    ($($typ:ty),*) => {
        $(
            impl ArrayElement for $typ {
                fn from_dbr_value(value: &DbrValue) -> Result<Vec<Self>, ConvertError> {
                    Vec::<$typ>::try_from(value)
                }
                fn into_dbr_value(values: Vec<Self>) -> DbrValue {
                    values.into()
                }
            }
        )*
    };
}
impl_array_element!(i8, i16, i32, f32, f64, String);

/// A copy of the values held by a [`PvArray`].
///
/// With a count of 1 this is one value per PV. Otherwise each PV has a row of
/// `count` elements, stored contiguously.
#[derive(Clone, Debug, PartialEq)]
pub struct ArraySnapshot<T> {
    data: Vec<T>,
    count: usize,
}

impl<T> ArraySnapshot<T> {
    /// Number of PVs
    pub fn len(&self) -> usize {
        self.data.len() / self.count
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    /// Number of elements per PV
    pub fn count(&self) -> usize {
        self.count
    }
    /// `[N]` for scalar PVs, `[N, count]` otherwise
    pub fn shape(&self) -> Vec<usize> {
        if self.count == 1 {
            vec![self.len()]
        } else {
            vec![self.len(), self.count]
        }
    }
    /// The elements belonging to a single PV
    pub fn row(&self, index: usize) -> &[T] {
        &self.data[index * self.count..(index + 1) * self.count]
    }
    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks(self.count)
    }
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

/// Indexes the flattened data
impl<T> Index<usize> for ArraySnapshot<T> {
    type Output = T;
    fn index(&self, index: usize) -> &T {
        &self.data[index]
    }
}

#[derive(Debug)]
struct Slots<T> {
    count: usize,
    values: Vec<T>,
    seen: Vec<bool>,
    ok: Vec<bool>,
    timestamp: Vec<SystemTime>,
    severity: Vec<i16>,
    status: Vec<i16>,
}

impl<T: ArrayElement> Slots<T> {
    fn new(len: usize, count: usize) -> Self {
        Slots {
            count,
            values: vec![T::default(); len * count],
            seen: vec![false; len],
            ok: vec![false; len],
            timestamp: vec![UNIX_EPOCH; len],
            severity: vec![0; len],
            status: vec![0; len],
        }
    }

    /// Apply a report to one slot. Invalid reports leave the last good data in place.
    fn update_one(&mut self, index: usize, update: Update) {
        self.seen[index] = true;
        let Some(dbr) = update else {
            self.ok[index] = false;
            return;
        };
        let mut row = match T::from_dbr_value(dbr.value()) {
            Ok(row) => row,
            Err(e) => {
                warn!("Discarding update for slot {index}: {e}");
                self.ok[index] = false;
                return;
            }
        };
        row.resize(self.count, T::default());
        self.values[index * self.count..(index + 1) * self.count].clone_from_slice(&row);
        let status = dbr.status().unwrap_or_default();
        self.ok[index] = true;
        self.timestamp[index] = dbr.timestamp().unwrap_or_else(SystemTime::now);
        self.severity[index] = status.severity;
        self.status[index] = status.status;
    }
}

/// Callback run after an update to one slot of a [`PvArray`]
pub type ArrayListener<T> = Arc<dyn Fn(&ArrayState<T>, usize) + Send + Sync>;

/// The cached state of every PV in a [`PvArray`], shared with its monitors
pub struct ArrayState<T> {
    names: Vec<String>,
    slots: Mutex<Slots<T>>,
    on_update: Mutex<Option<ArrayListener<T>>>,
}

impl<T: ArrayElement> ArrayState<T> {
    pub fn names(&self) -> &[String] {
        &self.names
    }
    pub fn len(&self) -> usize {
        self.names.len()
    }
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
    pub fn count(&self) -> usize {
        self.slots.lock().unwrap().count
    }
    /// Copy of the current values. Slots never updated hold default values.
    pub fn get(&self) -> ArraySnapshot<T> {
        let slots = self.slots.lock().unwrap();
        ArraySnapshot {
            data: slots.values.clone(),
            count: slots.count,
        }
    }
    /// Which slots have had at least one report
    pub fn seen(&self) -> Vec<bool> {
        self.slots.lock().unwrap().seen.clone()
    }
    /// Which slots currently hold valid data
    pub fn ok(&self) -> Vec<bool> {
        self.slots.lock().unwrap().ok.clone()
    }
    pub fn timestamp(&self) -> Vec<SystemTime> {
        self.slots.lock().unwrap().timestamp.clone()
    }
    pub fn severity(&self) -> Vec<i16> {
        self.slots.lock().unwrap().severity.clone()
    }
    pub fn status(&self) -> Vec<i16> {
        self.slots.lock().unwrap().status.clone()
    }
    pub fn all_ok(&self) -> bool {
        self.slots.lock().unwrap().ok.iter().all(|ok| *ok)
    }

    fn on_update(&self, index: usize, update: Update) {
        self.slots.lock().unwrap().update_one(index, update);
        let listener = self.on_update.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener(self, index);
        }
    }
}

/// Wraps a list of PVs of the same type and length as a single array.
///
/// Each PV is monitored for as long as the `PvArray` exists, with disconnections
/// reported so that [`PvArray::ok`] tracks which entries are currently valid.
pub struct PvArray<S: SubscriptionSource, T: ArrayElement> {
    state: Arc<ArrayState<T>>,
    monitors: Vec<Monitor>,
    source: S,
    request: Request,
}

impl<S: SubscriptionSource, T: ArrayElement> PvArray<S, T> {
    /// Connect to a list of PVs with default options
    pub async fn connect(source: S, names: &[&str]) -> Result<PvArray<S, T>, PvError> {
        PvArrayBuilder::new(names).connect(source).await
    }

    pub fn names(&self) -> &[String] {
        self.state.names()
    }
    pub fn len(&self) -> usize {
        self.state.len()
    }
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
    pub fn count(&self) -> usize {
        self.state.count()
    }
    pub fn get(&self) -> ArraySnapshot<T> {
        self.state.get()
    }
    pub fn seen(&self) -> Vec<bool> {
        self.state.seen()
    }
    pub fn ok(&self) -> Vec<bool> {
        self.state.ok()
    }
    pub fn timestamp(&self) -> Vec<SystemTime> {
        self.state.timestamp()
    }
    pub fn severity(&self) -> Vec<i16> {
        self.state.severity()
    }
    pub fn status(&self) -> Vec<i16> {
        self.state.status()
    }
    pub fn all_ok(&self) -> bool {
        self.state.all_ok()
    }

    /// Replace the callback run after each update
    pub fn set_on_update(&self, listener: impl Fn(&ArrayState<T>, usize) + Send + Sync + 'static) {
        *self.state.on_update.lock().unwrap() = Some(Arc::new(listener));
    }

    /// Read every PV at once, each read bounded by the same deadline
    async fn read_all(&self, timeout: impl Into<Timeout>) -> Vec<Result<Dbr, PvError>> {
        let deadline = timeout.into().deadline();
        let reads: Vec<_> = self
            .names()
            .iter()
            .map(|name| {
                let source = self.source.clone();
                let name = name.clone();
                let request = self.request;
                tokio::spawn(async move {
                    let read = source.read(&name, request);
                    match deadline {
                        None => read.await.map_err(PvError::from),
                        Some(deadline) => match timeout_at(deadline, read).await {
                            Ok(result) => result.map_err(PvError::from),
                            Err(_) => Err(PvError::Timeout(name)),
                        },
                    }
                })
            })
            .collect();
        let mut results = Vec::with_capacity(reads.len());
        for (name, read) in self.names().iter().zip(reads) {
            results.push(match read.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(PvError::Closed(name.clone())),
            });
        }
        results
    }

    /// Read all PVs directly from the source, bypassing the cache
    pub async fn caget(&self, timeout: impl Into<Timeout>) -> Result<Vec<Dbr>, PvError> {
        self.read_all(timeout).await.into_iter().collect()
    }

    /// Fill in any slots that have not yet had a monitor update with a direct read.
    ///
    /// Slots that have already been seen are never touched. If `fail_on_error` is
    /// set then any failed read is returned and no slot is changed; otherwise the
    /// slots whose read failed are marked as seen but not ok.
    pub async fn sync(&self, timeout: impl Into<Timeout>, fail_on_error: bool) -> Result<(), PvError> {
        let results = self.read_all(timeout).await;
        let updates: Vec<Update> = if fail_on_error {
            results
                .into_iter()
                .map(|result| result.map(Some))
                .collect::<Result<_, _>>()?
        } else {
            results
                .into_iter()
                .map(|result| result.inspect_err(|e| debug!("Sync read failed: {e}")).ok())
                .collect()
        };
        let mut slots = self.state.slots.lock().unwrap();
        for (index, update) in updates.into_iter().enumerate() {
            if !slots.seen[index] {
                slots.update_one(index, update);
            }
        }
        Ok(())
    }

    /// Write new values to every PV, laid out as returned by [`PvArray::get`]
    pub async fn put(&self, values: &[T]) -> Result<(), PvError> {
        let count = self.count();
        if values.len() != self.len() * count {
            return Err(PvError::LengthMismatch {
                expected: self.len() * count,
                got: values.len(),
            });
        }
        for (name, row) in self.names().iter().zip(values.chunks(count)) {
            self.source.write(name, T::into_dbr_value(row.to_vec())).await?;
        }
        Ok(())
    }

    /// Write the same value to every PV
    pub async fn put_all(&self, value: impl Into<DbrValue>) -> Result<(), PvError> {
        let value = value.into();
        for name in self.names() {
            self.source.write(name, value.clone()).await?;
        }
        Ok(())
    }

    /// Stop monitoring all PVs. Safe to call more than once.
    pub fn close(&self) {
        for monitor in &self.monitors {
            monitor.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.monitors.iter().all(Monitor::is_closed)
    }
}

/// Configure and connect a [`PvArray`]
pub struct PvArrayBuilder<T: ArrayElement> {
    names: Vec<String>,
    count: usize,
    on_update: Option<ArrayListener<T>>,
}

impl<T: ArrayElement> PvArrayBuilder<T> {
    pub fn new(names: &[&str]) -> Self {
        PvArrayBuilder {
            names: names.iter().map(|n| n.to_string()).collect(),
            count: 1,
            on_update: None,
        }
    }
    /// Number of elements to hold for each PV
    pub fn count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }
    pub fn on_update(mut self, listener: impl Fn(&ArrayState<T>, usize) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(listener));
        self
    }

    pub async fn connect<S: SubscriptionSource>(self, source: S) -> Result<PvArray<S, T>, PvError> {
        if self.names.is_empty() {
            return Err(PvError::EmptyArray);
        }
        let request = Request {
            data_type: Some(T::get_dbr_basic_type()),
            count: self.count,
            category: DbrCategory::Time,
            notify_disconnect: true,
        };
        let state = Arc::new(ArrayState {
            slots: Mutex::new(Slots::new(self.names.len(), self.count)),
            names: self.names,
            on_update: Mutex::new(self.on_update),
        });
        let mut monitors = Vec::with_capacity(state.names.len());
        for (index, name) in state.names.iter().enumerate() {
            // Monitors already started are closed on drop if this fails
            let feed = source.subscribe(name, request).await?;
            monitors.push(Monitor::spawn(
                feed,
                Arc::downgrade(&state),
                move |state: &ArrayState<T>, update| state.on_update(index, update),
            ));
        }
        debug!("Connected array of {} PVs", state.names.len());
        Ok(PvArray {
            state,
            monitors,
            source,
            request,
        })
    }
}
