use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::{
    dbr::{ConvertError, Dbr, DbrBasicType, DbrValue, IntoDbrBasicType, Status},
    sources::{MonitorFeed, Request, SourceError, SubscriptionSource, Update},
    utils::get_default_monitor_capacity,
};

#[derive(Debug)]
struct PV {
    name: String,
    /// The type values are stored as, whatever they are written as
    native_type: DbrBasicType,
    /// The current value, or None whilst disconnected
    value: Option<DbrValue>,
    status: Status,
    /// The last time this value was written
    timestamp: SystemTime,
    /// Channel to send updates to any interested monitors
    sender: broadcast::Sender<Update>,
}

impl PV {
    fn new(name: &str, native_type: DbrBasicType, capacity: usize) -> Self {
        PV {
            name: name.to_owned(),
            native_type,
            value: None,
            status: Status::default(),
            timestamp: SystemTime::now(),
            sender: broadcast::Sender::new(capacity),
        }
    }

    fn load(&self) -> Update {
        self.value.clone().map(|value| Dbr::Time {
            status: self.status,
            timestamp: self.timestamp,
            value,
        })
    }

    fn publish(&self) {
        // Nobody listening is not an error
        let _ = self.sender.send(self.load());
    }

    fn store(&mut self, value: &DbrValue) -> Result<(), ConvertError> {
        self.value = Some(value.convert_to(self.native_type)?);
        self.timestamp = SystemTime::now();
        self.publish();
        Ok(())
    }

    /// Store a value written by a client of the source
    ///
    /// Clients often write numbers as strings, so these are parsed to the native type
    fn store_from_client(&mut self, value: &DbrValue) -> Result<(), SourceError> {
        let value = if value.get_type() == DbrBasicType::String {
            value
                .parse_into(self.native_type)
                .map_err(|_| SourceError::InvalidValue(value.to_string()))?
        } else {
            value.clone()
        };
        Ok(self.store(&value)?)
    }

    fn disconnect(&mut self) {
        if self.value.take().is_some() {
            debug!("Intercom: {} disconnected", self.name);
            self.publish();
        }
    }

    fn set_alarm(&mut self, status: Status) {
        self.status = status;
        if self.value.is_some() {
            self.publish();
        }
    }
}

/// Typed handle to drive a single PV served by an [`IntercomSource`]
#[derive(Clone, Debug)]
pub struct Intercom<T>
where
    T: TryFrom<DbrValue>,
    DbrValue: From<T>,
{
    pv: Arc<Mutex<PV>>,
    _marker: PhantomData<T>,
}

impl<T> Intercom<T>
where
    T: TryFrom<DbrValue>,
    DbrValue: From<T>,
{
    fn new(pv: Arc<Mutex<PV>>) -> Self {
        Self {
            pv,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> String {
        self.pv.lock().unwrap().name.clone()
    }

    /// The current value, or None if disconnected
    pub fn load(&self) -> Option<T> {
        let value = self.pv.lock().unwrap().value.clone()?;
        value.try_into().ok()
    }

    /// Set a new value, (re)connecting the PV if needed
    pub fn store(&self, value: T) {
        self.pv
            .lock()
            .unwrap()
            .store(&value.into())
            .expect("Native type of an Intercom always matches T");
    }

    /// Drop the value, so that monitors see a disconnection and reads fail
    pub fn disconnect(&self) {
        self.pv.lock().unwrap().disconnect();
    }

    /// Change the alarm status attached to the value
    pub fn set_alarm(&self, status: Status) {
        self.pv.lock().unwrap().set_alarm(status);
    }
}

#[derive(Debug)]
pub struct PVAlreadyExists;

/// Serves PVs held in-process.
///
/// Values are driven through [`Intercom`] handles, and seen by anything using the
/// source through the [`SubscriptionSource`] interface. Clones share the same PVs.
#[derive(Clone)]
pub struct IntercomSource {
    pvs: Arc<Mutex<HashMap<String, Arc<Mutex<PV>>>>>,
    capacity: usize,
}

impl Default for IntercomSource {
    fn default() -> Self {
        IntercomSource {
            pvs: Default::default(),
            capacity: get_default_monitor_capacity(),
        }
    }
}

impl IntercomSource {
    pub fn new() -> IntercomSource {
        IntercomSource::default()
    }

    /// Use a specific depth for the update queue of each PV
    pub fn with_capacity(capacity: usize) -> IntercomSource {
        IntercomSource {
            capacity: capacity.max(1),
            ..Default::default()
        }
    }

    fn register_pv(&self, pv: PV) -> Result<Arc<Mutex<PV>>, PVAlreadyExists> {
        let mut pvmap = self.pvs.lock().unwrap();
        if pvmap.contains_key(&pv.name) {
            return Err(PVAlreadyExists);
        }
        let name = pv.name.clone();
        let pv = Arc::new(Mutex::new(pv));
        pvmap.insert(name, pv.clone());
        Ok(pv)
    }

    /// Add a new PV, connected with an initial value
    pub fn add_pv<T>(&self, name: &str, initial_value: T) -> Result<Intercom<T>, PVAlreadyExists>
    where
        T: TryFrom<DbrValue>,
        DbrValue: From<T>,
    {
        let value = DbrValue::from(initial_value);
        let mut pv = PV::new(name, value.get_type(), self.capacity);
        pv.value = Some(value);
        Ok(Intercom::new(self.register_pv(pv)?))
    }

    /// Add a new PV that exists, but has no value until first stored
    pub fn add_unconnected_pv<T>(&self, name: &str) -> Result<Intercom<T>, PVAlreadyExists>
    where
        T: TryFrom<DbrValue> + IntoDbrBasicType,
        DbrValue: From<T>,
    {
        let pv = PV::new(name, T::get_dbr_basic_type(), self.capacity);
        Ok(Intercom::new(self.register_pv(pv)?))
    }

    /// How many monitors are currently attached to a PV
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.pvs
            .lock()
            .unwrap()
            .get(name)
            .map(|pv| pv.lock().unwrap().sender.receiver_count())
            .unwrap_or(0)
    }

    fn get_pv(&self, name: &str) -> Result<Arc<Mutex<PV>>, SourceError> {
        self.pvs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(name.to_owned()))
    }
}

impl SubscriptionSource for IntercomSource {
    async fn subscribe(&self, name: &str, request: Request) -> Result<MonitorFeed, SourceError> {
        let pv = self.get_pv(name)?;
        let pv = pv.lock().unwrap();
        debug!("Intercom: New monitor on {name}");
        // Unconnected PVs have nothing to report until they first get a value
        let initial = pv.value.is_some().then(|| pv.load());
        Ok(MonitorFeed::new(name, request, initial, pv.sender.subscribe()))
    }

    async fn read(&self, name: &str, request: Request) -> Result<Dbr, SourceError> {
        let current = self.get_pv(name)?.lock().unwrap().load();
        let dbr = current.ok_or_else(|| SourceError::Disconnected(name.to_owned()))?;
        Ok(request.apply(&dbr)?)
    }

    async fn write(&self, name: &str, value: DbrValue) -> Result<(), SourceError> {
        let pv = self.get_pv(name)?;
        let mut pv = pv.lock().unwrap();
        debug!("Intercom: Processing write to {name}: {value:?}");
        pv.store_from_client(&value).inspect_err(|e| error!("    Error: {e}"))
    }
}
