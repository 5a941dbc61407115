use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, UNIX_EPOCH},
};

use epicars_pv::{
    PvArray, PvArrayBuilder, PvError,
    dbr::{Dbr, DbrValue, Status},
    sources::{IntercomSource, MonitorFeed, Request, SourceError, SubscriptionSource},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn reading(value: f64, severity: i16) -> Dbr {
    Dbr::Time {
        status: Status {
            status: 1,
            severity,
        },
        timestamp: UNIX_EPOCH + Duration::from_secs(1000),
        value: value.into(),
    }
}

/// Monitors come from an intercom, but reads are scripted
#[derive(Clone, Default)]
struct FakeSource {
    monitors: IntercomSource,
    reads: Arc<Mutex<HashMap<String, Result<Dbr, SourceError>>>>,
    read_delay: Duration,
}

impl FakeSource {
    fn set_read(&self, name: &str, result: Result<Dbr, SourceError>) {
        self.reads.lock().unwrap().insert(name.to_owned(), result);
    }
}

impl SubscriptionSource for FakeSource {
    async fn subscribe(&self, name: &str, request: Request) -> Result<MonitorFeed, SourceError> {
        self.monitors.subscribe(name, request).await
    }
    async fn read(&self, name: &str, request: Request) -> Result<Dbr, SourceError> {
        tokio::time::sleep(self.read_delay).await;
        let result = self
            .reads
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| Err(SourceError::NotFound(name.to_owned())));
        Ok(request.apply(&result?)?)
    }
    async fn write(&self, name: &str, value: DbrValue) -> Result<(), SourceError> {
        self.monitors.write(name, value).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_seen_and_all_ok() {
    init_logging();
    let source = IntercomSource::new();
    let a = source.add_unconnected_pv::<f64>("A").unwrap();
    let b = source.add_unconnected_pv::<f64>("B").unwrap();
    let c = source.add_unconnected_pv::<f64>("C").unwrap();
    let updated = Arc::new(Mutex::new(Vec::new()));
    let record = updated.clone();
    let array = PvArrayBuilder::<f64>::new(&["A", "B", "C"])
        .on_update(move |_, index| record.lock().unwrap().push(index))
        .connect(source.clone())
        .await
        .unwrap();
    settle().await;
    assert_eq!(array.seen(), vec![false, false, false]);
    assert_eq!(array.get().as_slice(), &[0.0, 0.0, 0.0]);

    b.store(2.0);
    settle().await;
    a.store(1.0);
    settle().await;
    assert_eq!(array.seen(), vec![true, true, false]);
    assert_eq!(array.ok(), vec![true, true, false]);
    assert!(!array.all_ok());
    assert_eq!(*updated.lock().unwrap(), vec![1, 0]);

    c.store(3.0);
    settle().await;
    assert!(array.all_ok());
    let values = array.get();
    assert_eq!(values.as_slice(), &[1.0, 2.0, 3.0]);
    assert_eq!(values.shape(), vec![3]);
    assert_eq!(values[2], 3.0);
    assert_eq!(array.names(), &["A", "B", "C"]);
    assert_eq!(array.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_keeps_stale_value() {
    init_logging();
    let source = IntercomSource::new();
    let _a = source.add_pv("A", 1.0f64).unwrap();
    let b = source.add_pv("B", 2.0f64).unwrap();
    let array: PvArray<_, f64> = PvArray::connect(source.clone(), &["A", "B"]).await.unwrap();
    settle().await;
    assert!(array.all_ok());

    b.disconnect();
    settle().await;
    assert_eq!(array.ok(), vec![true, false]);
    assert!(!array.all_ok());
    assert_eq!(array.get().as_slice(), &[1.0, 2.0]);
    // A disconnected slot is never unseen again
    assert_eq!(array.seen(), vec![true, true]);

    b.store(4.0);
    settle().await;
    assert!(array.all_ok());
    assert_eq!(array.get().as_slice(), &[1.0, 4.0]);
}

#[tokio::test(start_paused = true)]
async fn test_metadata_views() {
    init_logging();
    let source = IntercomSource::new();
    let a = source.add_pv("A", 1i32).unwrap();
    let _b = source.add_pv("B", 2i32).unwrap();
    let array: PvArray<_, i32> = PvArray::connect(source.clone(), &["A", "B"]).await.unwrap();
    settle().await;
    assert_eq!(array.severity(), vec![0, 0]);

    let before = array.timestamp()[0];
    tokio::time::sleep(Duration::from_millis(5)).await;
    a.set_alarm(Status {
        status: 7,
        severity: 2,
    });
    settle().await;
    assert_eq!(array.severity(), vec![2, 0]);
    assert_eq!(array.status(), vec![7, 0]);
    assert!(array.timestamp()[0] >= before);
    assert!(array.timestamp()[1] > UNIX_EPOCH);
}

#[tokio::test(start_paused = true)]
async fn test_sync_fills_only_unseen_slots() {
    init_logging();
    let source = FakeSource::default();
    let a = source.monitors.add_pv("A", 1.0f64).unwrap();
    let _b = source.monitors.add_unconnected_pv::<f64>("B").unwrap();
    source.set_read("A", Ok(reading(99.0, 0)));
    source.set_read("B", Ok(reading(42.0, 1)));

    let array: PvArray<_, f64> = PvArray::connect(source.clone(), &["A", "B"]).await.unwrap();
    settle().await;
    assert_eq!(array.seen(), vec![true, false]);

    array.sync(Duration::from_secs(1), true).await.unwrap();
    assert_eq!(array.get().as_slice(), &[1.0, 42.0]);
    assert_eq!(array.seen(), vec![true, true]);
    assert!(array.all_ok());
    assert_eq!(array.severity(), vec![0, 1]);
    assert_eq!(
        array.timestamp()[1],
        UNIX_EPOCH + Duration::from_secs(1000)
    );

    // Once seen, a slot only changes through its monitor
    source.set_read("B", Ok(reading(-1.0, 0)));
    array.sync(Duration::from_secs(1), true).await.unwrap();
    assert_eq!(array.get().as_slice(), &[1.0, 42.0]);
    a.store(5.0);
    settle().await;
    assert_eq!(array.get().as_slice(), &[5.0, 42.0]);
}

#[tokio::test(start_paused = true)]
async fn test_sync_failures() {
    init_logging();
    let source = FakeSource::default();
    let _a = source.monitors.add_unconnected_pv::<f64>("A").unwrap();
    let _b = source.monitors.add_unconnected_pv::<f64>("B").unwrap();
    source.set_read("A", Ok(reading(3.0, 0)));
    source.set_read("B", Err(SourceError::Disconnected("B".into())));

    let array: PvArray<_, f64> = PvArray::connect(source.clone(), &["A", "B"]).await.unwrap();
    settle().await;

    // Failing leaves every slot alone
    assert!(matches!(
        array.sync(Duration::from_secs(1), true).await,
        Err(PvError::Source(SourceError::Disconnected(name))) if name == "B"
    ));
    assert_eq!(array.seen(), vec![false, false]);

    // Otherwise the failed slot is seen, but invalid
    array.sync(Duration::from_secs(1), false).await.unwrap();
    assert_eq!(array.seen(), vec![true, true]);
    assert_eq!(array.ok(), vec![true, false]);
    assert_eq!(array.get().as_slice(), &[3.0, 0.0]);
}

#[tokio::test(start_paused = true)]
async fn test_sync_timeout() {
    init_logging();
    let source = FakeSource {
        read_delay: Duration::from_secs(10),
        ..Default::default()
    };
    let _a = source.monitors.add_unconnected_pv::<f64>("A").unwrap();
    source.set_read("A", Ok(reading(3.0, 0)));
    let array: PvArray<_, f64> = PvArray::connect(source.clone(), &["A"]).await.unwrap();

    let start = tokio::time::Instant::now();
    assert!(matches!(
        array.sync(Duration::from_secs(1), true).await,
        Err(PvError::Timeout(name)) if name == "A"
    ));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(array.seen(), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn test_sync_reads_all_pvs_at_once() {
    init_logging();
    let source = FakeSource {
        read_delay: Duration::from_millis(400),
        ..Default::default()
    };
    for (i, name) in ["A", "B", "C"].into_iter().enumerate() {
        source.monitors.add_unconnected_pv::<f64>(name).unwrap();
        source.set_read(name, Ok(reading(i as f64, 0)));
    }
    let array: PvArray<_, f64> = PvArray::connect(source.clone(), &["A", "B", "C"])
        .await
        .unwrap();

    // Each read fits in the timeout, but all three back to back would not
    let start = tokio::time::Instant::now();
    array.sync(Duration::from_secs(1), true).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(array.seen(), vec![true, true, true]);
    assert_eq!(array.get().as_slice(), &[0.0, 1.0, 2.0]);

    let start = tokio::time::Instant::now();
    let read = array.caget(Duration::from_secs(1)).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(read.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_waveform_rows_are_padded() {
    init_logging();
    let source = IntercomSource::new();
    let _a = source.add_pv("A", vec![1i32, 2]).unwrap();
    let _b = source.add_pv("B", vec![3i32, 4, 5, 6]).unwrap();
    let array = PvArrayBuilder::<i32>::new(&["A", "B"])
        .count(3)
        .connect(source.clone())
        .await
        .unwrap();
    settle().await;
    let values = array.get();
    assert_eq!(values.shape(), vec![2, 3]);
    assert_eq!(values.row(0), &[1, 2, 0]);
    assert_eq!(values.row(1), &[3, 4, 5]);
    assert_eq!(values.rows().count(), 2);
    assert_eq!(array.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_put_and_caget() {
    init_logging();
    let source = IntercomSource::new();
    let a = source.add_pv("A", 0i32).unwrap();
    let b = source.add_pv("B", 0i32).unwrap();
    let array: PvArray<_, i32> = PvArray::connect(source.clone(), &["A", "B"]).await.unwrap();

    array.put(&[5, 6]).await.unwrap();
    assert_eq!((a.load(), b.load()), (Some(5), Some(6)));
    assert!(matches!(
        array.put(&[1]).await,
        Err(PvError::LengthMismatch {
            expected: 2,
            got: 1
        })
    ));
    array.put_all(9i32).await.unwrap();
    assert_eq!((a.load(), b.load()), (Some(9), Some(9)));

    let read = array.caget(Duration::from_secs(1)).await.unwrap();
    let values: Vec<_> = read.iter().map(|d| d.value().clone()).collect();
    assert_eq!(values, vec![DbrValue::Long(vec![9]), DbrValue::Long(vec![9])]);
    assert!(read.iter().all(|d| d.timestamp().is_some()));
    settle().await;
    assert_eq!(array.get().as_slice(), &[9, 9]);
}

#[tokio::test(start_paused = true)]
async fn test_construction_failures() {
    init_logging();
    let source = IntercomSource::new();
    let _a = source.add_pv("A", 1.0f64).unwrap();
    assert!(matches!(
        PvArray::<_, f64>::connect(source.clone(), &["A", "MISSING"]).await,
        Err(PvError::Source(SourceError::NotFound(name))) if name == "MISSING"
    ));
    settle().await;
    // The monitor already made for A was released
    assert_eq!(source.subscriber_count("A"), 0);

    assert!(matches!(
        PvArray::<_, f64>::connect(source.clone(), &[]).await,
        Err(PvError::EmptyArray)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_and_drop() {
    init_logging();
    let source = IntercomSource::new();
    let a = source.add_pv("A", 1i16).unwrap();
    let _b = source.add_pv("B", 2i16).unwrap();
    let array: PvArray<_, i16> = PvArray::connect(source.clone(), &["A", "B"]).await.unwrap();
    settle().await;
    assert_eq!(source.subscriber_count("A"), 1);

    array.close();
    array.close();
    assert!(array.is_closed());
    settle().await;
    assert_eq!(source.subscriber_count("A"), 0);
    assert_eq!(source.subscriber_count("B"), 0);
    a.store(10);
    settle().await;
    assert_eq!(array.get().as_slice(), &[1, 2]);

    let array: PvArray<_, i16> = PvArray::connect(source.clone(), &["A", "B"]).await.unwrap();
    settle().await;
    assert_eq!(source.subscriber_count("B"), 1);
    drop(array);
    settle().await;
    assert_eq!(source.subscriber_count("B"), 0);
}
