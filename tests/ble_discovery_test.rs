//! BLE discovery engine tests against a scripted scanner, on tokio's paused clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spectrolink::discovery::ble::{Advertisement, AdvertisementCallback, SPECTROMETER_SERVICE};
use spectrolink::discovery::{AdvertisementScanner, BleDiscovery, DiscoveryEvent};
use spectrolink::{DeviceId, LinkError, LinkResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Scanner that replays advertisements at fixed offsets from `start`.
#[derive(Default)]
struct Scripted {
    script: Vec<(Duration, Advertisement)>,
    fail_start: bool,
    task: Option<JoinHandle<()>>,
    starts: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

impl Scripted {
    fn new(script: Vec<(u64, Advertisement)>) -> Self {
        Self {
            script: script
                .into_iter()
                .map(|(secs, adv)| (Duration::from_secs(secs), adv))
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl AdvertisementScanner for Scripted {
    async fn start(&mut self, on_advertisement: AdvertisementCallback) -> LinkResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(LinkError::Ble("adapter powered off".into()));
        }
        let script = std::mem::take(&mut self.script);
        let t0 = Instant::now();
        self.task = Some(tokio::spawn(async move {
            for (at, adv) in script {
                tokio::time::sleep_until(t0 + at).await;
                on_advertisement(adv);
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> LinkResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn named(name: &str, rssi: i16) -> Advertisement {
    Advertisement {
        local_name: Some(name.to_string()),
        services: Vec::new(),
        rssi: Some(rssi),
    }
}

fn serving(name: &str, service: Uuid) -> Advertisement {
    Advertisement {
        local_name: Some(name.to_string()),
        services: vec![service],
        rssi: None,
    }
}

async fn drain(rx: &mut mpsc::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let done = event == DiscoveryEvent::Finished;
        events.push(event);
        if done {
            break;
        }
    }
    events
}

fn found_names(events: &[DiscoveryEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            DiscoveryEvent::Found(d) => Some(d.display_name.clone()),
            DiscoveryEvent::Finished => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_scan_reports_matches_then_one_sentinel_at_budget() {
    let (tx, mut rx) = mpsc::channel(16);
    let engine = BleDiscovery::builder()
        .timeout(Duration::from_secs(10))
        .channel(tx)
        .build()
        .unwrap();

    let mut scanner = Scripted::new(vec![
        (1, named("WP-00561", -48)),
        (2, named("XS-00001", -40)),
        (3, serving("Bench", SPECTROMETER_SERVICE)),
        (4, serving("WP-00777", Uuid::nil())),
        (30, named("WP-late", -70)),
    ]);
    let stopped = scanner.stopped.clone();

    let t0 = Instant::now();
    let search = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.search(&mut scanner).await })
    };

    let events = drain(&mut rx).await;
    assert_eq!(found_names(&events), ["WP-00561", "Bench"]);
    assert_eq!(events.last(), Some(&DiscoveryEvent::Finished));

    let DiscoveryEvent::Found(first) = &events[0] else {
        panic!("expected a device first, got {:?}", events[0]);
    };
    assert_eq!(first.identity, DeviceId::ble("WP-00561"));
    assert_eq!(first.signal_strength, Some(-48));

    assert_eq!(search.await.unwrap(), 2);
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    assert!(stopped.load(Ordering::SeqCst));
    assert!(!engine.is_scanning());
    assert!(engine.is_finished());

    // Nothing follows the sentinel.
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_scan_early() {
    let (tx, mut rx) = mpsc::channel(16);
    let engine = BleDiscovery::builder()
        .timeout(Duration::from_secs(60))
        .channel(tx)
        .build()
        .unwrap();
    let mut scanner = Scripted::new(vec![(1, named("WP-1", -60)), (2, named("WP-2", -61))]);

    let t0 = Instant::now();
    let search = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.search(&mut scanner).await })
    };

    assert!(matches!(rx.recv().await, Some(DiscoveryEvent::Found(_))));
    engine.stop();
    assert_eq!(search.await.unwrap(), 1);
    assert!(t0.elapsed() < Duration::from_secs(2));
    assert_eq!(rx.recv().await, Some(DiscoveryEvent::Finished));

    // A late advertisement after stop is ignored.
    engine.handle_advertisement(named("WP-3", -50));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_scanner_start_failure_still_finishes() {
    let (tx, mut rx) = mpsc::channel(4);
    let engine = BleDiscovery::builder()
        .timeout(Duration::from_secs(10))
        .channel(tx)
        .build()
        .unwrap();
    let mut scanner = Scripted {
        fail_start: true,
        ..Scripted::default()
    };

    let t0 = Instant::now();
    assert_eq!(engine.search(&mut scanner).await, 0);
    assert_eq!(t0.elapsed(), Duration::ZERO);
    assert_eq!(rx.recv().await, Some(DiscoveryEvent::Finished));
    assert!(scanner.stopped.load(Ordering::SeqCst));
    assert!(!engine.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_full_channel_still_gets_sentinel() {
    let (tx, mut rx) = mpsc::channel(1);
    let engine = BleDiscovery::builder()
        .timeout(Duration::from_secs(5))
        .channel(tx)
        .build()
        .unwrap();
    let mut scanner = Scripted::new(vec![(1, named("WP-1", -60)), (2, named("WP-2", -60))]);

    // Nobody reads until the scan is over, so the channel fills up.
    engine.search(&mut scanner).await;

    assert!(matches!(rx.recv().await, Some(DiscoveryEvent::Found(_))));
    assert_eq!(rx.recv().await, Some(DiscoveryEvent::Finished));
}

#[tokio::test(start_paused = true)]
async fn test_callback_sink_receives_events_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = {
        let seen = seen.clone();
        BleDiscovery::builder()
            .timeout(Duration::from_secs(3))
            .name_prefix("sim-")
            .callback(move |event| seen.lock().unwrap().push(event))
            .build()
            .unwrap()
    };
    let mut scanner = Scripted::new(vec![(1, named("SIM-A", -30)), (2, named("WP-1", -30))]);

    assert_eq!(engine.search(&mut scanner).await, 1);

    let events = seen.lock().unwrap().clone();
    assert_eq!(found_names(&events), ["SIM-A"]);
    assert_eq!(events.last(), Some(&DiscoveryEvent::Finished));
    assert_eq!(
        events.iter().filter(|e| **e == DiscoveryEvent::Finished).count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_engine_scans_only_once() {
    let (tx, mut rx) = mpsc::channel(4);
    let engine = BleDiscovery::builder()
        .timeout(Duration::from_secs(1))
        .channel(tx)
        .build()
        .unwrap();
    let mut scanner = Scripted::default();
    let starts = scanner.starts.clone();

    engine.search(&mut scanner).await;
    engine.search(&mut scanner).await;

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(rx.recv().await, Some(DiscoveryEvent::Finished));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_zero_budget_rejected() {
    let (tx, _rx) = mpsc::channel(1);
    let err = BleDiscovery::builder()
        .timeout(Duration::ZERO)
        .channel(tx)
        .build()
        .unwrap_err();
    assert!(matches!(err, LinkError::Configuration(_)));
}
