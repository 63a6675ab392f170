//! Time-boxed BLE advertisement scanning.
//!
//! A [`BleDiscovery`] engine runs one scan against an [`AdvertisementScanner`] and
//! reports each matching advertiser as a [`DiscoveryEvent::Found`] through exactly one
//! sink: a bounded tokio channel or a callback. When the scan ends, for whatever
//! reason, exactly one [`DiscoveryEvent::Finished`] sentinel follows.
//!
//! The scan loop has a single suspension point: the engine's cancellation token. A
//! spawned timer task cancels it when the time budget runs out, and [`BleDiscovery::stop`]
//! cancels it on demand. The per-advertisement callback never awaits.
//!
//! ```no_run
//! # async fn demo<S: spectrolink::discovery::AdvertisementScanner + 'static>(mut scanner: S) -> spectrolink::LinkResult<()> {
//! use std::time::Duration;
//! use spectrolink::discovery::{BleDiscovery, DiscoveryEvent};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//! let engine = BleDiscovery::builder()
//!     .timeout(Duration::from_secs(10))
//!     .channel(tx)
//!     .build()?;
//! tokio::spawn(async move { engine.search(&mut scanner).await });
//! while let Some(DiscoveryEvent::Found(device)) = rx.recv().await {
//!     println!("{} ({:?} dBm)", device.identity, device.signal_strength);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{LinkError, LinkResult};
use crate::identity::{DeviceId, DiscoveredDevice};

/// Service UUID advertised by supported spectrometers.
pub const SPECTROMETER_SERVICE: Uuid = Uuid::from_u128(0xD1A7FF00_AF78_4449_A34F_4DA1AFAF51BC);

/// Local-name prefix used when an advertisement lists no services.
pub const DEFAULT_NAME_PREFIX: &str = "WP-";

/// Default scan budget.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// One received advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Called by a scanner for every advertisement. Must not block.
pub type AdvertisementCallback = Arc<dyn Fn(Advertisement) + Send + Sync>;

/// A BLE radio that can report advertisements.
#[async_trait]
pub trait AdvertisementScanner: Send {
    /// Begin scanning, invoking `on_advertisement` for each advertisement received.
    async fn start(&mut self, on_advertisement: AdvertisementCallback) -> LinkResult<()>;

    /// Stop scanning. No callbacks may be made after this returns.
    async fn stop(&mut self) -> LinkResult<()>;
}

/// Item delivered to the discovery sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A matching device was seen.
    Found(DiscoveredDevice),
    /// The scan ended; nothing follows.
    Finished,
}

/// Callback sink.
pub type DiscoveryCallback = Arc<dyn Fn(DiscoveryEvent) + Send + Sync>;

enum Sink {
    Channel(mpsc::Sender<DiscoveryEvent>),
    Callback(DiscoveryCallback),
}

impl Sink {
    fn deliver(&self, event: DiscoveryEvent) {
        match self {
            Sink::Callback(cb) => cb(event),
            Sink::Channel(tx) => match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(DiscoveryEvent::Finished)) => {
                    // The sentinel must arrive even if the consumer is slow.
                    let tx = tx.clone();
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(async move {
                                let _ = tx.send(DiscoveryEvent::Finished).await;
                            });
                        }
                        Err(_) => warn!("Discovery channel full outside a runtime; sentinel dropped"),
                    }
                }
                Err(TrySendError::Full(event)) => {
                    warn!(?event, "Discovery channel full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Discovery receiver dropped");
                }
            },
        }
    }
}

/// Builder for [`BleDiscovery`].
pub struct BleDiscoveryBuilder {
    timeout: Duration,
    service_uuid: Uuid,
    name_prefix: String,
    channel: Option<mpsc::Sender<DiscoveryEvent>>,
    callback: Option<DiscoveryCallback>,
}

impl Default for BleDiscoveryBuilder {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SCAN_TIMEOUT,
            service_uuid: SPECTROMETER_SERVICE,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            channel: None,
            callback: None,
        }
    }
}

impl BleDiscoveryBuilder {
    /// Scan budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Service UUID to match.
    pub fn service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = uuid;
        self
    }

    /// Local-name prefix to match (case-insensitive).
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Deliver events through a bounded channel.
    pub fn channel(mut self, tx: mpsc::Sender<DiscoveryEvent>) -> Self {
        self.channel = Some(tx);
        self
    }

    /// Deliver events through a callback.
    pub fn callback(mut self, cb: impl Fn(DiscoveryEvent) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(cb));
        self
    }

    /// Build the engine. Exactly one sink must be configured.
    pub fn build(self) -> LinkResult<BleDiscovery> {
        let sink = match (self.channel, self.callback) {
            (Some(tx), None) => Sink::Channel(tx),
            (None, Some(cb)) => Sink::Callback(cb),
            (None, None) => {
                return Err(LinkError::Configuration(
                    "BLE discovery needs a channel or a callback".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(LinkError::Configuration(
                    "BLE discovery takes a channel or a callback, not both".into(),
                ))
            }
        };
        if self.timeout.is_zero() {
            return Err(LinkError::Configuration(
                "BLE scan timeout must be non-zero".into(),
            ));
        }
        Ok(BleDiscovery {
            shared: Arc::new(Shared {
                timeout: self.timeout,
                service_uuid: self.service_uuid,
                name_prefix: self.name_prefix.to_uppercase(),
                sink,
                state: AtomicU8::new(IDLE),
                found: AtomicUsize::new(0),
                started_at: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

// Engine lifecycle: IDLE -> SCANNING -> FINISHED, or IDLE -> FINISHED on an early stop.
const IDLE: u8 = 0;
const SCANNING: u8 = 1;
const FINISHED: u8 = 2;

struct Shared {
    timeout: Duration,
    service_uuid: Uuid,
    name_prefix: String,
    sink: Sink,
    state: AtomicU8,
    found: AtomicUsize,
    started_at: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl Shared {
    /// Move from idle to scanning. Fails if the engine already scanned or was stopped.
    fn begin(&self) -> bool {
        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Instant::now());
        }
        self.state
            .compare_exchange(IDLE, SCANNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_scanning(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SCANNING
    }

    fn elapsed(&self) -> Duration {
        let started = self.started_at.lock().ok().and_then(|guard| *guard);
        started.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn matches(&self, adv: &Advertisement) -> bool {
        if !adv.services.is_empty() {
            return adv.services.contains(&self.service_uuid);
        }
        adv.local_name
            .as_deref()
            .is_some_and(|name| name.to_uppercase().starts_with(&self.name_prefix))
    }

    fn on_advertisement(&self, adv: Advertisement) {
        if !self.is_scanning() {
            return;
        }
        let elapsed = self.elapsed();
        if elapsed >= self.timeout {
            debug!(?elapsed, "Scan budget spent");
            self.stop();
            return;
        }
        if !self.matches(&adv) {
            return;
        }
        let Some(serial_number) = adv.local_name else {
            debug!(services = ?adv.services, "Matching advertisement without a local name");
            return;
        };

        let device = DiscoveredDevice {
            identity: DeviceId::ble(serial_number.as_str()),
            display_name: serial_number,
            signal_strength: adv.rssi,
        };
        debug!(device = %device.identity, rssi = ?device.signal_strength, "BLE device found");
        self.found.fetch_add(1, Ordering::SeqCst);
        self.sink.deliver(DiscoveryEvent::Found(device));
    }

    fn stop(&self) {
        let previous = self.state.swap(FINISHED, Ordering::SeqCst);
        self.cancel.cancel();
        if previous == FINISHED {
            return;
        }
        debug!("BLE scan stopping");
        self.sink.deliver(DiscoveryEvent::Finished);
    }
}

/// BLE discovery engine.
///
/// Cloning yields another handle to the same engine, e.g. to call
/// [`stop`](Self::stop) from a different task. One engine runs one scan.
#[derive(Clone)]
pub struct BleDiscovery {
    shared: Arc<Shared>,
}

impl fmt::Debug for BleDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleDiscovery")
            .field("timeout", &self.shared.timeout)
            .field("service_uuid", &self.shared.service_uuid)
            .field("name_prefix", &self.shared.name_prefix)
            .field("scanning", &self.is_scanning())
            .finish()
    }
}

impl BleDiscovery {
    /// Start configuring an engine.
    pub fn builder() -> BleDiscoveryBuilder {
        BleDiscoveryBuilder::default()
    }

    /// Whether a scan is in progress.
    pub fn is_scanning(&self) -> bool {
        self.shared.is_scanning()
    }

    /// Whether the scan has ended and the sentinel was delivered.
    pub fn is_finished(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == FINISHED
    }

    /// Number of devices reported so far.
    pub fn found(&self) -> usize {
        self.shared.found.load(Ordering::SeqCst)
    }

    /// Stop the scan. Idempotent; the sentinel is delivered on the first call only.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Feed one advertisement through the matching logic, as a scanner would.
    pub fn handle_advertisement(&self, adv: Advertisement) {
        self.shared.on_advertisement(adv);
    }

    /// Run the scan until the budget runs out or [`stop`](Self::stop) is called.
    ///
    /// Scanner failures are logged, not returned; the engine still ends with the
    /// sentinel delivered. Returns the number of devices reported.
    pub async fn search<S: AdvertisementScanner + ?Sized>(&self, scanner: &mut S) -> usize {
        if !self.shared.begin() {
            warn!("BLE discovery engine already finished; build a new one to scan again");
            return self.found();
        }
        info!(
            timeout = ?self.shared.timeout,
            service = %self.shared.service_uuid,
            "BLE scan starting"
        );

        let timer = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                tokio::time::sleep(shared.timeout).await;
                debug!("BLE scan timer fired");
                shared.stop();
            })
        };

        let callback: AdvertisementCallback = {
            let shared = Arc::clone(&self.shared);
            Arc::new(move |adv| shared.on_advertisement(adv))
        };

        match scanner.start(callback).await {
            Ok(()) => self.shared.cancel.cancelled().await,
            Err(e) => {
                error!(error = %e, "BLE scanner failed to start");
                self.shared.stop();
            }
        }

        if let Err(e) = scanner.stop().await {
            warn!(error = %e, "BLE scanner failed to stop cleanly");
        }
        timer.abort();

        let found = self.found();
        info!(found, "BLE scan finished");
        found
    }
}

// =============================================================================
// btleplug backend
// =============================================================================

#[cfg(feature = "ble")]
pub use self::native::BtleplugScanner;

#[cfg(feature = "ble")]
mod native {
    use async_trait::async_trait;
    use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
    use btleplug::platform::{Adapter, Manager};
    use futures::StreamExt;
    use tokio::task::JoinHandle;
    use tracing::debug;
    use uuid::Uuid;

    use super::{Advertisement, AdvertisementCallback, AdvertisementScanner};
    use crate::error::{LinkError, LinkResult};

    fn ble_err(e: btleplug::Error) -> LinkError {
        LinkError::Ble(e.to_string())
    }

    /// Scanner over the host's first BLE adapter.
    pub struct BtleplugScanner {
        adapter: Adapter,
        service_uuid: Uuid,
        events: Option<JoinHandle<()>>,
    }

    impl BtleplugScanner {
        /// Open the first adapter, filtering scans to `service_uuid`.
        pub async fn first_adapter(service_uuid: Uuid) -> LinkResult<Self> {
            let manager = Manager::new().await.map_err(ble_err)?;
            let adapter = manager
                .adapters()
                .await
                .map_err(ble_err)?
                .into_iter()
                .next()
                .ok_or_else(|| LinkError::Ble("no BLE adapter available".into()))?;
            Ok(Self {
                adapter,
                service_uuid,
                events: None,
            })
        }
    }

    #[async_trait]
    impl AdvertisementScanner for BtleplugScanner {
        async fn start(&mut self, on_advertisement: AdvertisementCallback) -> LinkResult<()> {
            let mut events = self.adapter.events().await.map_err(ble_err)?;
            self.adapter
                .start_scan(ScanFilter {
                    services: vec![self.service_uuid],
                })
                .await
                .map_err(ble_err)?;

            let adapter = self.adapter.clone();
            self.events = Some(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                        _ => continue,
                    };
                    let Ok(peripheral) = adapter.peripheral(&id).await else {
                        continue;
                    };
                    let Ok(Some(props)) = peripheral.properties().await else {
                        continue;
                    };
                    debug!(?id, name = ?props.local_name, "BLE advertisement");
                    on_advertisement(Advertisement {
                        local_name: props.local_name,
                        services: props.services,
                        rssi: props.rssi,
                    });
                }
            }));
            Ok(())
        }

        async fn stop(&mut self) -> LinkResult<()> {
            if let Some(task) = self.events.take() {
                task.abort();
            }
            self.adapter.stop_scan().await.map_err(ble_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_channel(cap: usize) -> (BleDiscovery, mpsc::Receiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(cap);
        let engine = BleDiscovery::builder().channel(tx).build().unwrap();
        (engine, rx)
    }

    #[test]
    fn sink_must_be_exactly_one() {
        assert!(matches!(
            BleDiscovery::builder().build(),
            Err(LinkError::Configuration(_))
        ));
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            BleDiscovery::builder().channel(tx).callback(|_| {}).build(),
            Err(LinkError::Configuration(_))
        ));
    }

    #[test]
    fn matching_prefers_services_then_name() {
        let (engine, _rx) = engine_with_channel(4);
        let s = &engine.shared;
        let named = |n: &str| Advertisement {
            local_name: Some(n.into()),
            ..Advertisement::default()
        };
        assert!(s.matches(&named("WP-00123")));
        assert!(s.matches(&named("wp-00123")));
        assert!(!s.matches(&named("XS-00123")));
        let with_other_service = Advertisement {
            local_name: Some("WP-1".into()),
            services: vec![Uuid::nil()],
            rssi: None,
        };
        assert!(!s.matches(&with_other_service));
        let with_service = Advertisement {
            local_name: Some("anything".into()),
            services: vec![SPECTROMETER_SERVICE],
            rssi: Some(-60),
        };
        assert!(s.matches(&with_service));
    }

    #[tokio::test]
    async fn stop_is_idempotent_with_one_sentinel() {
        let (engine, mut rx) = engine_with_channel(4);
        engine.stop();
        engine.stop();
        engine.clone().stop();
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Finished));
        assert!(rx.try_recv().is_err());
        assert!(engine.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn advertisement_past_budget_stops_before_timer_runs() {
        let (tx, mut rx) = mpsc::channel(4);
        let engine = BleDiscovery::builder()
            .timeout(Duration::from_secs(10))
            .channel(tx)
            .build()
            .unwrap();
        assert!(engine.shared.begin());
        assert!(engine.is_scanning());

        // No timer task exists, so only the elapsed check can end the scan.
        tokio::time::advance(Duration::from_secs(11)).await;
        engine.handle_advertisement(Advertisement {
            local_name: Some("WP-00561".into()),
            ..Advertisement::default()
        });

        assert!(!engine.is_scanning());
        assert!(engine.is_finished());
        assert!(engine.shared.cancel.is_cancelled());
        assert_eq!(engine.found(), 0);
        assert_eq!(rx.try_recv().unwrap(), DiscoveryEvent::Finished);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_before_search_prevents_scanning() {
        let (engine, mut rx) = engine_with_channel(4);
        engine.stop();
        assert!(!engine.shared.begin());
        assert!(!engine.is_scanning());
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Finished));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn advertisements_ignored_while_not_scanning() {
        let (engine, mut rx) = engine_with_channel(4);
        engine.handle_advertisement(Advertisement {
            local_name: Some("WP-1".into()),
            ..Advertisement::default()
        });
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.found(), 0);
    }
}
