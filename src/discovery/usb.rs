//! USB bus polling and the warm-up state machine.

use std::sync::Arc;

use tracing::{debug, info};

use super::{DiscoveryStrategy, UsbAllowList};
use crate::error::LinkResult;
use crate::identity::{DeviceId, UsbDescriptor};

/// A USB bus that can be enumerated.
pub trait UsbBus: Send + Sync {
    /// Descriptor type this backend hands out.
    type Device: UsbDescriptor;

    /// Every device currently attached.
    fn list_devices(&self) -> LinkResult<Vec<Self::Device>>;
}

/// Identities of every allow-listed device on `bus`, optionally narrowed to one
/// (vendor, product) pair.
pub(crate) fn query_bus<B: UsbBus + ?Sized>(
    bus: &B,
    allow: &UsbAllowList,
    only: Option<(u16, u16)>,
) -> LinkResult<Vec<DeviceId>> {
    let mut found = Vec::new();
    for device in bus.list_devices()? {
        let (Some(vid), Some(pid)) = (device.vendor_id(), device.product_id()) else {
            // Without structured ids the descriptor chain decides; filter afterwards.
            let id = DeviceId::from_descriptor(&device);
            if let Some(c) = id.usb_coordinates() {
                if allow.allows(c.vendor_id, c.product_id)
                    && only.map_or(true, |pair| pair == (c.vendor_id, c.product_id))
                {
                    found.push(id);
                }
            }
            continue;
        };
        let Some(products) = allow.products(vid) else {
            continue;
        };
        if !products.contains(&pid) {
            continue;
        }
        if only.is_some_and(|pair| pair != (vid, pid)) {
            continue;
        }
        found.push(DeviceId::from_descriptor(&device));
    }
    Ok(found)
}

/// Full bus walk on every call.
pub struct BusPolling<B> {
    bus: Arc<B>,
    allow: UsbAllowList,
}

impl<B: UsbBus> BusPolling<B> {
    /// Poll `bus`, keeping devices on `allow`.
    pub fn new(bus: Arc<B>, allow: UsbAllowList) -> Self {
        Self { bus, allow }
    }
}

impl<B: UsbBus> DiscoveryStrategy for BusPolling<B> {
    fn name(&self) -> &str {
        "usb-polling"
    }

    fn list_current_devices(&mut self) -> LinkResult<Vec<DeviceId>> {
        let found = query_bus(self.bus.as_ref(), &self.allow, None)?;
        debug!(count = found.len(), "USB bus poll");
        Ok(found)
    }
}

/// Phase of [`UsbDiscovery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Full bus polling; every call during warm-up lands here.
    StartupPolling,
    /// Hotplug monitoring; entered once and never left.
    SteadyState,
}

/// Default number of polling calls before switching to the monitor.
pub const DEFAULT_WARMUP_POLLS: u32 = 10;

/// USB discovery engine: polls during warm-up, then hands over to the platform
/// hotplug monitor.
///
/// The first `warmup_polls` calls always poll. Call `warmup_polls + 1` switches to the
/// monitor if continuous monitoring is enabled and a monitor exists for the platform;
/// otherwise the engine keeps polling.
pub struct UsbDiscovery<B> {
    polling: BusPolling<B>,
    monitor: Option<Box<dyn DiscoveryStrategy>>,
    continuous_monitoring: bool,
    warmup_polls: u32,
    calls: u64,
    state: DiscoveryState,
}

impl<B: UsbBus> UsbDiscovery<B> {
    /// Polling-only engine with default warm-up and monitoring enabled.
    pub fn new(bus: Arc<B>, allow: UsbAllowList) -> Self {
        Self {
            polling: BusPolling::new(bus, allow),
            monitor: None,
            continuous_monitoring: true,
            warmup_polls: DEFAULT_WARMUP_POLLS,
            calls: 0,
            state: DiscoveryState::StartupPolling,
        }
    }

    /// Set the number of warm-up polls.
    pub fn warmup_polls(mut self, polls: u32) -> Self {
        self.warmup_polls = polls;
        self
    }

    /// Enable or disable the switch to the monitor.
    pub fn continuous_monitoring(mut self, enabled: bool) -> Self {
        self.continuous_monitoring = enabled;
        self
    }

    /// Install the platform monitor (see [`super::monitor_for_platform`]).
    pub fn monitor(mut self, monitor: Option<Box<dyn DiscoveryStrategy>>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Current phase.
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Number of `list_current_devices` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl<B: UsbBus> DiscoveryStrategy for UsbDiscovery<B> {
    fn name(&self) -> &str {
        "usb"
    }

    fn list_current_devices(&mut self) -> LinkResult<Vec<DeviceId>> {
        self.calls += 1;
        if self.state == DiscoveryState::StartupPolling
            && self.calls > u64::from(self.warmup_polls)
            && self.continuous_monitoring
        {
            if let Some(monitor) = &self.monitor {
                info!(
                    calls = self.calls,
                    monitor = monitor.name(),
                    "USB warm-up complete, switching to hotplug monitoring"
                );
                self.state = DiscoveryState::SteadyState;
            }
        }

        match (self.state, self.monitor.as_mut()) {
            (DiscoveryState::SteadyState, Some(monitor)) => monitor.list_current_devices(),
            _ => self.polling.list_current_devices(),
        }
    }
}

// =============================================================================
// nusb backend
// =============================================================================

#[cfg(feature = "usb")]
pub use self::native::{NusbBus, NusbDescriptor};

#[cfg(feature = "usb")]
mod native {
    use super::UsbBus;
    use crate::error::{LinkError, LinkResult};
    use crate::identity::UsbDescriptor;

    /// The host USB bus, enumerated with nusb.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NusbBus;

    /// One device as nusb reports it.
    #[derive(Debug, Clone)]
    pub struct NusbDescriptor(nusb::DeviceInfo);

    impl UsbDescriptor for NusbDescriptor {
        fn vendor_id(&self) -> Option<u16> {
            Some(self.0.vendor_id())
        }

        fn product_id(&self) -> Option<u16> {
            Some(self.0.product_id())
        }

        fn bus(&self) -> Option<i32> {
            Some(i32::from(self.0.bus_number()))
        }

        fn address(&self) -> Option<i32> {
            Some(i32::from(self.0.device_address()))
        }

        fn product_string(&self) -> Option<String> {
            self.0.product_string().map(str::to_string)
        }

        fn serial_string(&self) -> Option<String> {
            self.0.serial_number().map(str::to_string)
        }

        fn diagnostic_text(&self) -> String {
            format!(
                "DEVICE ID {:04x}:{:04x} on Bus {:03} Address {:03}",
                self.0.vendor_id(),
                self.0.product_id(),
                self.0.bus_number(),
                self.0.device_address()
            )
        }
    }

    impl UsbBus for NusbBus {
        type Device = NusbDescriptor;

        fn list_devices(&self) -> LinkResult<Vec<NusbDescriptor>> {
            Ok(nusb::list_devices()
                .map_err(|e| LinkError::Transport(format!("USB enumeration: {e}")))?
                .map(NusbDescriptor)
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DEFAULT_VENDOR_ID;

    #[derive(Clone)]
    struct Fake {
        vid: u16,
        pid: u16,
        bus: i32,
        addr: i32,
    }

    impl UsbDescriptor for Fake {
        fn vendor_id(&self) -> Option<u16> {
            Some(self.vid)
        }
        fn product_id(&self) -> Option<u16> {
            Some(self.pid)
        }
        fn bus(&self) -> Option<i32> {
            Some(self.bus)
        }
        fn address(&self) -> Option<i32> {
            Some(self.addr)
        }
        fn diagnostic_text(&self) -> String {
            String::new()
        }
    }

    struct FakeBus(Vec<Fake>);

    impl UsbBus for FakeBus {
        type Device = Fake;
        fn list_devices(&self) -> LinkResult<Vec<Fake>> {
            Ok(self.0.clone())
        }
    }

    fn fake(vid: u16, pid: u16, addr: i32) -> Fake {
        Fake {
            vid,
            pid,
            bus: 1,
            addr,
        }
    }

    #[test]
    fn polling_filters_vendor_then_product() {
        let bus = Arc::new(FakeBus(vec![
            fake(DEFAULT_VENDOR_ID, 0x1000, 2),
            fake(DEFAULT_VENDOR_ID, 0x9999, 3),
            fake(0x046d, 0x1000, 4),
            fake(DEFAULT_VENDOR_ID, 0x4000, 5),
        ]));
        let mut polling = BusPolling::new(bus, UsbAllowList::default());
        let ids: Vec<String> = polling
            .list_current_devices()
            .unwrap()
            .iter()
            .map(|d| d.to_string())
            .collect();
        assert_eq!(ids, ["USB:0x24aa:0x1000:1:2", "USB:0x24aa:0x4000:1:5"]);
    }

    #[test]
    fn query_bus_narrows_to_pair() {
        let bus = FakeBus(vec![
            fake(DEFAULT_VENDOR_ID, 0x1000, 2),
            fake(DEFAULT_VENDOR_ID, 0x2000, 3),
        ]);
        let ids = query_bus(&bus, &UsbAllowList::default(), Some((DEFAULT_VENDOR_ID, 0x2000))).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].usb_coordinates().unwrap().address, 3);
    }

    #[test]
    fn stays_polling_without_monitor() {
        let bus = Arc::new(FakeBus(vec![fake(DEFAULT_VENDOR_ID, 0x1000, 2)]));
        let mut usb = UsbDiscovery::new(bus, UsbAllowList::default()).warmup_polls(2);
        for _ in 0..5 {
            assert_eq!(usb.list_current_devices().unwrap().len(), 1);
        }
        assert_eq!(usb.state(), DiscoveryState::StartupPolling);
        assert_eq!(usb.calls(), 5);
    }
}
