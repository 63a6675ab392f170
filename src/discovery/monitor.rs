//! USB hotplug monitors, one per OS family.
//!
//! Each monitor reads raw hotplug records from a [`HotplugSource`] in the platform's
//! native textual form and works in two phases:
//!
//! 1. Wait for one record, for at most the configured (sub-millisecond) timeout. No
//!    record means no new devices this tick.
//! 2. Extract the vendor/product pair from the record. If the pair is allow-listed,
//!    re-query the bus for every device with exactly that pair.
//!
//! | Monitor | Record |
//! |---|---|
//! | [`UdevMonitor`] | `ACTION=add ... PRODUCT=24aa/4000/100` (hex, unpadded) |
//! | [`SetupApiMonitor`] | `USB\VID_24AA&PID_4000\...` instance ids |
//! | [`IoKitMonitor`] | `"idVendor" = 9386` / `"idProduct" = 16384` (decimal) |

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use super::usb::{query_bus, UsbBus};
use super::{DiscoveryStrategy, Platform, UsbAllowList};
use crate::error::LinkResult;
use crate::identity::DeviceId;

/// Default phase-1 wait.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_micros(500);

static UDEV_PRODUCT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bPRODUCT=([0-9a-fA-F]{1,4})/([0-9a-fA-F]{1,4})/").expect("Invalid udev regex")
});

static SETUPAPI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bVID_([0-9a-f]{4})&PID_([0-9a-f]{4})").expect("Invalid SetupAPI regex")
});

static IOKIT_VENDOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""?idVendor"?\s*=\s*(\d+)"#).expect("Invalid IOKit vendor regex")
});

static IOKIT_PRODUCT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""?idProduct"?\s*=\s*(\d+)"#).expect("Invalid IOKit product regex")
});

/// Source of raw OS hotplug records.
pub trait HotplugSource: Send {
    /// Next record, waiting at most `timeout`. `None` if nothing arrived.
    fn poll_event(&mut self, timeout: Duration) -> Option<String>;
}

/// Records fed through a std channel, e.g. by a platform watcher thread.
pub struct ChannelHotplug {
    rx: mpsc::Receiver<String>,
}

impl ChannelHotplug {
    /// New source and the sender that feeds it.
    pub fn channel() -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }
}

impl HotplugSource for ChannelHotplug {
    fn poll_event(&mut self, timeout: Duration) -> Option<String> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Pre-recorded records, returned one per poll.
#[derive(Debug, Default)]
pub struct ReplayHotplug {
    records: VecDeque<String>,
}

impl ReplayHotplug {
    /// Replay `records` in order.
    pub fn new<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            records: records.into_iter().map(Into::into).collect(),
        }
    }
}

impl HotplugSource for ReplayHotplug {
    fn poll_event(&mut self, _timeout: Duration) -> Option<String> {
        self.records.pop_front()
    }
}

// =============================================================================
// Record parsers
// =============================================================================

/// `(vid, pid)` from a udev uevent record.
pub fn parse_udev_record(record: &str) -> Option<(u16, u16)> {
    let caps = UDEV_PRODUCT_REGEX.captures(record)?;
    let vid = u16::from_str_radix(caps.get(1)?.as_str(), 16).ok()?;
    let pid = u16::from_str_radix(caps.get(2)?.as_str(), 16).ok()?;
    Some((vid, pid))
}

/// `(vid, pid)` from a SetupAPI device instance id.
pub fn parse_setupapi_record(record: &str) -> Option<(u16, u16)> {
    let caps = SETUPAPI_REGEX.captures(record)?;
    let vid = u16::from_str_radix(caps.get(1)?.as_str(), 16).ok()?;
    let pid = u16::from_str_radix(caps.get(2)?.as_str(), 16).ok()?;
    Some((vid, pid))
}

/// `(vid, pid)` from an IOKit registry property dump.
pub fn parse_iokit_record(record: &str) -> Option<(u16, u16)> {
    let vid = IOKIT_VENDOR_REGEX
        .captures(record)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    let pid = IOKIT_PRODUCT_REGEX
        .captures(record)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    Some((vid, pid))
}

// =============================================================================
// Monitors
// =============================================================================

struct MonitorCore<B> {
    bus: Arc<B>,
    allow: UsbAllowList,
    source: Box<dyn HotplugSource>,
    timeout: Duration,
}

impl<B: UsbBus> MonitorCore<B> {
    fn tick(&mut self, name: &str, parse: fn(&str) -> Option<(u16, u16)>) -> LinkResult<Vec<DeviceId>> {
        let Some(record) = self.source.poll_event(self.timeout) else {
            return Ok(Vec::new());
        };
        trace!(monitor = name, record = %record, "Hotplug record");

        let Some((vid, pid)) = parse(&record) else {
            debug!(monitor = name, record = %record, "Hotplug record without vid/pid");
            return Ok(Vec::new());
        };
        if !self.allow.allows(vid, pid) {
            return Ok(Vec::new());
        }

        let found = query_bus(self.bus.as_ref(), &self.allow, Some((vid, pid)))?;
        debug!(
            monitor = name,
            vid = %format!("0x{vid:04x}"),
            pid = %format!("0x{pid:04x}"),
            count = found.len(),
            "Hotplug event matched allow-list"
        );
        Ok(found)
    }
}

macro_rules! platform_monitor {
    ($(#[$meta:meta])* $name:ident, $label:literal, $parse:path) => {
        $(#[$meta])*
        pub struct $name<B> {
            core: MonitorCore<B>,
        }

        impl<B: UsbBus> $name<B> {
            /// Monitor `source`, re-querying `bus` for allow-listed devices.
            pub fn new(
                bus: Arc<B>,
                allow: UsbAllowList,
                source: Box<dyn HotplugSource>,
                timeout: Duration,
            ) -> Self {
                Self {
                    core: MonitorCore {
                        bus,
                        allow,
                        source,
                        timeout,
                    },
                }
            }
        }

        impl<B: UsbBus> DiscoveryStrategy for $name<B> {
            fn name(&self) -> &str {
                $label
            }

            fn list_current_devices(&mut self) -> LinkResult<Vec<DeviceId>> {
                self.core.tick($label, $parse)
            }
        }
    };
}

platform_monitor!(
    /// Linux udev monitor.
    UdevMonitor,
    "udev",
    parse_udev_record
);

platform_monitor!(
    /// Windows SetupAPI device-notification monitor.
    SetupApiMonitor,
    "setupapi",
    parse_setupapi_record
);

platform_monitor!(
    /// macOS IOKit matching-notification monitor.
    IoKitMonitor,
    "iokit",
    parse_iokit_record
);

/// The monitor for `platform`, or `None` where no monitor exists (discovery then
/// keeps polling).
pub fn monitor_for_platform<B: UsbBus + 'static>(
    platform: Platform,
    bus: Arc<B>,
    allow: UsbAllowList,
    source: Box<dyn HotplugSource>,
    timeout: Duration,
) -> Option<Box<dyn DiscoveryStrategy>> {
    match platform {
        Platform::Linux => Some(Box::new(UdevMonitor::new(bus, allow, source, timeout))),
        Platform::Windows => Some(Box::new(SetupApiMonitor::new(bus, allow, source, timeout))),
        Platform::MacOs => Some(Box::new(IoKitMonitor::new(bus, allow, source, timeout))),
        Platform::Other => {
            debug!(%platform, "No hotplug monitor for platform");
            None
        }
    }
}

// =============================================================================
// nusb hotplug source
// =============================================================================

#[cfg(feature = "usb")]
pub use self::native::NusbHotplug;

#[cfg(feature = "usb")]
mod native {
    use std::time::Duration;

    use futures::{FutureExt, StreamExt};
    use nusb::hotplug::HotplugEvent;

    use super::HotplugSource;
    use crate::discovery::Platform;
    use crate::error::{LinkError, LinkResult};

    /// Hotplug records from nusb's device watcher, rendered in the platform's native
    /// record format so the platform monitor can parse them.
    pub struct NusbHotplug {
        watch: nusb::hotplug::HotplugWatch,
        platform: Platform,
    }

    impl NusbHotplug {
        /// Start watching.
        pub fn new(platform: Platform) -> LinkResult<Self> {
            let watch = nusb::watch_devices()
                .map_err(|e| LinkError::Transport(format!("USB hotplug watch: {e}")))?;
            Ok(Self { watch, platform })
        }

        fn render(&self, info: &nusb::DeviceInfo) -> String {
            let (vid, pid) = (info.vendor_id(), info.product_id());
            match self.platform {
                Platform::Linux => format!(
                    "ACTION=add\nSUBSYSTEM=usb\nPRODUCT={vid:x}/{pid:x}/{:x}",
                    info.device_version()
                ),
                Platform::Windows => format!("USB\\VID_{vid:04X}&PID_{pid:04X}"),
                Platform::MacOs | Platform::Other => {
                    format!("\"idVendor\" = {vid}\n\"idProduct\" = {pid}")
                }
            }
        }

        fn try_next(&mut self) -> Option<String> {
            loop {
                match self.watch.next().now_or_never()? {
                    Some(HotplugEvent::Connected(info)) => return Some(self.render(&info)),
                    Some(HotplugEvent::Disconnected(_)) => continue,
                    None => return None,
                }
            }
        }
    }

    impl HotplugSource for NusbHotplug {
        fn poll_event(&mut self, timeout: Duration) -> Option<String> {
            if let Some(record) = self.try_next() {
                return Some(record);
            }
            std::thread::sleep(timeout);
            self.try_next()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udev_record() {
        let rec = "ACTION=add\nDEVPATH=/devices/pci0000:00/usb1/1-2\nPRODUCT=24aa/4000/100\nTYPE=0/0/0";
        assert_eq!(parse_udev_record(rec), Some((0x24aa, 0x4000)));
        assert_eq!(parse_udev_record("ACTION=add\nSUBSYSTEM=usb"), None);
    }

    #[test]
    fn setupapi_record() {
        let rec = r"\\?\USB#VID_24AA&PID_1000#5&2b8a9c3&0&4#{a5dcbf10-6530-11d2-901f-00c04fb951ed}";
        assert_eq!(parse_setupapi_record(rec), Some((0x24aa, 0x1000)));
        assert_eq!(parse_setupapi_record(r"USB\vid_24aa&pid_2000\0001"), Some((0x24aa, 0x2000)));
    }

    #[test]
    fn iokit_record_is_decimal() {
        let rec = "\"idProduct\" = 16384\n\"idVendor\" = 9386\n\"USB Product Name\" = \"WP\"";
        assert_eq!(parse_iokit_record(rec), Some((9386, 16384)));
        assert_eq!(parse_iokit_record("idVendor = 9386"), None);
        assert_eq!(parse_iokit_record("idVendor = 99999\nidProduct = 1"), None);
    }

    #[test]
    fn replay_source_drains_in_order() {
        let mut src = ReplayHotplug::new(["a", "b"]);
        assert_eq!(src.poll_event(DEFAULT_EVENT_TIMEOUT).as_deref(), Some("a"));
        assert_eq!(src.poll_event(DEFAULT_EVENT_TIMEOUT).as_deref(), Some("b"));
        assert_eq!(src.poll_event(DEFAULT_EVENT_TIMEOUT), None);
    }

    #[test]
    fn channel_source_times_out_empty() {
        let (tx, mut src) = ChannelHotplug::channel();
        assert_eq!(src.poll_event(DEFAULT_EVENT_TIMEOUT), None);
        tx.send("PRODUCT=24aa/1000/0".into()).unwrap();
        assert!(src.poll_event(DEFAULT_EVENT_TIMEOUT).is_some());
    }
}
