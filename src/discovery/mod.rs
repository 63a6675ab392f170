//! Device discovery.
//!
//! Each transport gets its own strategy; all of them answer "which devices are present
//! right now" with canonical [`DeviceId`]s.
//!
//! | Strategy | Transport | Model |
//! |---|---|---|
//! | [`usb::BusPolling`] | USB | full bus walk on every call |
//! | [`monitor::UdevMonitor`], [`monitor::SetupApiMonitor`], [`monitor::IoKitMonitor`] | USB | OS hotplug events |
//! | [`usb::UsbDiscovery`] | USB | polling during warm-up, then the platform monitor |
//! | [`ble::BleDiscovery`] | BLE | time-boxed async scan, event stream |
//! | [`directory::DirectoryWatch`] | virtual | configured watch directories |
//! | [`network::AddressList`] | TCP | configured address list |
//! | [`bus::DeviceBus`] | all | merged and de-duplicated |
//!
//! The host platform is always passed in as a [`Platform`] value, never sensed inside
//! a strategy, so each platform path can be tested anywhere.

pub mod ble;
pub mod bus;
pub mod directory;
pub mod monitor;
pub mod network;
pub mod usb;

use serde::{Deserialize, Serialize};

use crate::error::LinkResult;
use crate::identity::DeviceId;

pub use ble::{AdvertisementScanner, BleDiscovery, DiscoveryEvent};
pub use bus::DeviceBus;
pub use directory::DirectoryWatch;
pub use monitor::{monitor_for_platform, HotplugSource};
pub use network::{AddressList, TcpEndpoint};
pub use usb::{BusPolling, DiscoveryState, UsbBus, UsbDiscovery};

/// A synchronous discovery strategy.
pub trait DiscoveryStrategy: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Devices currently present, as seen by this strategy.
    fn list_current_devices(&mut self) -> LinkResult<Vec<DeviceId>>;
}

impl<T: DiscoveryStrategy + ?Sized> DiscoveryStrategy for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn list_current_devices(&mut self) -> LinkResult<Vec<DeviceId>> {
        (**self).list_current_devices()
    }
}

/// Operating-system family, selecting the USB hotplug monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// udev.
    Linux,
    /// SetupAPI.
    Windows,
    /// IOKit.
    #[serde(alias = "darwin")]
    MacOs,
    /// No monitor available; discovery stays in polling.
    Other,
}

impl Platform {
    /// The platform this binary was compiled for. Only binaries should call this;
    /// library code receives the platform as a parameter.
    pub fn host() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Other => "other",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Platform {
    type Err = crate::error::LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            "macos" | "darwin" => Ok(Platform::MacOs),
            "other" => Ok(Platform::Other),
            other => Err(crate::error::LinkError::Configuration(format!(
                "Unknown platform '{other}'. Must be one of: linux, windows, macos, other"
            ))),
        }
    }
}

/// One vendor and the product ids accepted for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedVendor {
    /// USB vendor id.
    pub vendor_id: u16,
    /// Accepted product ids.
    pub product_ids: Vec<u16>,
}

/// Vendor id → accepted product ids.
///
/// Devices are filtered by vendor first, then by that vendor's product list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsbAllowList {
    vendors: Vec<AllowedVendor>,
}

/// Vendor id of supported spectrometers.
pub const DEFAULT_VENDOR_ID: u16 = 0x24AA;

/// Product ids of supported spectrometers (FX2, ARM, InGaAs).
pub const DEFAULT_PRODUCT_IDS: [u16; 3] = [0x1000, 0x2000, 0x4000];

impl Default for UsbAllowList {
    fn default() -> Self {
        Self::empty().with_vendor(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_IDS)
    }
}

impl UsbAllowList {
    /// Allow nothing.
    pub fn empty() -> Self {
        Self {
            vendors: Vec::new(),
        }
    }

    /// Add (or extend) a vendor entry.
    pub fn with_vendor(mut self, vendor_id: u16, product_ids: impl IntoIterator<Item = u16>) -> Self {
        let product_ids = product_ids.into_iter();
        match self.vendors.iter_mut().find(|v| v.vendor_id == vendor_id) {
            Some(entry) => {
                for pid in product_ids {
                    if !entry.product_ids.contains(&pid) {
                        entry.product_ids.push(pid);
                    }
                }
            }
            None => self.vendors.push(AllowedVendor {
                vendor_id,
                product_ids: product_ids.collect(),
            }),
        }
        self
    }

    /// Product ids accepted for a vendor, if the vendor is listed.
    pub fn products(&self, vendor_id: u16) -> Option<&[u16]> {
        self.vendors
            .iter()
            .find(|v| v.vendor_id == vendor_id)
            .map(|v| v.product_ids.as_slice())
    }

    /// Whether a (vendor, product) pair is accepted.
    pub fn allows(&self, vendor_id: u16, product_id: u16) -> bool {
        self.products(vendor_id)
            .is_some_and(|pids| pids.contains(&product_id))
    }

    /// Whether no vendor is listed.
    pub fn is_empty(&self) -> bool {
        self.vendors.iter().all(|v| v.product_ids.is_empty())
    }

    /// Listed vendors.
    pub fn vendors(&self) -> &[AllowedVendor] {
        &self.vendors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allow_list() {
        let allow = UsbAllowList::default();
        assert!(allow.allows(0x24aa, 0x1000));
        assert!(allow.allows(0x24aa, 0x4000));
        assert!(!allow.allows(0x24aa, 0x3000));
        assert!(!allow.allows(0x0483, 0x1000));
        assert_eq!(allow.products(0x1234), None);
    }

    #[test]
    fn with_vendor_merges_products() {
        let allow = UsbAllowList::default().with_vendor(0x24aa, [0x1000, 0x5000]);
        assert_eq!(allow.products(0x24aa), Some(&[0x1000, 0x2000, 0x4000, 0x5000][..]));
        assert!(UsbAllowList::empty().is_empty());
    }

    #[test]
    fn platform_names() {
        assert_eq!(Platform::MacOs.to_string(), "macos");
        let p: Platform = serde_json::from_str("\"darwin\"").unwrap();
        assert_eq!(p, Platform::MacOs);
        assert_eq!("Windows".parse::<Platform>().unwrap(), Platform::Windows);
        assert!("beos".parse::<Platform>().is_err());
    }
}
