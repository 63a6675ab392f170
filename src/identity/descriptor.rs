//! USB descriptor resolution.
//!
//! Different OS/USB backend combinations expose a device's bus position through
//! different surfaces. Some hand out structured bus/address fields, others only a
//! textual dump such as `DEVICE ID 24aa:4000 on Bus 001 Address 005`. Building a
//! [`DeviceId`] from a descriptor therefore walks an ordered probe chain:
//!
//! 1. [`probe_structured`]: read the descriptor's typed accessors.
//! 2. [`probe_diagnostic`]: pattern-match the diagnostic text.
//! 3. Sentinel: `bus = address = -1`, logged at `error` level. The identity is still
//!    usable for addressing within this process, but its position is unreliable.
//!
//! Vendor and product ids go through the same chain (`ID <vid>:<pid>` in the text,
//! then `0`).

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, warn};

use super::DeviceId;

static BUS_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bBus\s+(\d+)\s+Address\s+(\d+)").expect("Invalid bus/address regex")
});

static VID_PID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bID\s+([0-9a-f]{4}):([0-9a-f]{4})\b").expect("Invalid vid/pid regex")
});

/// Transport-provided USB device descriptor.
///
/// Every structured accessor is optional; a backend implements the ones it can answer.
/// `diagnostic_text` must always render something, even if it is only a type name.
pub trait UsbDescriptor {
    /// USB vendor id, if exposed.
    fn vendor_id(&self) -> Option<u16> {
        None
    }

    /// USB product id, if exposed.
    fn product_id(&self) -> Option<u16> {
        None
    }

    /// Bus number, if exposed.
    fn bus(&self) -> Option<i32> {
        None
    }

    /// Device address, if exposed.
    fn address(&self) -> Option<i32> {
        None
    }

    /// iProduct string, if the backend read it.
    fn product_string(&self) -> Option<String> {
        None
    }

    /// iSerialNumber string, if the backend read it.
    fn serial_string(&self) -> Option<String> {
        None
    }

    /// Textual diagnostic form of the descriptor.
    fn diagnostic_text(&self) -> String;
}

/// Result of one probe step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusPosition {
    /// Bus number.
    pub bus: i32,
    /// Address on the bus.
    pub address: i32,
}

/// Step 1: structured bus/address fields.
pub fn probe_structured<D: UsbDescriptor + ?Sized>(descriptor: &D) -> Option<BusPosition> {
    match (descriptor.bus(), descriptor.address()) {
        (Some(bus), Some(address)) => Some(BusPosition { bus, address }),
        _ => None,
    }
}

/// Step 2: `Bus <n> Address <n>` in the diagnostic text.
pub fn probe_diagnostic(text: &str) -> Option<BusPosition> {
    let caps = BUS_ADDRESS_REGEX.captures(text)?;
    let bus = caps.get(1)?.as_str().parse().ok()?;
    let address = caps.get(2)?.as_str().parse().ok()?;
    Some(BusPosition { bus, address })
}

/// `ID <vid>:<pid>` in the diagnostic text.
pub fn probe_diagnostic_ids(text: &str) -> Option<(u16, u16)> {
    let caps = VID_PID_REGEX.captures(text)?;
    let vid = u16::from_str_radix(caps.get(1)?.as_str(), 16).ok()?;
    let pid = u16::from_str_radix(caps.get(2)?.as_str(), 16).ok()?;
    Some((vid, pid))
}

impl DeviceId {
    /// Build a `Usb` identity from a transport descriptor.
    ///
    /// Never fails; see the module docs for the resolution chain.
    pub fn from_descriptor<D: UsbDescriptor + ?Sized>(descriptor: &D) -> Self {
        // Render lazily: some backends do real work to produce the dump.
        let mut text: Option<String> = None;
        let mut diagnostic = || -> String {
            text.get_or_insert_with(|| descriptor.diagnostic_text())
                .clone()
        };

        let (vendor_id, product_id) = match (descriptor.vendor_id(), descriptor.product_id()) {
            (Some(vid), Some(pid)) => (vid, pid),
            (vid, pid) => match probe_diagnostic_ids(&diagnostic()) {
                Some((text_vid, text_pid)) => (vid.unwrap_or(text_vid), pid.unwrap_or(text_pid)),
                None => {
                    warn!(
                        descriptor = %diagnostic(),
                        "Cannot determine vendor/product id, using 0"
                    );
                    (vid.unwrap_or(0), pid.unwrap_or(0))
                }
            },
        };

        let position = probe_structured(descriptor).or_else(|| {
            let text = diagnostic();
            let found = probe_diagnostic(&text);
            if found.is_some() {
                debug!(descriptor = %text, "Resolved bus/address from diagnostic text");
            }
            found
        });

        let BusPosition { bus, address } = match position {
            Some(position) => position,
            None => {
                error!(
                    vid = %format!("0x{vendor_id:04x}"),
                    pid = %format!("0x{product_id:04x}"),
                    descriptor = %diagnostic(),
                    "Unable to determine USB bus/address; identity position is unreliable"
                );
                BusPosition { bus: -1, address: -1 }
            }
        };

        DeviceId::usb(vendor_id, product_id, bus, address)
    }
}
