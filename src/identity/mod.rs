//! Canonical device identity.
//!
//! A [`DeviceId`] names one spectrometer regardless of which transport or operating
//! system surfaced it. Every identity has a canonical string encoding:
//!
//! ```text
//! USB:0x<vid:4hex>:0x<pid:4hex>:<bus:int>:<address:int>
//! FILE:<directory>
//! BLE:<serialNumber>
//! TCP:<address>:<port:int>
//! MOCK:<name>:<directory>
//! ```
//!
//! Equality, ordering, and hashing are all defined over that string, never over raw
//! fields, so two identities are equal iff their canonical strings are equal. The string
//! is computed once at construction and cached; identities are immutable afterwards.
//!
//! # Example
//!
//! ```
//! use spectrolink::identity::DeviceId;
//!
//! let id = DeviceId::usb(0x24aa, 0x4000, 1, 7);
//! assert_eq!(id.to_string(), "USB:0x24aa:0x4000:1:7");
//! let parsed: DeviceId = "USB:0x24aa:0x4000:1:7".parse().unwrap();
//! assert_eq!(id, parsed);
//! ```

pub mod descriptor;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{LinkError, LinkResult};

pub use descriptor::{probe_diagnostic, probe_structured, BusPosition, UsbDescriptor};

/// Transport discriminant of a [`DeviceId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Direct USB.
    Usb,
    /// Bluetooth Low Energy.
    Ble,
    /// Network spectrometer.
    Tcp,
    /// Watch-directory virtual spectrometer.
    File,
    /// Simulated device.
    Mock,
}

impl DeviceKind {
    /// Canonical-string prefix for this kind (without the trailing `:`).
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Usb => "USB",
            DeviceKind::Ble => "BLE",
            DeviceKind::Tcp => "TCP",
            DeviceKind::File => "FILE",
            DeviceKind::Mock => "MOCK",
        }
    }
}

/// Per-kind fields of an identity.
#[derive(Debug, Clone)]
enum Fields {
    Usb(UsbCoordinates),
    Ble { serial_number: String },
    Tcp { address: String, port: u16 },
    File { directory: String },
    Mock {
        name: String,
        directory: String,
        derived: UsbCoordinates,
    },
}

/// Vendor/product ids plus bus position of a USB (or simulated USB) device.
///
/// `bus` and `address` are `-1` when the position could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbCoordinates {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Bus number, or `-1` if unknown.
    pub bus: i32,
    /// Device address on the bus, or `-1` if unknown.
    pub address: i32,
}

impl UsbCoordinates {
    /// Whether bus and address both resolved to real values.
    pub fn is_resolved(&self) -> bool {
        self.bus >= 0 && self.address >= 0
    }

    /// Derive stable pseudo-coordinates from a mock device name.
    ///
    /// SHA-256 is used rather than `std::hash` so the result does not change between
    /// processes or toolchain versions.
    fn derive_from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        UsbCoordinates {
            vendor_id: u16::from_be_bytes([digest[0], digest[1]]),
            product_id: u16::from_be_bytes([digest[2], digest[3]]),
            bus: i32::from(digest[4]),
            address: i32::from(digest[5]),
        }
    }
}

/// Canonical, transport-agnostic identity of a spectrometer.
#[derive(Clone)]
pub struct DeviceId {
    fields: Fields,
    canonical: String,
}

impl DeviceId {
    fn build(fields: Fields) -> Self {
        let canonical = match &fields {
            Fields::Usb(c) => format!(
                "USB:0x{:04x}:0x{:04x}:{}:{}",
                c.vendor_id, c.product_id, c.bus, c.address
            ),
            Fields::Ble { serial_number } => format!("BLE:{serial_number}"),
            Fields::Tcp { address, port } => format!("TCP:{address}:{port}"),
            Fields::File { directory } => format!("FILE:{directory}"),
            Fields::Mock {
                name, directory, ..
            } => format!("MOCK:{name}:{directory}"),
        };
        Self { fields, canonical }
    }

    /// USB identity from explicit coordinates.
    pub fn usb(vendor_id: u16, product_id: u16, bus: i32, address: i32) -> Self {
        Self::build(Fields::Usb(UsbCoordinates {
            vendor_id,
            product_id,
            bus,
            address,
        }))
    }

    /// BLE identity; the serial number is the advertised local name.
    pub fn ble(serial_number: impl Into<String>) -> Self {
        Self::build(Fields::Ble {
            serial_number: serial_number.into(),
        })
    }

    /// Network identity.
    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self::build(Fields::Tcp {
            address: address.into(),
            port,
        })
    }

    /// Watch-directory identity.
    ///
    /// Fails if the path is not valid UTF-8.
    pub fn file(directory: impl AsRef<Path>) -> LinkResult<Self> {
        let directory = utf8_directory(directory.as_ref())?;
        Ok(Self::build(Fields::File { directory }))
    }

    /// Simulated-device identity.
    ///
    /// Fails if `name` contains `:` or the directory is not valid UTF-8, since either
    /// would make the canonical string ambiguous.
    pub fn mock(name: impl Into<String>, directory: impl AsRef<Path>) -> LinkResult<Self> {
        let name = name.into();
        if name.contains(':') {
            return Err(LinkError::Configuration(format!(
                "Mock device name '{name}' must not contain ':'"
            )));
        }
        let directory = utf8_directory(directory.as_ref())?;
        Ok(Self::mock_unchecked(name, directory))
    }

    fn mock_unchecked(name: String, directory: String) -> Self {
        let derived = UsbCoordinates::derive_from_name(&name);
        Self::build(Fields::Mock {
            name,
            directory,
            derived,
        })
    }

    /// Parse a canonical identity string.
    pub fn parse(s: &str) -> LinkResult<Self> {
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| LinkError::parse(s, "missing kind prefix"))?;

        match prefix {
            "USB" => {
                let parts: Vec<&str> = rest.split(':').collect();
                if parts.len() != 4 {
                    return Err(LinkError::parse(
                        s,
                        format!("expected 4 USB fields, found {}", parts.len()),
                    ));
                }
                let vendor_id = parse_hex16(s, parts[0], "vendor id")?;
                let product_id = parse_hex16(s, parts[1], "product id")?;
                let bus = parse_int(s, parts[2], "bus")?;
                let address = parse_int(s, parts[3], "address")?;
                Ok(Self::usb(vendor_id, product_id, bus, address))
            }
            "BLE" => Ok(Self::ble(rest)),
            "FILE" => Ok(Self::build(Fields::File {
                directory: rest.to_string(),
            })),
            "TCP" => {
                let (address, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| LinkError::parse(s, "TCP id needs <address>:<port>"))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|e| LinkError::parse(s, format!("bad port '{port}': {e}")))?;
                Ok(Self::tcp(address, port))
            }
            "MOCK" => {
                let (name, directory) = rest
                    .split_once(':')
                    .ok_or_else(|| LinkError::parse(s, "MOCK id needs <name>:<directory>"))?;
                Ok(Self::mock_unchecked(name.to_string(), directory.to_string()))
            }
            other => Err(LinkError::parse(s, format!("unknown kind '{other}'"))),
        }
    }

    /// The canonical string.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Transport discriminant.
    pub fn kind(&self) -> DeviceKind {
        match self.fields {
            Fields::Usb(_) => DeviceKind::Usb,
            Fields::Ble { .. } => DeviceKind::Ble,
            Fields::Tcp { .. } => DeviceKind::Tcp,
            Fields::File { .. } => DeviceKind::File,
            Fields::Mock { .. } => DeviceKind::Mock,
        }
    }

    /// USB coordinates for `Usb` identities, or the name-derived ones for `Mock`.
    pub fn usb_coordinates(&self) -> Option<UsbCoordinates> {
        match &self.fields {
            Fields::Usb(c) => Some(*c),
            Fields::Mock { derived, .. } => Some(*derived),
            _ => None,
        }
    }

    /// BLE serial number.
    pub fn serial_number(&self) -> Option<&str> {
        match &self.fields {
            Fields::Ble { serial_number } => Some(serial_number),
            _ => None,
        }
    }

    /// TCP address and port.
    pub fn socket(&self) -> Option<(&str, u16)> {
        match &self.fields {
            Fields::Tcp { address, port } => Some((address, *port)),
            _ => None,
        }
    }

    /// Directory for `File` and `Mock` identities.
    pub fn directory(&self) -> Option<&Path> {
        match &self.fields {
            Fields::File { directory } | Fields::Mock { directory, .. } => {
                Some(Path::new(directory))
            }
            _ => None,
        }
    }

    /// Mock device name.
    pub fn mock_name(&self) -> Option<&str> {
        match &self.fields {
            Fields::Mock { name, .. } => Some(name),
            _ => None,
        }
    }
}

fn utf8_directory(path: &Path) -> LinkResult<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        LinkError::Configuration(format!(
            "Directory '{}' is not valid UTF-8",
            path.display()
        ))
    })
}

fn parse_hex16(input: &str, field: &str, what: &str) -> LinkResult<u16> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .ok_or_else(|| LinkError::parse(input, format!("{what} '{field}' lacks 0x prefix")))?;
    if digits.len() != 4 {
        return Err(LinkError::parse(
            input,
            format!("{what} '{field}' must have 4 hex digits"),
        ));
    }
    u16::from_str_radix(digits, 16)
        .map_err(|e| LinkError::parse(input, format!("{what} '{field}': {e}")))
}

fn parse_int(input: &str, field: &str, what: &str) -> LinkResult<i32> {
    field
        .parse::<i32>()
        .map_err(|e| LinkError::parse(input, format!("{what} '{field}': {e}")))
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.canonical)
    }
}

impl FromStr for DeviceId {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for DeviceId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for DeviceId {}

impl PartialOrd for DeviceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Hash for DeviceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DeviceId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A device seen by an event- or scan-based discovery strategy.
///
/// Carries no transport handle; the handle is re-acquired at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Identity of the discovered device.
    pub identity: DeviceId,
    /// Human-readable name for selection lists.
    pub display_name: String,
    /// Received signal strength in dBm, where the transport reports one.
    pub signal_strength: Option<i16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn usb_canonical_is_lowercase_zero_padded() {
        let id = DeviceId::usb(0x24AA, 0x1000, 3, 12);
        assert_eq!(id.canonical(), "USB:0x24aa:0x1000:3:12");
        assert_eq!(id.kind(), DeviceKind::Usb);
    }

    #[test]
    fn unresolved_usb_keeps_sentinels() {
        let id = DeviceId::usb(0x24aa, 0x4000, -1, -1);
        assert_eq!(id.canonical(), "USB:0x24aa:0x4000:-1:-1");
        assert!(!id.usb_coordinates().unwrap().is_resolved());
        assert_eq!(DeviceId::parse(id.canonical()).unwrap(), id);
    }

    #[test]
    fn parse_accepts_uppercase_hex() {
        let id = DeviceId::parse("USB:0x24AA:0x4000:1:2").unwrap();
        assert_eq!(id.canonical(), "USB:0x24aa:0x4000:1:2");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in [
            "",
            "USB",
            "usb:0x24aa:0x4000:1:2",
            "USB:24aa:0x4000:1:2",
            "USB:0x24aa:0x4000:1",
            "USB:0x24aa:0x4000:one:2",
            "USB:0x24aaa:0x4000:1:2",
            "TCP:host",
            "TCP:host:99999",
            "MOCK:nodir",
            "SERIAL:/dev/ttyUSB0",
        ] {
            assert!(
                matches!(DeviceId::parse(bad), Err(LinkError::Parse { .. })),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn tcp_splits_on_last_colon() {
        let id = DeviceId::parse("TCP:fe80::1:8080").unwrap();
        assert_eq!(id.socket(), Some(("fe80::1", 8080)));
    }

    #[test]
    fn file_directory_may_contain_colons() {
        let id = DeviceId::parse(r"FILE:C:\spectra\watch").unwrap();
        assert_eq!(id.kind(), DeviceKind::File);
        assert_eq!(id.canonical(), r"FILE:C:\spectra\watch");
    }

    #[test]
    fn mock_coordinates_are_stable_per_name() {
        let a = DeviceId::mock("WP-00887", "/tmp/profiles").unwrap();
        let b = DeviceId::mock("WP-00887", "/elsewhere").unwrap();
        let c = DeviceId::mock("WP-00888", "/tmp/profiles").unwrap();
        assert_eq!(a.usb_coordinates(), b.usb_coordinates());
        assert_ne!(a.usb_coordinates(), c.usb_coordinates());
        // differing directory still means a different identity
        assert_ne!(a, b);
    }

    #[test]
    fn equality_and_hash_follow_canonical_string() {
        let a = DeviceId::usb(0x24aa, 0x4000, 1, 2);
        let b: DeviceId = "USB:0x24AA:0x4000:1:2".parse().unwrap();
        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
    }

    #[test]
    fn mock_name_with_colon_is_rejected() {
        let err = DeviceId::mock("a:b", "/x").unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));

        // The only identity that renders as this string keeps the whole tail as directory.
        let parsed = DeviceId::parse("MOCK:a:b:/x").unwrap();
        assert_eq!(parsed.mock_name(), Some("a"));
        assert_eq!(parsed.directory(), Some(Path::new("b:/x")));
        assert_eq!(parsed, DeviceId::mock("a", "b:/x").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_directories_are_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let a = Path::new(OsStr::from_bytes(b"/watch/\xff"));
        let b = Path::new(OsStr::from_bytes(b"/watch/\xfe"));
        assert!(matches!(DeviceId::file(a), Err(LinkError::Configuration(_))));
        assert!(DeviceId::file(b).is_err());
        assert!(DeviceId::mock("bench", a).is_err());
    }

    #[test]
    fn serde_uses_canonical_string() {
        let id = DeviceId::ble("WP-01234");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"BLE:WP-01234\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<DeviceId>("\"NOPE:1\"").is_err());
    }
}
