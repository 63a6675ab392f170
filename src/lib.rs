//! # spectrolink
//!
//! Identity, discovery, and low-level command dispatch for spectrometers reachable over
//! USB, Bluetooth LE, TCP, or a shared watch directory.
//!
//! ## Crate Structure
//!
//! - **`identity`**: `DeviceId`, the canonical transport-agnostic device identity, and the
//!   probe chain that builds one from a USB descriptor.
//! - **`discovery`**: per-transport discovery strategies (USB polling, OS hotplug monitors,
//!   BLE scanning, watch directories, TCP address lists) and the `DeviceBus` aggregator.
//! - **`dispatch`**: the vendor control-transfer contract, the opcode command table, a
//!   simulated spectrometer, and the typed `Spectrometer` session.
//! - **`capability`**: decoder for the firmware compilation-options word.
//! - **`transport`**: the file-backed virtual spectrometer.
//! - **`config`**: figment-based configuration (`config/spectrolink.toml` plus environment).
//! - **`tracing_init`**: subscriber setup for binaries.
//! - **`error`**: the crate-wide `LinkError`.
//!
//! Native backends are behind features: `usb` (nusb) and `ble` (btleplug).

pub mod capability;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod tracing_init;
pub mod transport;

pub use capability::{decode_capability_word, CapabilityWord};
pub use error::{LinkError, LinkResult};
pub use identity::{DeviceId, DeviceKind, DiscoveredDevice};
