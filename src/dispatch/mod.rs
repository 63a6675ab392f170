//! Opcode-addressed command dispatch.
//!
//! Spectrometers are driven with USB vendor control transfers: a direction, a one-byte
//! request code (the opcode), and two 16-bit parameters (`value`, `index`). Some opcodes
//! are *multiplexed*: request `0xFF` carries the actual command in `value`.
//!
//! This module holds the contract shared by every endpoint:
//!
//! - [`ControlRequest`] / [`ControlTransfer`]: one synchronous request/response exchange.
//!   Real USB devices ([`usb::UsbSpectrometer`], feature `usb`) and the
//!   [`simulated::SimulatedSpectrometer`] both implement it.
//! - [`CommandTable`]: the two-tier lookup a device uses to route a request to a handler.
//! - [`session::Spectrometer`]: typed getters/setters on top of any transfer.
//!
//! # Resolution
//!
//! ```text
//! request == 0xFF ?  --yes-->  (request, Value(value))  --hit--> handler
//!        |                               | miss
//!        no                              v
//!        +---------------------->  (request, Any)        --hit--> handler
//!                                        | miss
//!                                        v
//!                                 default response (64 x 0x01)
//! ```

pub mod opcodes;
pub mod session;
pub mod simulated;
#[cfg(feature = "usb")]
pub mod usb;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::LinkResult;

pub use session::Spectrometer;
pub use simulated::{SimulatedProfile, SimulatedSpectrometer};

/// Width of the default response returned for unmapped commands.
pub const DEFAULT_RESPONSE_WIDTH: usize = 64;

/// Fill byte of the default response.
pub const DEFAULT_RESPONSE_BYTE: u8 = 0x01;

// =============================================================================
// Wire request
// =============================================================================

/// Transfer direction, encoded as the USB `bmRequestType` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Vendor request, host to device (`0x40`).
    HostToDevice,
    /// Vendor request, device to host (`0xC0`).
    DeviceToHost,
}

impl Direction {
    /// `bmRequestType` value.
    pub fn request_type(self) -> u8 {
        match self {
            Direction::HostToDevice => 0x40,
            Direction::DeviceToHost => 0xC0,
        }
    }

    /// Parse a `bmRequestType` byte.
    pub fn from_request_type(byte: u8) -> Option<Self> {
        match byte {
            0x40 => Some(Direction::HostToDevice),
            0xC0 => Some(Direction::DeviceToHost),
            _ => None,
        }
    }
}

/// One control-transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// Transfer direction.
    pub direction: Direction,
    /// Opcode (`bRequest`).
    pub request: u8,
    /// `wValue`; the sub-opcode for multiplexed requests.
    pub value: u16,
    /// `wIndex`.
    pub index: u16,
    /// `wLength`: bytes expected back (device-to-host) or payload size.
    pub length: u16,
}

impl ControlRequest {
    /// Device-to-host read of `length` bytes.
    pub fn read(request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            direction: Direction::DeviceToHost,
            request,
            value,
            index,
            length,
        }
    }

    /// Host-to-device write with no data stage.
    pub fn write(request: u8, value: u16, index: u16) -> Self {
        Self {
            direction: Direction::HostToDevice,
            request,
            value,
            index,
            length: 0,
        }
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02x} req=0x{:02x} value=0x{:04x} index=0x{:04x} len={}",
            self.direction.request_type(),
            self.request,
            self.value,
            self.index,
            self.length
        )
    }
}

/// A device handle that can perform control transfers.
///
/// The handle is the implementing value itself; one exchange is in flight at a time,
/// which `&mut self` enforces.
pub trait ControlTransfer {
    /// Perform one exchange and return the response bytes.
    ///
    /// Host-to-device requests return whatever acknowledgement the endpoint produces
    /// (possibly empty).
    fn control_transfer(&mut self, request: ControlRequest) -> LinkResult<Vec<u8>>;
}

impl<T: ControlTransfer + ?Sized> ControlTransfer for &mut T {
    fn control_transfer(&mut self, request: ControlRequest) -> LinkResult<Vec<u8>> {
        (**self).control_transfer(request)
    }
}

impl<T: ControlTransfer + ?Sized> ControlTransfer for Box<T> {
    fn control_transfer(&mut self, request: ControlRequest) -> LinkResult<Vec<u8>> {
        (**self).control_transfer(request)
    }
}

// =============================================================================
// Command table
// =============================================================================

/// Second half of a command key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// Matches any `value`; used for every non-multiplexed opcode.
    Any,
    /// Matches one `value` of a multiplexed opcode.
    Value(u16),
}

/// Lookup key: opcode plus selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandKey {
    /// Opcode.
    pub request: u8,
    /// Selector.
    pub selector: Selector,
}

impl CommandKey {
    /// Key for a plain opcode.
    pub fn any(request: u8) -> Self {
        Self {
            request,
            selector: Selector::Any,
        }
    }

    /// Key for one sub-opcode of a multiplexed request.
    pub fn value(request: u8, value: u16) -> Self {
        Self {
            request,
            selector: Selector::Value(value),
        }
    }
}

/// Whether a handler writes device state or only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Writes state; must latch what it writes.
    Settor,
    /// Reads state.
    Gettor,
}

/// Handler signature: mutate or read the owning device state and produce a response.
pub type Handler<S> = fn(&mut S, &ControlRequest) -> Vec<u8>;

/// A table entry.
pub struct Command<S> {
    /// Human-readable name used in logs.
    pub name: &'static str,
    /// Settor or gettor.
    pub kind: CommandKind,
    /// The handler itself.
    pub handler: Handler<S>,
}

impl<S> Clone for Command<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Command<S> {}

impl<S> fmt::Debug for Command<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Opcode/selector keyed request table over device state `S`.
///
/// Built once when the device is constructed; never modified during dispatch.
pub struct CommandTable<S> {
    commands: HashMap<CommandKey, Command<S>>,
    multiplexed: u8,
    default_width: usize,
}

impl<S> fmt::Debug for CommandTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTable")
            .field("commands", &self.commands.len())
            .field("multiplexed", &self.multiplexed)
            .field("default_width", &self.default_width)
            .finish()
    }
}

impl<S> Default for CommandTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CommandTable<S> {
    /// Empty table with the standard multiplexed opcode and default width.
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            multiplexed: opcodes::MULTIPLEXED,
            default_width: DEFAULT_RESPONSE_WIDTH,
        }
    }

    /// Override the width of the default response.
    pub fn with_default_width(mut self, width: usize) -> Self {
        self.default_width = width;
        self
    }

    /// Register a handler. A later registration for the same key replaces the earlier.
    pub fn register(
        mut self,
        key: CommandKey,
        name: &'static str,
        kind: CommandKind,
        handler: Handler<S>,
    ) -> Self {
        self.commands.insert(
            key,
            Command {
                name,
                kind,
                handler,
            },
        );
        self
    }

    /// Register a settor for a plain opcode.
    pub fn settor(self, request: u8, name: &'static str, handler: Handler<S>) -> Self {
        self.register(CommandKey::any(request), name, CommandKind::Settor, handler)
    }

    /// Register a gettor for a plain opcode.
    pub fn gettor(self, request: u8, name: &'static str, handler: Handler<S>) -> Self {
        self.register(CommandKey::any(request), name, CommandKind::Gettor, handler)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The response returned for unmapped commands.
    pub fn default_response(&self) -> Vec<u8> {
        vec![DEFAULT_RESPONSE_BYTE; self.default_width]
    }

    /// Find the entry a request resolves to, without running it.
    pub fn resolve(&self, request: &ControlRequest) -> Option<&Command<S>> {
        if request.request == self.multiplexed {
            if let Some(cmd) = self
                .commands
                .get(&CommandKey::value(request.request, request.value))
            {
                return Some(cmd);
            }
        }
        self.commands.get(&CommandKey::any(request.request))
    }

    /// Route a request to its handler, or return the default response.
    ///
    /// Never fails: an unsupported command is the default buffer, not an error.
    pub fn dispatch(&self, state: &mut S, request: &ControlRequest) -> Vec<u8> {
        match self.resolve(request) {
            Some(cmd) => {
                trace!(command = cmd.name, kind = ?cmd.kind, %request, "Dispatching");
                (cmd.handler)(state, request)
            }
            None => {
                trace!(%request, "Unmapped command, returning default response");
                self.default_response()
            }
        }
    }
}

// =============================================================================
// Latched values
// =============================================================================

/// A settable value that remembers whether it was ever written explicitly.
///
/// The flag transitions `false -> true` on the first [`Latched::set`] and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Latched<T> {
    value: T,
    explicitly_set: bool,
}

impl<T: Copy> Latched<T> {
    /// Wrap an initial (not explicitly set) value.
    pub fn new(initial: T) -> Self {
        Self {
            value: initial,
            explicitly_set: false,
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.value
    }

    /// Write the value and latch the flag.
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.explicitly_set = true;
    }

    /// Whether a settor has ever written this value.
    pub fn explicitly_set(&self) -> bool {
        self.explicitly_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        plain: Latched<u16>,
        sub: u16,
    }

    fn set_plain(s: &mut Counter, r: &ControlRequest) -> Vec<u8> {
        s.plain.set(r.value);
        vec![1]
    }

    fn read_sub(s: &mut Counter, r: &ControlRequest) -> Vec<u8> {
        s.sub = r.index;
        vec![0xAB]
    }

    fn table() -> CommandTable<Counter> {
        CommandTable::new()
            .settor(0x10, "SET_PLAIN", set_plain)
            .register(
                CommandKey::value(0xFF, 0x01),
                "READ_SUB",
                CommandKind::Gettor,
                read_sub,
            )
    }

    #[test]
    fn unmapped_request_returns_default_buffer() {
        let mut state = Counter::default();
        let resp = table().dispatch(&mut state, &ControlRequest::read(0x99, 0, 0, 64));
        assert_eq!(resp, vec![0x01; 64]);
    }

    #[test]
    fn multiplexed_uses_value_selector() {
        let mut state = Counter::default();
        let t = table();
        let resp = t.dispatch(&mut state, &ControlRequest::read(0xFF, 0x01, 3, 64));
        assert_eq!(resp, vec![0xAB]);
        assert_eq!(state.sub, 3);
        // a different sub-opcode on the multiplexed request falls through to default
        let resp = t.dispatch(&mut state, &ControlRequest::read(0xFF, 0x02, 0, 64));
        assert_eq!(resp.len(), DEFAULT_RESPONSE_WIDTH);
    }

    #[test]
    fn plain_opcode_ignores_value() {
        let mut state = Counter::default();
        let t = table();
        assert!(!state.plain.explicitly_set());
        t.dispatch(&mut state, &ControlRequest::write(0x10, 7, 0));
        t.dispatch(&mut state, &ControlRequest::write(0x10, 9, 0));
        assert_eq!(state.plain.get(), 9);
        assert!(state.plain.explicitly_set());
    }

    #[test]
    fn sibling_sub_opcodes_resolve_to_distinct_handlers() {
        fn read_other(_: &mut Counter, _: &ControlRequest) -> Vec<u8> {
            vec![0xCD]
        }
        let t = table().register(
            CommandKey::value(0xFF, 0x02),
            "READ_OTHER",
            CommandKind::Gettor,
            read_other,
        );
        let mut state = Counter::default();
        assert_eq!(t.dispatch(&mut state, &ControlRequest::read(0xFF, 0x01, 0, 1)), vec![0xAB]);
        assert_eq!(t.dispatch(&mut state, &ControlRequest::read(0xFF, 0x02, 0, 1)), vec![0xCD]);
    }

    #[test]
    fn multiplexed_miss_falls_back_to_any() {
        let mut state = Counter::default();
        let t = table().register(CommandKey::any(0xFF), "CATCH_ALL", CommandKind::Gettor, |_, _| {
            vec![0xEE]
        });
        let resp = t.dispatch(&mut state, &ControlRequest::read(0xFF, 0x42, 0, 1));
        assert_eq!(resp, vec![0xEE]);
        assert_eq!(t.resolve(&ControlRequest::read(0xFF, 0x01, 0, 1)).map(|c| c.name), Some("READ_SUB"));
    }

    #[test]
    fn default_width_is_configurable() {
        let t: CommandTable<Counter> = CommandTable::new().with_default_width(8);
        assert!(t.is_empty());
        assert_eq!(t.default_response(), vec![0x01; 8]);
    }

    #[test]
    fn direction_bytes() {
        assert_eq!(Direction::HostToDevice.request_type(), 0x40);
        assert_eq!(Direction::from_request_type(0xC0), Some(Direction::DeviceToHost));
        assert_eq!(Direction::from_request_type(0x21), None);
    }
}
