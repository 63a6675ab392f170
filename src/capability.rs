//! Firmware compilation-options ("capability word") decoding.
//!
//! The FPGA firmware of a spectrometer reports which optional features were compiled
//! in as a single 16-bit word, read with the `READ_COMPILATION_OPTIONS` command.
//!
//! ```text
//! bits  0-2   0000 0000 0000 0111  integration time resolution
//! bits  3-5   0000 0000 0011 1000  data header
//! bit     6   0000 0000 0100 0000  has CF select
//! bits  7-8   0000 0001 1000 0000  laser type
//! bits 9-11   0000 1110 0000 0000  laser control
//! bit    12   0001 0000 0000 0000  has area scan
//! bit    13   0010 0000 0000 0000  has actual integration time
//! bit    14   0100 0000 0000 0000  has horizontal binning
//! bit    15   1000 0000 0000 0000  reserved
//! ```
//!
//! Decoding is total: every word produces a value, and codes outside the known set
//! decode to an `Unknown(code)` variant whose label is `"unknown"`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Label shared by every out-of-range code.
pub const UNKNOWN_LABEL: &str = "unknown";

macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// Code outside the known set.
            Unknown(u8),
        }

        impl $name {
            /// Map a raw field value to a variant.
            pub fn from_code(code: u8) -> Self {
                match code {
                    $( $code => $name::$variant, )+
                    other => $name::Unknown(other),
                }
            }

            /// Raw field value.
            pub fn code(self) -> u8 {
                match self {
                    $( $name::$variant => $code, )+
                    $name::Unknown(other) => other,
                }
            }

            /// Fixed human-readable label, `"unknown"` for unrecognized codes.
            pub fn label(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                    $name::Unknown(_) => UNKNOWN_LABEL,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

coded_enum! {
    /// Granularity of the integration-time register.
    IntegrationTimeResolution {
        /// 1 ms steps.
        OneMs = 0 => "1ms",
        /// 10 ms steps.
        TenMs = 1 => "10ms",
        /// Selectable at runtime.
        Switchable = 2 => "switchable",
    }
}

coded_enum! {
    /// Header prepended to spectrum frames.
    DataHeader {
        /// No header.
        None = 0 => "none",
        /// Ocean Optics compatible header.
        OceanOptics = 1 => "ocean optics",
        /// Native header.
        Wasatch = 2 => "wasatch",
    }
}

coded_enum! {
    /// Where the excitation laser lives.
    LaserType {
        /// No laser.
        None = 0 => "none",
        /// Laser inside the unit.
        Internal = 1 => "internal",
        /// Externally connected laser.
        External = 2 => "external",
    }
}

coded_enum! {
    /// How laser power is controlled.
    LaserControl {
        /// PWM modulation.
        Modulation = 0 => "modulation",
        /// Transition points.
        TransitionPoints = 1 => "transition points",
        /// Ramping.
        Ramping = 2 => "ramping",
    }
}

/// Decoded compilation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityWord {
    raw: u16,
    /// Bits 0–2.
    pub integration_time_resolution: IntegrationTimeResolution,
    /// Bits 3–5.
    pub data_header: DataHeader,
    /// Bit 6.
    pub has_cf_select: bool,
    /// Bits 7–8.
    pub laser_type: LaserType,
    /// Bits 9–11.
    pub laser_control: LaserControl,
    /// Bit 12.
    pub has_area_scan: bool,
    /// Bit 13.
    pub has_actual_integ_time: bool,
    /// Bit 14.
    pub has_horiz_binning: bool,
}

impl CapabilityWord {
    /// Word this value was decoded from.
    pub fn raw(&self) -> u16 {
        self.raw
    }

    /// Build the word from its little-endian two-byte wire form.
    pub fn from_le_bytes(lsb: u8, msb: u8) -> Self {
        decode_capability_word(u16::from_le_bytes([lsb, msb]))
    }
}

impl Default for CapabilityWord {
    fn default() -> Self {
        decode_capability_word(0)
    }
}

impl fmt::Display for CapabilityWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resolution={} header={} cf_select={} laser_type={} laser_control={} \
             area_scan={} actual_integ_time={} horiz_binning={}",
            self.integration_time_resolution,
            self.data_header,
            self.has_cf_select,
            self.laser_type,
            self.laser_control,
            self.has_area_scan,
            self.has_actual_integ_time,
            self.has_horiz_binning
        )
    }
}

fn field(word: u16, shift: u32, width: u32) -> u8 {
    ((word >> shift) & ((1 << width) - 1)) as u8
}

fn flag(word: u16, bit: u32) -> bool {
    word & (1 << bit) != 0
}

/// Decode a 16-bit compilation-options word. Total and side-effect free apart from a
/// `debug` log line.
pub fn decode_capability_word(word: u16) -> CapabilityWord {
    let decoded = CapabilityWord {
        raw: word,
        integration_time_resolution: IntegrationTimeResolution::from_code(field(word, 0, 3)),
        data_header: DataHeader::from_code(field(word, 3, 3)),
        has_cf_select: flag(word, 6),
        laser_type: LaserType::from_code(field(word, 7, 2)),
        laser_control: LaserControl::from_code(field(word, 9, 3)),
        has_area_scan: flag(word, 12),
        has_actual_integ_time: flag(word, 13),
        has_horiz_binning: flag(word, 14),
    };
    debug!(word = %format!("0x{word:04x}"), options = %decoded, "Decoded compilation options");
    decoded
}

/// Label for an integration-time-resolution code.
pub fn stringify_resolution(code: u8) -> &'static str {
    IntegrationTimeResolution::from_code(code).label()
}

/// Label for a data-header code.
pub fn stringify_header(code: u8) -> &'static str {
    DataHeader::from_code(code).label()
}

/// Label for a laser-type code.
pub fn stringify_laser_type(code: u8) -> &'static str {
    LaserType::from_code(code).label()
}

/// Label for a laser-control code.
pub fn stringify_laser_control(code: u8) -> &'static str {
    LaserControl::from_code(code).label()
}
