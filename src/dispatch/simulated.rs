//! Simulated spectrometer.
//!
//! A software double that answers control transfers exactly the way the firmware does,
//! through the same [`CommandTable`] contract, so sessions and discovery can be tested
//! without hardware.
//!
//! A simulator is addressed by a `MOCK:<name>:<directory>` identity and loads its
//! starting state from `<directory>/<name>.json`. Every field of that profile is
//! optional:
//!
//! ```json
//! {
//!   "integration_time_ms": 100,
//!   "detector_gain": 8,
//!   "compilation_options": 4161,
//!   "eeprom": [[83, 105, 109], [0, 1]],
//!   "spectra": [[100, 101, 99], [102, 100, 98]]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::opcodes::{self, EEPROM_PAGE_SIZE};
use super::{CommandKey, CommandKind, CommandTable, ControlRequest, ControlTransfer, Latched};
use crate::error::{LinkError, LinkResult};
use crate::identity::{DeviceId, DeviceKind};

/// Starting state of a simulated device, as stored in its JSON profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedProfile {
    /// Integration time in ms.
    pub integration_time_ms: u32,
    /// Detector gain register.
    pub detector_gain: u16,
    /// Detector offset register.
    pub detector_offset: u16,
    /// Detector TEC setpoint.
    pub detector_setpoint: u16,
    /// Firmware code revision bytes.
    pub code_revision: [u8; 4],
    /// FPGA revision string.
    pub fpga_revision: String,
    /// Compilation-options word.
    pub compilation_options: u16,
    /// EEPROM pages; short pages are zero-padded to 64 bytes, missing pages are zero.
    pub eeprom: Vec<Vec<u8>>,
    /// Spectra returned in rotation by [`SimulatedSpectrometer::read_spectrum`].
    pub spectra: Vec<Vec<u16>>,
}

impl Default for SimulatedProfile {
    fn default() -> Self {
        Self {
            integration_time_ms: 1000,
            detector_gain: 10,
            detector_offset: 1,
            detector_setpoint: 1,
            code_revision: [1, 0, 0, 0],
            fpga_revision: "000-001".to_string(),
            compilation_options: 0,
            eeprom: Vec::new(),
            spectra: Vec::new(),
        }
    }
}

impl SimulatedProfile {
    /// Load a profile from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> LinkResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Mutable device state the command handlers operate on.
#[derive(Debug, Clone)]
pub struct SimulatedState {
    /// Integration time in ms (24-bit).
    pub integration_time_ms: Latched<u32>,
    /// Detector gain.
    pub detector_gain: Latched<u16>,
    /// Detector offset.
    pub detector_offset: Latched<u16>,
    /// Detector setpoint (12-bit).
    pub detector_setpoint: Latched<u16>,
    code_revision: [u8; 4],
    fpga_revision: String,
    compilation_options: u16,
    eeprom: Vec<[u8; EEPROM_PAGE_SIZE]>,
}

impl SimulatedState {
    fn from_profile(profile: &SimulatedProfile) -> Self {
        let mut eeprom = vec![[0u8; EEPROM_PAGE_SIZE]; usize::from(opcodes::EEPROM_PAGES)];
        for (page, bytes) in eeprom.iter_mut().zip(&profile.eeprom) {
            let n = bytes.len().min(EEPROM_PAGE_SIZE);
            page[..n].copy_from_slice(&bytes[..n]);
        }
        Self {
            integration_time_ms: Latched::new(
                profile.integration_time_ms.min(opcodes::MAX_INTEGRATION_TIME_MS),
            ),
            detector_gain: Latched::new(profile.detector_gain),
            detector_offset: Latched::new(profile.detector_offset),
            detector_setpoint: Latched::new(profile.detector_setpoint & opcodes::SETPOINT_MASK),
            code_revision: profile.code_revision,
            fpga_revision: profile.fpga_revision.clone(),
            compilation_options: profile.compilation_options,
            eeprom,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

const ACK: u8 = 1;

fn set_integration_time(s: &mut SimulatedState, r: &ControlRequest) -> Vec<u8> {
    s.integration_time_ms
        .set(opcodes::join_integration_time(r.value, r.index));
    vec![ACK]
}

fn get_integration_time(s: &mut SimulatedState, _: &ControlRequest) -> Vec<u8> {
    let ms = s.integration_time_ms.get();
    ms.to_le_bytes()[..3].to_vec()
}

fn set_detector_gain(s: &mut SimulatedState, r: &ControlRequest) -> Vec<u8> {
    s.detector_gain.set(r.value);
    vec![ACK]
}

fn get_detector_gain(s: &mut SimulatedState, _: &ControlRequest) -> Vec<u8> {
    s.detector_gain.get().to_le_bytes().to_vec()
}

fn set_detector_offset(s: &mut SimulatedState, r: &ControlRequest) -> Vec<u8> {
    s.detector_offset.set(r.value);
    vec![ACK]
}

fn get_detector_offset(s: &mut SimulatedState, _: &ControlRequest) -> Vec<u8> {
    s.detector_offset.get().to_le_bytes().to_vec()
}

fn set_detector_setpoint(s: &mut SimulatedState, r: &ControlRequest) -> Vec<u8> {
    s.detector_setpoint.set(r.value & opcodes::SETPOINT_MASK);
    vec![ACK]
}

fn get_code_revision(s: &mut SimulatedState, _: &ControlRequest) -> Vec<u8> {
    s.code_revision.to_vec()
}

fn get_fpga_revision(s: &mut SimulatedState, _: &ControlRequest) -> Vec<u8> {
    s.fpga_revision.as_bytes().to_vec()
}

fn read_eeprom(s: &mut SimulatedState, r: &ControlRequest) -> Vec<u8> {
    s.eeprom
        .get(usize::from(r.index))
        .map(|page| page.to_vec())
        .unwrap_or_else(|| vec![0; EEPROM_PAGE_SIZE])
}

fn read_compilation_options(s: &mut SimulatedState, _: &ControlRequest) -> Vec<u8> {
    s.compilation_options.to_le_bytes().to_vec()
}

fn command_table() -> CommandTable<SimulatedState> {
    use opcodes::*;
    CommandTable::new()
        .settor(SET_INTEGRATION_TIME, "SET_INTEGRATION_TIME", set_integration_time)
        .gettor(GET_INTEGRATION_TIME, "GET_INTEGRATION_TIME", get_integration_time)
        .settor(SET_DETECTOR_GAIN, "SET_DETECTOR_GAIN", set_detector_gain)
        .gettor(GET_DETECTOR_GAIN, "GET_DETECTOR_GAIN", get_detector_gain)
        .settor(SET_DETECTOR_OFFSET, "SET_DETECTOR_OFFSET", set_detector_offset)
        .gettor(GET_DETECTOR_OFFSET, "GET_DETECTOR_OFFSET", get_detector_offset)
        .settor(SET_DETECTOR_SETPOINT, "SET_DETECTOR_SETPOINT", set_detector_setpoint)
        .gettor(GET_CODE_REVISION, "GET_CODE_REVISION", get_code_revision)
        .gettor(GET_FPGA_REVISION, "GET_FPGA_REVISION", get_fpga_revision)
        .register(
            CommandKey::value(MULTIPLEXED, READ_EEPROM),
            "READ_EEPROM",
            CommandKind::Gettor,
            read_eeprom,
        )
        .register(
            CommandKey::value(MULTIPLEXED, READ_COMPILATION_OPTIONS),
            "READ_COMPILATION_OPTIONS",
            CommandKind::Gettor,
            read_compilation_options,
        )
}

// =============================================================================
// SimulatedSpectrometer
// =============================================================================

/// Software spectrometer answering control transfers through a [`CommandTable`].
///
/// # Example
///
/// ```
/// use spectrolink::dispatch::{SimulatedSpectrometer, Spectrometer};
///
/// let mut spec = Spectrometer::new(SimulatedSpectrometer::new("sim")?);
/// spec.set_integration_time_ms(250)?;
/// assert_eq!(spec.integration_time_ms()?, 250);
/// # Ok::<(), spectrolink::LinkError>(())
/// ```
#[derive(Debug)]
pub struct SimulatedSpectrometer {
    identity: DeviceId,
    state: SimulatedState,
    table: CommandTable<SimulatedState>,
    spectra: Vec<Vec<u16>>,
    spectrum_index: usize,
    disconnected: bool,
}

impl SimulatedSpectrometer {
    /// Simulator with default state, not backed by any profile file.
    ///
    /// Fails if `name` is not a valid mock device name.
    pub fn new(name: &str) -> LinkResult<Self> {
        let identity = DeviceId::mock(name, "")?;
        Ok(Self::with_profile(identity, SimulatedProfile::default()))
    }

    /// Simulator with an explicit identity and profile.
    pub fn with_profile(identity: DeviceId, profile: SimulatedProfile) -> Self {
        Self {
            identity,
            state: SimulatedState::from_profile(&profile),
            table: command_table(),
            spectra: profile.spectra,
            spectrum_index: 0,
            disconnected: false,
        }
    }

    /// Open the simulator a `MOCK:` identity names, loading `<directory>/<name>.json`.
    ///
    /// A missing profile file yields default state; a malformed one is an error.
    pub fn open(identity: &DeviceId) -> LinkResult<Self> {
        let (Some(name), Some(directory)) = (identity.mock_name(), identity.directory()) else {
            return Err(LinkError::Configuration(format!(
                "{identity} is not a {} identity",
                DeviceKind::Mock.as_str()
            )));
        };
        let path = directory.join(format!("{name}.json"));
        let profile = if path.is_file() {
            info!(profile = %path.display(), "Loading simulator profile");
            SimulatedProfile::load(&path)?
        } else {
            debug!(profile = %path.display(), "No simulator profile, using defaults");
            SimulatedProfile::default()
        };
        Ok(Self::with_profile(identity.clone(), profile))
    }

    /// Identity of this simulator.
    pub fn identity(&self) -> &DeviceId {
        &self.identity
    }

    /// Current device state.
    pub fn state(&self) -> &SimulatedState {
        &self.state
    }

    /// Next spectrum from the profile, cycling; `None` if the profile has none.
    pub fn read_spectrum(&mut self) -> Option<Vec<u16>> {
        if self.disconnected || self.spectra.is_empty() {
            return None;
        }
        let spectrum = self.spectra[self.spectrum_index].clone();
        self.spectrum_index = (self.spectrum_index + 1) % self.spectra.len();
        Some(spectrum)
    }

    /// Simulate unplugging; later transfers fail.
    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }
}

impl ControlTransfer for SimulatedSpectrometer {
    fn control_transfer(&mut self, request: ControlRequest) -> LinkResult<Vec<u8>> {
        if self.disconnected {
            return Err(LinkError::Transport(format!(
                "{} is disconnected",
                self.identity
            )));
        }
        debug!(device = %self.identity, %request, "Simulator received control transfer");
        Ok(self.table.dispatch(&mut self.state, &request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::opcodes::*;

    #[test]
    fn set_integration_time_latches_and_reads_back() {
        let mut sim = SimulatedSpectrometer::new("sim").unwrap();
        assert!(!sim.state().integration_time_ms.explicitly_set());
        let ack = sim
            .control_transfer(ControlRequest::write(SET_INTEGRATION_TIME, 0x2345, 0x01))
            .unwrap();
        assert_eq!(ack, vec![1]);
        assert!(sim.state().integration_time_ms.explicitly_set());
        let resp = sim
            .control_transfer(ControlRequest::read(GET_INTEGRATION_TIME, 0, 0, 3))
            .unwrap();
        assert_eq!(resp, vec![0x45, 0x23, 0x01]);
    }

    #[test]
    fn setpoint_is_masked_to_12_bits() {
        let mut sim = SimulatedSpectrometer::new("sim").unwrap();
        sim.control_transfer(ControlRequest::write(SET_DETECTOR_SETPOINT, 0xFABC, 0))
            .unwrap();
        assert_eq!(sim.state().detector_setpoint.get(), 0x0ABC);
    }

    #[test]
    fn eeprom_page_comes_from_index() {
        let profile = SimulatedProfile {
            eeprom: vec![vec![0xAA; 3], vec![0xBB; 70]],
            ..SimulatedProfile::default()
        };
        let mut sim = SimulatedSpectrometer::with_profile(DeviceId::mock("e", "/x").unwrap(), profile);
        let page0 = sim
            .control_transfer(ControlRequest::read(MULTIPLEXED, READ_EEPROM, 0, 64))
            .unwrap();
        assert_eq!(page0.len(), 64);
        assert_eq!(&page0[..4], &[0xAA, 0xAA, 0xAA, 0x00]);
        let page1 = sim
            .control_transfer(ControlRequest::read(MULTIPLEXED, READ_EEPROM, 1, 64))
            .unwrap();
        assert!(page1.iter().all(|b| *b == 0xBB));
        let beyond = sim
            .control_transfer(ControlRequest::read(MULTIPLEXED, READ_EEPROM, 200, 64))
            .unwrap();
        assert_eq!(beyond, vec![0; 64]);
    }

    #[test]
    fn unknown_opcode_is_default_buffer() {
        let mut sim = SimulatedSpectrometer::new("sim").unwrap();
        let resp = sim
            .control_transfer(ControlRequest::read(0x42, 0, 0, 64))
            .unwrap();
        assert_eq!(resp, vec![0x01; 64]);
    }

    #[test]
    fn spectra_cycle_and_disconnect_stops_transfers() {
        let profile = SimulatedProfile {
            spectra: vec![vec![1, 2], vec![3, 4]],
            ..SimulatedProfile::default()
        };
        let mut sim = SimulatedSpectrometer::with_profile(DeviceId::mock("s", "/x").unwrap(), profile);
        assert_eq!(sim.read_spectrum(), Some(vec![1, 2]));
        assert_eq!(sim.read_spectrum(), Some(vec![3, 4]));
        assert_eq!(sim.read_spectrum(), Some(vec![1, 2]));
        sim.disconnect();
        assert_eq!(sim.read_spectrum(), None);
        let err = sim
            .control_transfer(ControlRequest::read(GET_DETECTOR_GAIN, 0, 0, 2))
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn open_rejects_non_mock_identity() {
        let err = SimulatedSpectrometer::open(&DeviceId::ble("WP-1")).unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }
}
