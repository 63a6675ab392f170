//! Typed session over any [`ControlTransfer`] endpoint.

use tracing::{debug, instrument};

use super::opcodes::{self, EEPROM_PAGE_SIZE};
use super::{ControlRequest, ControlTransfer};
use crate::capability::CapabilityWord;
use crate::error::{LinkError, LinkResult};

/// Typed commands for one connected spectrometer.
///
/// Wraps a transfer handle (real or simulated) and converts raw request/response bytes
/// to values. The capability word is read once and cached for the life of the session.
#[derive(Debug)]
pub struct Spectrometer<T> {
    link: T,
    capabilities: Option<CapabilityWord>,
}

impl<T: ControlTransfer> Spectrometer<T> {
    /// Wrap an open transfer handle.
    pub fn new(link: T) -> Self {
        Self {
            link,
            capabilities: None,
        }
    }

    /// Borrow the underlying handle.
    pub fn link(&self) -> &T {
        &self.link
    }

    /// Mutably borrow the underlying handle.
    pub fn link_mut(&mut self) -> &mut T {
        &mut self.link
    }

    /// Release the underlying handle.
    pub fn into_inner(self) -> T {
        self.link
    }

    fn read(&mut self, request: u8, value: u16, index: u16, min_len: usize) -> LinkResult<Vec<u8>> {
        let req = ControlRequest::read(request, value, index, min_len as u16);
        let resp = self.link.control_transfer(req)?;
        if resp.len() < min_len {
            return Err(LinkError::Transport(format!(
                "short response to {req}: expected {min_len} bytes, got {}",
                resp.len()
            )));
        }
        Ok(resp)
    }

    fn write(&mut self, request: u8, value: u16, index: u16) -> LinkResult<()> {
        self.link
            .control_transfer(ControlRequest::write(request, value, index))
            .map(|_| ())
    }

    fn read_u16(&mut self, request: u8) -> LinkResult<u16> {
        let resp = self.read(request, 0, 0, 2)?;
        Ok(u16::from_le_bytes([resp[0], resp[1]]))
    }

    /// Read and decode the compilation-options word.
    ///
    /// The first successful read is cached; later calls do not touch the device.
    #[instrument(skip(self))]
    pub fn read_capabilities(&mut self) -> LinkResult<CapabilityWord> {
        if let Some(cached) = self.capabilities {
            return Ok(cached);
        }
        let resp = self.read(
            opcodes::MULTIPLEXED,
            opcodes::READ_COMPILATION_OPTIONS,
            0,
            2,
        )?;
        let word = CapabilityWord::from_le_bytes(resp[0], resp[1]);
        debug!(raw = word.raw(), "Read compilation options");
        self.capabilities = Some(word);
        Ok(word)
    }

    /// Integration time in ms.
    pub fn integration_time_ms(&mut self) -> LinkResult<u32> {
        let resp = self.read(opcodes::GET_INTEGRATION_TIME, 0, 0, 3)?;
        Ok(u32::from_le_bytes([resp[0], resp[1], resp[2], 0]))
    }

    /// Set the integration time in ms. Values beyond 24 bits are rejected.
    pub fn set_integration_time_ms(&mut self, ms: u32) -> LinkResult<()> {
        if ms > opcodes::MAX_INTEGRATION_TIME_MS {
            return Err(LinkError::Configuration(format!(
                "integration time {ms} ms exceeds 24-bit register"
            )));
        }
        let (value, index) = opcodes::split_integration_time(ms);
        self.write(opcodes::SET_INTEGRATION_TIME, value, index)
    }

    /// Detector gain register.
    pub fn detector_gain(&mut self) -> LinkResult<u16> {
        self.read_u16(opcodes::GET_DETECTOR_GAIN)
    }

    /// Set the detector gain register.
    pub fn set_detector_gain(&mut self, gain: u16) -> LinkResult<()> {
        self.write(opcodes::SET_DETECTOR_GAIN, gain, 0)
    }

    /// Detector offset register.
    pub fn detector_offset(&mut self) -> LinkResult<u16> {
        self.read_u16(opcodes::GET_DETECTOR_OFFSET)
    }

    /// Set the detector offset register.
    pub fn set_detector_offset(&mut self, offset: u16) -> LinkResult<()> {
        self.write(opcodes::SET_DETECTOR_OFFSET, offset, 0)
    }

    /// Set the detector TEC setpoint; only the low 12 bits are sent.
    pub fn set_detector_setpoint(&mut self, setpoint: u16) -> LinkResult<()> {
        self.write(
            opcodes::SET_DETECTOR_SETPOINT,
            setpoint & opcodes::SETPOINT_MASK,
            0,
        )
    }

    /// Firmware code revision, rendered `a.b.c.d` (most significant last on the wire).
    pub fn firmware_revision(&mut self) -> LinkResult<String> {
        let resp = self.read(opcodes::GET_CODE_REVISION, 0, 0, 4)?;
        Ok(format!("{}.{}.{}.{}", resp[3], resp[2], resp[1], resp[0]))
    }

    /// FPGA revision string.
    pub fn fpga_revision(&mut self) -> LinkResult<String> {
        let resp = self
            .link
            .control_transfer(ControlRequest::read(opcodes::GET_FPGA_REVISION, 0, 0, 7))?;
        Ok(String::from_utf8_lossy(&resp)
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }

    /// Read `pages` consecutive EEPROM pages starting at page 0.
    pub fn read_eeprom(&mut self, pages: u16) -> LinkResult<Vec<[u8; EEPROM_PAGE_SIZE]>> {
        (0..pages)
            .map(|page| {
                let resp = self.read(
                    opcodes::MULTIPLEXED,
                    opcodes::READ_EEPROM,
                    page,
                    EEPROM_PAGE_SIZE,
                )?;
                let mut buf = [0u8; EEPROM_PAGE_SIZE];
                buf.copy_from_slice(&resp[..EEPROM_PAGE_SIZE]);
                Ok(buf)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SimulatedSpectrometer;

    /// Endpoint that answers every request with a fixed buffer.
    struct Fixed(Vec<u8>);

    impl ControlTransfer for Fixed {
        fn control_transfer(&mut self, _: ControlRequest) -> LinkResult<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn short_capability_response_is_transport_error() {
        let mut spec = Spectrometer::new(Fixed(vec![0x04]));
        let err = spec.read_capabilities().unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
    }

    #[test]
    fn capabilities_are_cached() {
        let mut spec = Spectrometer::new(Fixed(vec![0x40, 0x10]));
        let first = spec.read_capabilities().unwrap();
        spec.link_mut().0 = vec![0, 0];
        assert_eq!(spec.read_capabilities().unwrap(), first);
        assert!(first.has_area_scan);
    }

    #[test]
    fn integration_time_rejects_over_24_bits() {
        let mut spec = Spectrometer::new(SimulatedSpectrometer::new("s").unwrap());
        assert!(spec.set_integration_time_ms(0x0100_0000).is_err());
        spec.set_integration_time_ms(0x00FF_FFFF).unwrap();
        assert_eq!(spec.integration_time_ms().unwrap(), 0x00FF_FFFF);
    }

    #[test]
    fn default_firmware_revision_renders_dotted() {
        let mut spec = Spectrometer::new(SimulatedSpectrometer::new("s").unwrap());
        assert_eq!(spec.firmware_revision().unwrap(), "0.0.0.1");
        assert_eq!(spec.fpga_revision().unwrap(), "000-001");
    }
}
