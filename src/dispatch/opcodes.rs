//! Vendor request opcodes.

/// Multiplexed request; the sub-opcode travels in `value`.
pub const MULTIPLEXED: u8 = 0xFF;

/// Set integration time: `value` = low 16 bits, `index` = high 8 bits (ms).
pub const SET_INTEGRATION_TIME: u8 = 0xB2;
/// Get integration time: 3 bytes, little-endian (ms).
pub const GET_INTEGRATION_TIME: u8 = 0xBF;
/// Set detector gain (raw 16-bit register).
pub const SET_DETECTOR_GAIN: u8 = 0xB7;
/// Get detector gain: 2 bytes, lsb first.
pub const GET_DETECTOR_GAIN: u8 = 0xC5;
/// Set detector offset.
pub const SET_DETECTOR_OFFSET: u8 = 0xB6;
/// Get detector offset: 2 bytes, lsb first.
pub const GET_DETECTOR_OFFSET: u8 = 0xC4;
/// Set detector TEC setpoint (12 bits).
pub const SET_DETECTOR_SETPOINT: u8 = 0xD8;
/// Get firmware code revision: 4 bytes.
pub const GET_CODE_REVISION: u8 = 0xC0;
/// Get FPGA revision: ASCII bytes.
pub const GET_FPGA_REVISION: u8 = 0xB4;

/// Sub-opcode of [`MULTIPLEXED`]: read one 64-byte EEPROM page (`index` = page).
pub const READ_EEPROM: u16 = 0x01;
/// Sub-opcode of [`MULTIPLEXED`]: read the 16-bit compilation-options word.
pub const READ_COMPILATION_OPTIONS: u16 = 0x04;

/// Size of one EEPROM page.
pub const EEPROM_PAGE_SIZE: usize = 64;
/// Number of EEPROM pages a device exposes.
pub const EEPROM_PAGES: u16 = 8;

/// Largest integration time the 24-bit register holds.
pub const MAX_INTEGRATION_TIME_MS: u32 = 0x00FF_FFFF;
/// Mask applied to the detector setpoint.
pub const SETPOINT_MASK: u16 = 0x0FFF;

/// Split a 24-bit integration time into `(value, index)` for [`SET_INTEGRATION_TIME`].
pub fn split_integration_time(ms: u32) -> (u16, u16) {
    let ms = ms.min(MAX_INTEGRATION_TIME_MS);
    ((ms & 0xFFFF) as u16, ((ms >> 16) & 0xFF) as u16)
}

/// Inverse of [`split_integration_time`].
pub fn join_integration_time(value: u16, index: u16) -> u32 {
    (u32::from(index & 0xFF) << 16) | u32::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_time_split_is_24_bit() {
        assert_eq!(split_integration_time(100), (100, 0));
        assert_eq!(split_integration_time(0x01_2345), (0x2345, 0x01));
        assert_eq!(join_integration_time(0x2345, 0x01), 0x01_2345);
        // clamped to the register width
        assert_eq!(split_integration_time(u32::MAX), (0xFFFF, 0xFF));
    }
}
