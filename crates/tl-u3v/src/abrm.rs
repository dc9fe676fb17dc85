//! ABRM/SBRM bootstrap register layouts.
//!
//! The Advanced Bootstrap Register Map is the fixed memory window every U3V
//! device exposes at address 0; it names the device and points at the
//! Streaming Bootstrap Register Map through `SBRM_ADDRESS`.

/// ABRM register offsets.
pub mod abrm {
    pub const GENCP_VERSION: u64 = 0x0000;
    pub const MANUFACTURER_NAME: u64 = 0x0004;
    pub const MODEL_NAME: u64 = 0x0044;
    pub const FAMILY_NAME: u64 = 0x0084;
    pub const DEVICE_VERSION: u64 = 0x00C4;
    pub const MANUFACTURER_INFO: u64 = 0x0104;
    pub const SERIAL_NUMBER: u64 = 0x0144;
    pub const USER_DEFINED_NAME: u64 = 0x0184;
    pub const SBRM_ADDRESS: u64 = 0x01C4;
    pub const DEVICE_CAPABILITY: u64 = 0x01CC;
    pub const MAX_DEVICE_RESPONSE_TIME_MS: u64 = 0x01D4;
    pub const MANIFEST_TABLE_ADDRESS: u64 = 0x01D8;
    pub const DEVICE_CONFIGURATION: u64 = 0x01E0;
    pub const HEARTBEAT_TIMEOUT: u64 = 0x01E8;

    /// Size of the fixed-length string registers.
    pub const STRING_SIZE: usize = 64;
}

/// SBRM register offsets, relative to the address read from
/// [`abrm::SBRM_ADDRESS`].
pub mod sbrm {
    pub const U3V_VERSION: u64 = 0x0000;
    pub const MAX_CMD_TRANSFER_SIZE: u64 = 0x0008;
    pub const MAX_ACK_TRANSFER_SIZE: u64 = 0x000C;
    pub const NUM_STREAM_CHANNELS: u64 = 0x0010;
    pub const SIRM_ADDRESS: u64 = 0x0014;
    pub const SIRM_LENGTH: u64 = 0x001C;
    pub const EIRM_ADDRESS: u64 = 0x0020;
    pub const EIRM_LENGTH: u64 = 0x0028;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_registers_do_not_overlap() {
        let strings = [
            abrm::MANUFACTURER_NAME,
            abrm::MODEL_NAME,
            abrm::FAMILY_NAME,
            abrm::DEVICE_VERSION,
            abrm::MANUFACTURER_INFO,
            abrm::SERIAL_NUMBER,
            abrm::USER_DEFINED_NAME,
        ];
        for pair in strings.windows(2) {
            assert!(pair[0] + abrm::STRING_SIZE as u64 <= pair[1]);
        }
        assert!(abrm::USER_DEFINED_NAME + abrm::STRING_SIZE as u64 <= abrm::SBRM_ADDRESS);
    }
}
