//! Protocol constants for Nordic Secure DFU.

// Allow unused items - these are part of the protocol spec and may be used
// for future features like PRN-driven flow control.
#![allow(dead_code)]

use std::fmt;
use std::time::Duration;

// ============================================================================
// GATT UUIDs
// ============================================================================

/// Nordic DFU service (16-bit short form).
pub const DFU_SERVICE_UUID: &str = "fe59";

/// Control point characteristic: write-with-response, notify.
pub const DFU_CONTROL_POINT_UUID: &str = "8ec90001-f315-4f60-9fb8-838830daea50";

/// Packet characteristic: write-no-response.
pub const DFU_PACKET_UUID: &str = "8ec90002-f315-4f60-9fb8-838830daea50";

/// Buttonless DFU characteristic, unbonded variant.
pub const DFU_BUTTONLESS_UNBONDED_UUID: &str = "8ec90003-f315-4f60-9fb8-838830daea50";

/// Buttonless DFU characteristic, bonded variant.
pub const DFU_BUTTONLESS_BONDED_UUID: &str = "8ec90004-f315-4f60-9fb8-838830daea50";

// ============================================================================
// Transfer parameters
// ============================================================================

/// Packet characteristic write payload: legacy ATT_MTU (23) minus the
/// 3-byte attribute header.
pub const FRAGMENT_SIZE: usize = 20;

/// Pause after each packet fragment. Without it, write-without-response
/// packets are dropped by the host stack on macOS.
pub const FRAGMENT_DELAY: Duration = Duration::from_millis(10);

// ============================================================================
// Bootloader transition timing
// ============================================================================

/// Reconnect attempts after rebooting a device into its bootloader.
pub const RECONNECT_ATTEMPTS: u32 = 5;

/// Pause between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Grace period after a standalone enter-bootloader request, giving the
/// device time to drop the link before we do.
pub const BOOT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Prefix of a generated bootloader advertising name.
pub const ADV_NAME_PREFIX: &str = "Dfu";

/// Length of the random lowercase suffix in a generated advertising name.
pub const ADV_NAME_SUFFIX_LEN: usize = 10;

// ============================================================================
// Control point opcodes
// ============================================================================

/// Secure DFU control point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    ProtocolVersion = 0x00,
    ObjectCreate = 0x01,
    ReceiptNotifSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    MtuGet = 0x07,
    ObjectWrite = 0x08,
    Ping = 0x09,
    HardwareVersion = 0x0A,
    FirmwareVersion = 0x0B,
    Abort = 0x0C,
}

/// First byte of every control point response frame.
pub const CONTROL_RESPONSE_HEADER: u8 = 0x60;

// ============================================================================
// Buttonless opcodes
// ============================================================================

/// Buttonless DFU service opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ButtonlessOpCode {
    /// Reboot the application into the bootloader.
    EnterBootloader = 0x01,
    /// Change the name the bootloader will advertise under.
    SetAdvertisementName = 0x02,
}

/// First byte of every buttonless response frame.
pub const BUTTONLESS_RESPONSE_HEADER: u8 = 0x20;

// ============================================================================
// Object types
// ============================================================================

/// What a created or selected DFU object carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet (the `.dat` archive member).
    Command = 0x01,
    /// Firmware image (the `.bin` archive member).
    Data = 0x02,
}

impl ObjectType {
    /// Human-readable payload name for log output.
    pub fn describe(&self) -> &'static str {
        match self {
            ObjectType::Command => "init packet",
            ObjectType::Data => "firmware image",
        }
    }
}

// ============================================================================
// Result codes
// ============================================================================

/// Result codes carried in control and buttonless responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    InvalidCode = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
}

impl ResultCode {
    /// Parse a result code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ResultCode::InvalidCode),
            0x01 => Some(ResultCode::Success),
            0x02 => Some(ResultCode::OpCodeNotSupported),
            0x03 => Some(ResultCode::InvalidParameter),
            0x04 => Some(ResultCode::InsufficientResources),
            0x05 => Some(ResultCode::InvalidObject),
            0x07 => Some(ResultCode::UnsupportedType),
            0x08 => Some(ResultCode::OperationNotPermitted),
            0x0A => Some(ResultCode::OperationFailed),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ResultCode::InvalidCode => "invalid opcode",
            ResultCode::Success => "success",
            ResultCode::OpCodeNotSupported => "opcode not supported",
            ResultCode::InvalidParameter => "invalid parameter",
            ResultCode::InsufficientResources => "insufficient resources",
            ResultCode::InvalidObject => "invalid object",
            ResultCode::UnsupportedType => "unsupported object type",
            ResultCode::OperationNotPermitted => "operation not permitted",
            ResultCode::OperationFailed => "operation failed",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_round_trip() {
        for code in [
            ResultCode::InvalidCode,
            ResultCode::Success,
            ResultCode::OpCodeNotSupported,
            ResultCode::InvalidParameter,
            ResultCode::InsufficientResources,
            ResultCode::InvalidObject,
            ResultCode::UnsupportedType,
            ResultCode::OperationNotPermitted,
            ResultCode::OperationFailed,
        ] {
            assert_eq!(ResultCode::from_byte(code as u8), Some(code));
        }
    }

    #[test]
    fn test_result_code_unknown_bytes() {
        assert_eq!(ResultCode::from_byte(0x06), None);
        assert_eq!(ResultCode::from_byte(0x09), None);
        assert_eq!(ResultCode::from_byte(0x0B), None);
        assert_eq!(ResultCode::from_byte(0xFF), None);
    }

    #[test]
    fn test_result_code_display() {
        let rendered = ResultCode::InvalidObject.to_string();
        assert!(rendered.contains("invalid object"));
        assert!(rendered.contains("0x05"));
    }

    #[test]
    fn test_object_type_values() {
        assert_eq!(ObjectType::Command as u8, 0x01);
        assert_eq!(ObjectType::Data as u8, 0x02);
    }
}
