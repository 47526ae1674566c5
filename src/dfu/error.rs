//! Error types for the Secure DFU protocol implementation.

use thiserror::Error;

use super::config::ResultCode;
use crate::ble::BleError;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Standard I/O error while reading the firmware archive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The firmware archive is not a valid ZIP container.
    #[error("invalid firmware archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// The archive lacks a required member.
    #[error("no archive member ending in {suffix:?}")]
    MissingArchiveMember { suffix: &'static str },

    /// Transport-layer failure (connect, write, subscribe, link loss).
    #[error(transparent)]
    Ble(#[from] BleError),

    /// The device exposes neither the DFU characteristic pair nor a
    /// buttonless characteristic.
    #[error("device exposes no DFU characteristics")]
    NoDfuCharacteristics,

    /// Malformed or failed response on the DFU control point.
    #[error("control protocol error: {0}")]
    ControlProtocol(ProtocolViolation),

    /// Malformed or failed response on the buttonless characteristic.
    #[error("buttonless protocol error: {0}")]
    ButtonlessProtocol(ProtocolViolation),

    /// Device-reported checksum disagrees with the local computation.
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Device-reported offset disagrees with the bytes streamed so far.
    #[error("size mismatch: device reports offset {actual}, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The bootloader did not reappear after the reboot transition.
    #[error("bootloader did not reappear after {attempts} reconnect attempts")]
    ReconnectFailed { attempts: u32 },
}

/// How a response frame deviated from the protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("response is {len} bytes, shorter than the 3-byte header")]
    Truncated { len: usize },

    #[error("response header 0x{0:02X} is not a response marker")]
    BadHeader(u8),

    #[error("response is for opcode 0x{got:02X}, expected 0x{expected:02X}")]
    OpcodeMismatch { expected: u8, got: u8 },

    #[error("device rejected the request: {0}")]
    Failure(ResultCode),

    #[error("device reported undefined result code 0x{0:02X}")]
    UnknownResult(u8),

    #[error("a response arrived while the previous one was still pending")]
    UnexpectedFrame,

    #[error("device reported a maximum object size of zero")]
    ZeroMaxSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_messages() {
        let violation = ProtocolViolation::OpcodeMismatch {
            expected: 0x06,
            got: 0x03,
        };
        assert!(violation.to_string().contains("0x03"));
        assert!(violation.to_string().contains("0x06"));

        let failure = ProtocolViolation::Failure(ResultCode::InvalidObject);
        assert!(failure.to_string().contains("rejected"));
    }

    #[test]
    fn test_crc_mismatch_message() {
        let err = DfuError::CrcMismatch {
            expected: 0xDEADBEEF,
            actual: 0x12345678,
        };
        let message = err.to_string();
        assert!(message.contains("DEADBEEF"));
        assert!(message.contains("12345678"));
    }

    #[test]
    fn test_ble_error_is_transparent() {
        let err = DfuError::from(BleError::LinkLost);
        assert_eq!(err.to_string(), BleError::LinkLost.to_string());
    }
}
