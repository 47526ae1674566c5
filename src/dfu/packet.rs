//! Secure DFU frame encoding and decoding.
//!
//! Control point requests are an opcode byte followed by an
//! opcode-specific payload; responses are `0x60 || opcode || result ||
//! body`. The buttonless service uses the same shape with a `0x20`
//! response marker. All multi-byte integers are little-endian.

use super::config::{
    ButtonlessOpCode, ObjectType, OpCode, ResultCode, BUTTONLESS_RESPONSE_HEADER,
    CONTROL_RESPONSE_HEADER,
};
use super::error::{DfuError, DfuResult, ProtocolViolation};

// ============================================================================
// Control point request builders
// ============================================================================

/// Build an OBJECT_SELECT request.
pub fn select_request(object_type: ObjectType) -> Vec<u8> {
    vec![OpCode::ObjectSelect as u8, object_type as u8]
}

/// Build an OBJECT_CREATE request: type byte plus 32-bit object length.
pub fn create_request(object_type: ObjectType, length: u32) -> Vec<u8> {
    let mut request = Vec::with_capacity(6);
    request.push(OpCode::ObjectCreate as u8);
    request.push(object_type as u8);
    request.extend_from_slice(&length.to_le_bytes());
    request
}

/// Build a CRC_GET request.
pub fn crc_request() -> Vec<u8> {
    vec![OpCode::CrcGet as u8]
}

/// Build an OBJECT_EXECUTE request.
pub fn execute_request() -> Vec<u8> {
    vec![OpCode::ObjectExecute as u8]
}

/// Build a RECEIPT_NOTIF_SET request with a 16-bit receipt interval.
/// Zero disables periodic receipts.
pub fn receipt_notif_request(count: u16) -> Vec<u8> {
    let mut request = Vec::with_capacity(3);
    request.push(OpCode::ReceiptNotifSet as u8);
    request.extend_from_slice(&count.to_le_bytes());
    request
}

// ============================================================================
// Buttonless request builders
// ============================================================================

/// Build an enter-bootloader request.
pub fn enter_bootloader_request() -> Vec<u8> {
    vec![ButtonlessOpCode::EnterBootloader as u8]
}

/// Build a set-advertisement-name request: opcode, length byte, name.
pub fn set_adv_name_request(name: &str) -> Vec<u8> {
    debug_assert!(name.len() <= u8::MAX as usize);
    let mut request = Vec::with_capacity(2 + name.len());
    request.push(ButtonlessOpCode::SetAdvertisementName as u8);
    request.push(name.len() as u8);
    request.extend_from_slice(name.as_bytes());
    request
}

// ============================================================================
// Response parsing
// ============================================================================

/// Check the three-byte response preamble: header marker, echoed opcode,
/// result code. Returns the remaining body on success.
fn check_response<'a>(
    frame: &'a [u8],
    header: u8,
    request_opcode: u8,
) -> Result<&'a [u8], ProtocolViolation> {
    if frame.len() < 3 {
        return Err(ProtocolViolation::Truncated { len: frame.len() });
    }
    if frame[0] != header {
        return Err(ProtocolViolation::BadHeader(frame[0]));
    }
    if frame[1] != request_opcode {
        return Err(ProtocolViolation::OpcodeMismatch {
            expected: request_opcode,
            got: frame[1],
        });
    }
    match ResultCode::from_byte(frame[2]) {
        Some(ResultCode::Success) => Ok(&frame[3..]),
        Some(result) => Err(ProtocolViolation::Failure(result)),
        None => Err(ProtocolViolation::UnknownResult(frame[2])),
    }
}

/// Validate a control point response for `request_opcode` and return its
/// body.
pub fn parse_control_response(frame: &[u8], request_opcode: OpCode) -> DfuResult<Vec<u8>> {
    check_response(frame, CONTROL_RESPONSE_HEADER, request_opcode as u8)
        .map(|body| body.to_vec())
        .map_err(DfuError::ControlProtocol)
}

/// Validate a buttonless response for the request whose first byte is
/// `request_opcode`.
pub fn parse_buttonless_response(frame: &[u8], request_opcode: u8) -> DfuResult<()> {
    check_response(frame, BUTTONLESS_RESPONSE_HEADER, request_opcode)
        .map(|_| ())
        .map_err(DfuError::ButtonlessProtocol)
}

/// Body of an OBJECT_SELECT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectResponse {
    /// Object size ceiling for subsequent CREATE requests.
    pub max_size: u32,
    /// Resume point already present on the device.
    pub offset: u32,
    /// CRC-32 of the bytes up to `offset`.
    pub crc: u32,
}

impl SelectResponse {
    /// Parse the 12-byte little-endian SELECT response body.
    pub fn parse(body: &[u8]) -> DfuResult<Self> {
        if body.len() < 12 {
            return Err(DfuError::ControlProtocol(ProtocolViolation::Truncated {
                len: body.len(),
            }));
        }
        Ok(Self {
            max_size: read_u32_le(&body[0..4]),
            offset: read_u32_le(&body[4..8]),
            crc: read_u32_le(&body[8..12]),
        })
    }
}

/// Body of a CRC_GET response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumResponse {
    /// Bytes received by the device so far.
    pub offset: u32,
    /// CRC-32 over those bytes.
    pub crc: u32,
}

impl ChecksumResponse {
    /// Parse the 8-byte little-endian CRC_GET response body.
    pub fn parse(body: &[u8]) -> DfuResult<Self> {
        if body.len() < 8 {
            return Err(DfuError::ControlProtocol(ProtocolViolation::Truncated {
                len: body.len(),
            }));
        }
        Ok(Self {
            offset: read_u32_le(&body[0..4]),
            crc: read_u32_le(&body[4..8]),
        })
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_request_encoding() {
        assert_eq!(select_request(ObjectType::Command), vec![0x06, 0x01]);
        assert_eq!(select_request(ObjectType::Data), vec![0x06, 0x02]);
    }

    #[test]
    fn test_create_request_encoding() {
        assert_eq!(
            create_request(ObjectType::Data, 0x0001_0203),
            vec![0x01, 0x02, 0x03, 0x02, 0x01, 0x00]
        );
    }

    #[test]
    fn test_single_byte_requests() {
        assert_eq!(crc_request(), vec![0x03]);
        assert_eq!(execute_request(), vec![0x04]);
        assert_eq!(enter_bootloader_request(), vec![0x01]);
    }

    #[test]
    fn test_receipt_notif_request_encoding() {
        assert_eq!(receipt_notif_request(0), vec![0x02, 0x00, 0x00]);
        assert_eq!(receipt_notif_request(0x1234), vec![0x02, 0x34, 0x12]);
    }

    #[test]
    fn test_set_adv_name_request_encoding() {
        let request = set_adv_name_request("Dfuabcdefghij");
        assert_eq!(request[0], 0x02);
        assert_eq!(request[1], 13);
        assert_eq!(&request[2..], b"Dfuabcdefghij");
        assert_eq!(request.len(), 15);
    }

    #[test]
    fn test_parse_control_response_success() {
        let frame = [0x60, 0x03, 0x01, 0xAA, 0xBB];
        let body = parse_control_response(&frame, OpCode::CrcGet).unwrap();
        assert_eq!(body, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_control_response_bad_header() {
        let frame = [0x61, 0x03, 0x01];
        let err = parse_control_response(&frame, OpCode::CrcGet).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ControlProtocol(ProtocolViolation::BadHeader(0x61))
        ));
    }

    #[test]
    fn test_parse_control_response_opcode_mismatch() {
        let frame = [0x60, 0x04, 0x01];
        let err = parse_control_response(&frame, OpCode::CrcGet).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ControlProtocol(ProtocolViolation::OpcodeMismatch {
                expected: 0x03,
                got: 0x04,
            })
        ));
    }

    #[test]
    fn test_parse_control_response_failure_code() {
        let frame = [0x60, 0x01, 0x05];
        let err = parse_control_response(&frame, OpCode::ObjectCreate).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ControlProtocol(ProtocolViolation::Failure(ResultCode::InvalidObject))
        ));
    }

    #[test]
    fn test_parse_control_response_unknown_result() {
        let frame = [0x60, 0x01, 0xEE];
        let err = parse_control_response(&frame, OpCode::ObjectCreate).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ControlProtocol(ProtocolViolation::UnknownResult(0xEE))
        ));
    }

    #[test]
    fn test_parse_control_response_truncated() {
        let err = parse_control_response(&[0x60, 0x01], OpCode::ObjectCreate).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ControlProtocol(ProtocolViolation::Truncated { len: 2 })
        ));
    }

    #[test]
    fn test_parse_buttonless_response() {
        assert!(parse_buttonless_response(&[0x20, 0x01, 0x01], 0x01).is_ok());

        let err = parse_buttonless_response(&[0x60, 0x01, 0x01], 0x01).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ButtonlessProtocol(ProtocolViolation::BadHeader(0x60))
        ));

        let err = parse_buttonless_response(&[0x20, 0x02, 0x01], 0x01).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ButtonlessProtocol(ProtocolViolation::OpcodeMismatch { .. })
        ));

        let err = parse_buttonless_response(&[0x20, 0x01, 0x04], 0x01).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ButtonlessProtocol(ProtocolViolation::Failure(
                ResultCode::InsufficientResources
            ))
        ));
    }

    #[test]
    fn test_select_response_round_trip() {
        let mut body = Vec::new();
        body.extend_from_slice(&4096u32.to_le_bytes());
        body.extend_from_slice(&128u32.to_le_bytes());
        body.extend_from_slice(&0xCAFEBABEu32.to_le_bytes());

        let parsed = SelectResponse::parse(&body).unwrap();
        assert_eq!(
            parsed,
            SelectResponse {
                max_size: 4096,
                offset: 128,
                crc: 0xCAFEBABE,
            }
        );
    }

    #[test]
    fn test_select_response_truncated() {
        let err = SelectResponse::parse(&[0x00; 11]).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ControlProtocol(ProtocolViolation::Truncated { len: 11 })
        ));
    }

    #[test]
    fn test_checksum_response_round_trip() {
        let mut body = Vec::new();
        body.extend_from_slice(&9000u32.to_le_bytes());
        body.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let parsed = ChecksumResponse::parse(&body).unwrap();
        assert_eq!(
            parsed,
            ChecksumResponse {
                offset: 9000,
                crc: 0xDEADBEEF,
            }
        );
    }

    #[test]
    fn test_checksum_response_truncated() {
        let err = ChecksumResponse::parse(&[0x00; 7]).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ControlProtocol(ProtocolViolation::Truncated { len: 7 })
        ));
    }
}
