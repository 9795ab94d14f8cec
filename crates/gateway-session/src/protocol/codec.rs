//! Command envelope encoding and decoding.
//!
//! Every command travels in the same envelope:
//!
//! | offset | field    | size |
//! |--------|----------|------|
//! | 0      | session  | 1    |
//! | 1      | length   | 1    |
//! | 2..4   | opcode   | 2    |
//! | 4..N   | payload  | var  |
//! | N      | checksum | 1    |
//!
//! `length` is the total envelope length minus two, the opcode is big-endian
//! and the checksum is the XOR of every byte before it.

use crate::error::{CodecError, ProtocolError};
use crate::protocol::message::{OpcodeRef, Record, Request};
use crate::protocol::registry::OpcodeRegistry;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

/// Session byte used in outgoing envelopes.
pub const SESSION_BYTE: u8 = 0;

/// Session byte, length and opcode.
pub const HEADER_LEN: usize = 4;

/// Envelope with an empty payload.
pub const MIN_ENVELOPE_LEN: usize = HEADER_LEN + 1;

/// Largest envelope the length byte can describe.
pub const MAX_ENVELOPE_LEN: usize = u8::MAX as usize + 2;

/// Largest payload that fits an envelope.
pub const MAX_PAYLOAD_LEN: usize = MAX_ENVELOPE_LEN - MIN_ENVELOPE_LEN;

/// XOR of all bytes, folded left to right.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}

/// Resolve a request's opcode to its numeric value and registry name.
///
/// # Errors
///
/// Returns an error if the registry does not know the opcode.
pub fn resolve<R>(registry: &R, opcode: &OpcodeRef) -> Result<(u16, &'static str), CodecError>
where
    R: OpcodeRegistry + ?Sized,
{
    let id = match opcode {
        OpcodeRef::Id(id) => *id,
        OpcodeRef::Name(name) => registry
            .opcode_for_name(name)
            .ok_or_else(|| CodecError::UnknownName(name.clone()))?,
    };
    let name = registry
        .name_for_opcode(id)
        .ok_or(CodecError::UnknownOpcode(id))?;
    Ok((id, name))
}

/// Encode a request into an envelope.
///
/// # Errors
///
/// Returns an error if the opcode is unknown, has no payload encoder, or the
/// encoder rejects the request fields. An opcode without an encoder is never
/// sendable.
pub fn encode<R>(registry: &R, request: &Request) -> Result<Bytes, CodecError>
where
    R: OpcodeRegistry + ?Sized,
{
    let (opcode, name) = resolve(registry, &request.opcode)?;
    let encoder = registry
        .payload_encoder(name)
        .ok_or(CodecError::MissingEncoder(name))?;
    let payload = encoder(&request.fields)?;
    encode_envelope(opcode, &payload)
}

/// Wrap an already encoded payload in an envelope.
///
/// # Errors
///
/// Returns an error if the payload does not fit the length byte.
pub fn encode_envelope(opcode: u16, payload: &[u8]) -> Result<Bytes, CodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let total = MIN_ENVELOPE_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(SESSION_BYTE);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u8((total - 2) as u8);
    buf.put_u16(opcode);
    buf.put_slice(payload);
    let sum = checksum(&buf);
    buf.put_u8(sum);

    Ok(buf.freeze())
}

/// Check that an envelope is long enough, agrees with its length byte and
/// carries a valid checksum.
///
/// # Errors
///
/// Returns the first problem found with the envelope.
pub fn verify(bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() <= HEADER_LEN {
        return Err(ProtocolError::Truncated(bytes.len()));
    }

    let declared = usize::from(bytes[1]);
    if declared != bytes.len() - 2 {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: bytes.len() - 2,
        });
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 1);
    let expected = checksum(body);
    let actual = trailer[0];
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Decode an envelope.
///
/// Envelopes of four bytes or fewer yield a record without opcode. Otherwise
/// the header is always parsed; payload fields are only decoded when the
/// checksum matches, a payload is present and the registry has a decoder.
pub fn decode<R>(registry: &R, bytes: &[u8]) -> Record
where
    R: OpcodeRegistry + ?Sized,
{
    if bytes.len() <= HEADER_LEN {
        return Record::invalid(bytes.first().copied().unwrap_or(SESSION_BYTE));
    }

    let opcode = u16::from_be_bytes([bytes[2], bytes[3]]);
    let mut record = Record {
        id: bytes[0],
        opcode: Some(opcode),
        opcode_name: registry.name_for_opcode(opcode),
        checksum_valid: checksum(&bytes[..bytes.len() - 1]) == bytes[bytes.len() - 1],
        fields: crate::protocol::message::Fields::new(),
    };

    if !record.checksum_valid || bytes.len() <= MIN_ENVELOPE_LEN {
        return record;
    }

    let decoder = record
        .opcode_name
        .and_then(|name| registry.payload_decoder(name));
    if let Some(decoder) = decoder {
        match decoder(&bytes[HEADER_LEN..bytes.len() - 1]) {
            Ok(fields) => record.fields = fields,
            Err(e) => warn!("Failed to decode payload of {:#06x}: {}", opcode, e),
        }
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::registry::{LOGIN_REQUEST, PASSWORD_LEN, StandardRegistry};
    use proptest::prelude::*;

    #[test]
    fn test_password_request_layout() {
        let request = Request::by_name(LOGIN_REQUEST).with_field("password", "secret");
        let bytes = encode(&StandardRegistry, &request).unwrap();

        assert_eq!(bytes.len(), MIN_ENVELOPE_LEN + PASSWORD_LEN);
        assert_eq!(bytes[0], 0x00);
        assert_eq!(usize::from(bytes[1]), bytes.len() - 2);
        assert_eq!(&bytes[2..4], &[0x30, 0x00]);
        assert_eq!(&bytes[4..10], b"secret");
        assert_eq!(bytes[bytes.len() - 1], checksum(&bytes[..bytes.len() - 1]));
    }

    #[test]
    fn test_encode_by_opcode() {
        let bytes = encode(&StandardRegistry, &Request::by_opcode(0x000C)).unwrap();

        assert_eq!(&bytes[..], &[0x00, 0x03, 0x00, 0x0C, 0x0F]);
    }

    #[test]
    fn test_encode_without_encoder() {
        let request = Request::by_name("GW_GET_STATE_CFM");

        assert_eq!(
            encode(&StandardRegistry, &request),
            Err(CodecError::MissingEncoder("GW_GET_STATE_CFM"))
        );
        assert_eq!(
            encode(&StandardRegistry, &Request::by_name("GW_NOPE_REQ")),
            Err(CodecError::UnknownName("GW_NOPE_REQ".to_string()))
        );
        assert_eq!(
            encode(&StandardRegistry, &Request::by_opcode(0xBEEF)),
            Err(CodecError::UnknownOpcode(0xBEEF))
        );
    }

    #[test]
    fn test_payload_too_large() {
        assert!(encode_envelope(0x0001, &[0; MAX_PAYLOAD_LEN]).is_ok());
        assert_eq!(
            encode_envelope(0x0001, &[0; MAX_PAYLOAD_LEN + 1]),
            Err(CodecError::PayloadTooLarge {
                size: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN,
            })
        );
    }

    #[test]
    fn test_decode_short_input() {
        let record = decode(&StandardRegistry, &[0x00, 0x03, 0x00, 0x0D]);

        assert_eq!(record.opcode, None);
        assert_eq!(record.opcode_name, None);
        assert!(!record.checksum_valid);
        assert!(record.fields.is_empty());
        assert_eq!(decode(&StandardRegistry, &[]).opcode, None);
    }

    #[test]
    fn test_decode_confirmation() {
        let bytes = encode_envelope(0x3001, &[1]).unwrap();
        let record = decode(&StandardRegistry, &bytes);

        assert_eq!(record.opcode, Some(0x3001));
        assert_eq!(record.opcode_name, Some("GW_PASSWORD_ENTER_CFM"));
        assert!(record.checksum_valid);
        assert_eq!(record.field_u64("status"), Some(1));
    }

    #[test]
    fn test_decode_checksum_mismatch_keeps_header() {
        let mut bytes = encode_envelope(0x3001, &[1]).unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let record = decode(&StandardRegistry, &bytes);

        assert_eq!(record.opcode, Some(0x3001));
        assert_eq!(record.opcode_name, Some("GW_PASSWORD_ENTER_CFM"));
        assert!(!record.checksum_valid);
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let bytes = encode_envelope(0xBEEF, &[1, 2, 3]).unwrap();
        let record = decode(&StandardRegistry, &bytes);

        assert_eq!(record.opcode, Some(0xBEEF));
        assert_eq!(record.opcode_name, None);
        assert!(record.checksum_valid);
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_decode_short_payload_keeps_header() {
        let bytes = encode_envelope(0x0211, &[1]).unwrap();
        let record = decode(&StandardRegistry, &bytes);

        assert_eq!(record.opcode_name, Some("GW_NODE_STATE_POSITION_CHANGED_NTF"));
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_verify() {
        assert_eq!(verify(&[0, 3, 0]), Err(ProtocolError::Truncated(3)));
        assert!(verify(&[0x00, 0x03, 0x00, 0x0C, 0x0F]).is_ok());
        assert_eq!(
            verify(&[0x00, 0x03, 0x00, 0x0C, 0x0E]),
            Err(ProtocolError::ChecksumMismatch {
                expected: 0x0F,
                actual: 0x0E,
            })
        );
    }

    #[test]
    fn test_verify_length_byte() {
        // Valid checksum, but the length byte claims one byte more.
        let mut bytes = vec![0x00, 0x04, 0x00, 0x0C];
        bytes.push(checksum(&bytes));

        assert_eq!(
            verify(&bytes),
            Err(ProtocolError::LengthMismatch {
                declared: 4,
                actual: 3,
            })
        );
        assert!(decode(&StandardRegistry, &bytes).checksum_valid);
    }

    const REQUESTS: &[&str] = &[
        "GW_REBOOT_REQ",
        "GW_GET_VERSION_REQ",
        "GW_GET_PROTOCOL_VERSION_REQ",
        "GW_GET_STATE_REQ",
        "GW_LEAVE_LEARN_STATE_REQ",
        "GW_HOUSE_STATUS_MONITOR_ENABLE_REQ",
        "GW_HOUSE_STATUS_MONITOR_DISABLE_REQ",
        "GW_PASSWORD_ENTER_REQ",
    ];

    proptest! {
        #[test]
        fn prop_encoded_requests_decode_to_same_opcode(
            index in 0..REQUESTS.len(),
            password in "[a-zA-Z0-9]{0,32}",
        ) {
            let name = REQUESTS[index];
            let request = Request::by_name(name).with_field("password", password);
            let bytes = encode(&StandardRegistry, &request).unwrap();
            let record = decode(&StandardRegistry, &bytes);

            prop_assert_eq!(record.opcode, StandardRegistry.opcode_for_name(name));
            prop_assert_eq!(record.opcode_name, Some(name));
            prop_assert!(record.checksum_valid);
        }

        #[test]
        fn prop_single_bit_flip_breaks_checksum(
            opcode in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..MAX_PAYLOAD_LEN),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut bytes = encode_envelope(opcode, &payload).unwrap().to_vec();
            prop_assert!(verify(&bytes).is_ok());

            let index = position.index(bytes.len());
            bytes[index] ^= 1 << bit;

            prop_assert!(verify(&bytes).is_err());
            prop_assert!(!decode(&StandardRegistry, &bytes).checksum_valid);
        }
    }
}
