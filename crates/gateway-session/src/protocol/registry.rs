//! Opcode registry: names, numeric opcodes and payload layouts.

use crate::error::CodecError;
use crate::protocol::message::Fields;
use bytes::{Buf, BufMut};
use serde_json::Value;

/// Builds a payload from request fields.
pub type PayloadEncoder = fn(&Fields) -> Result<Vec<u8>, CodecError>;

/// Decodes a payload into fields.
pub type PayloadDecoder = fn(&[u8]) -> Result<Fields, CodecError>;

/// Request sent after the transport opens.
pub const LOGIN_REQUEST: &str = "GW_PASSWORD_ENTER_REQ";

/// Request sent when the connection has been idle.
pub const KEEPALIVE_REQUEST: &str = "GW_GET_STATE_REQ";

/// `status` value of a login confirmation that accepted the password.
pub const LOGIN_ACCEPTED: u64 = 1;

/// Fixed size of the password field.
pub const PASSWORD_LEN: usize = 32;

/// Lookup table between opcode names, numeric opcodes and payload codecs.
///
/// A registry used with a session must know [`LOGIN_REQUEST`] and
/// [`KEEPALIVE_REQUEST`] together with their confirmations.
pub trait OpcodeRegistry: Send + Sync + 'static {
    /// Name registered for a numeric opcode.
    fn name_for_opcode(&self, opcode: u16) -> Option<&'static str>;

    /// Numeric opcode registered under a name.
    fn opcode_for_name(&self, name: &str) -> Option<u16>;

    /// Payload encoder for a named opcode.
    fn payload_encoder(&self, name: &str) -> Option<PayloadEncoder>;

    /// Payload decoder for a named opcode.
    fn payload_decoder(&self, name: &str) -> Option<PayloadDecoder>;
}

struct OpcodeEntry {
    name: &'static str,
    opcode: u16,
    encoder: Option<PayloadEncoder>,
    decoder: Option<PayloadDecoder>,
}

const fn request(name: &'static str, opcode: u16, encoder: PayloadEncoder) -> OpcodeEntry {
    OpcodeEntry {
        name,
        opcode,
        encoder: Some(encoder),
        decoder: None,
    }
}

const fn reply(name: &'static str, opcode: u16, decoder: Option<PayloadDecoder>) -> OpcodeEntry {
    OpcodeEntry {
        name,
        opcode,
        encoder: None,
        decoder,
    }
}

const OPCODES: &[OpcodeEntry] = &[
    reply("GW_ERROR_NTF", 0x0000, Some(decode_error_ntf)),
    request("GW_REBOOT_REQ", 0x0001, encode_empty),
    reply("GW_REBOOT_CFM", 0x0002, None),
    request("GW_GET_VERSION_REQ", 0x0008, encode_empty),
    reply("GW_GET_VERSION_CFM", 0x0009, Some(decode_version_cfm)),
    request("GW_GET_PROTOCOL_VERSION_REQ", 0x000A, encode_empty),
    reply(
        "GW_GET_PROTOCOL_VERSION_CFM",
        0x000B,
        Some(decode_protocol_version_cfm),
    ),
    request("GW_GET_STATE_REQ", 0x000C, encode_empty),
    reply("GW_GET_STATE_CFM", 0x000D, Some(decode_state_cfm)),
    request("GW_LEAVE_LEARN_STATE_REQ", 0x000E, encode_empty),
    reply("GW_LEAVE_LEARN_STATE_CFM", 0x000F, Some(decode_status_cfm)),
    reply(
        "GW_NODE_STATE_POSITION_CHANGED_NTF",
        0x0211,
        Some(decode_position_changed_ntf),
    ),
    request("GW_HOUSE_STATUS_MONITOR_ENABLE_REQ", 0x0240, encode_empty),
    reply("GW_HOUSE_STATUS_MONITOR_ENABLE_CFM", 0x0241, None),
    request("GW_HOUSE_STATUS_MONITOR_DISABLE_REQ", 0x0242, encode_empty),
    reply("GW_HOUSE_STATUS_MONITOR_DISABLE_CFM", 0x0243, None),
    reply(
        "GW_COMMAND_RUN_STATUS_NTF",
        0x0302,
        Some(decode_run_status_ntf),
    ),
    reply(
        "GW_SESSION_FINISHED_NTF",
        0x0304,
        Some(decode_session_finished_ntf),
    ),
    request("GW_PASSWORD_ENTER_REQ", 0x3000, encode_password),
    reply("GW_PASSWORD_ENTER_CFM", 0x3001, Some(decode_status_cfm)),
];

/// Registry for the gateway's standard command set.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRegistry;

impl StandardRegistry {
    fn by_name(name: &str) -> Option<&'static OpcodeEntry> {
        OPCODES.iter().find(|entry| entry.name == name)
    }
}

impl OpcodeRegistry for StandardRegistry {
    fn name_for_opcode(&self, opcode: u16) -> Option<&'static str> {
        OPCODES
            .iter()
            .find(|entry| entry.opcode == opcode)
            .map(|entry| entry.name)
    }

    fn opcode_for_name(&self, name: &str) -> Option<u16> {
        Self::by_name(name).map(|entry| entry.opcode)
    }

    fn payload_encoder(&self, name: &str) -> Option<PayloadEncoder> {
        Self::by_name(name).and_then(|entry| entry.encoder)
    }

    fn payload_decoder(&self, name: &str) -> Option<PayloadDecoder> {
        Self::by_name(name).and_then(|entry| entry.decoder)
    }
}

#[allow(clippy::unnecessary_wraps)]
fn encode_empty(_fields: &Fields) -> Result<Vec<u8>, CodecError> {
    Ok(Vec::new())
}

fn encode_password(fields: &Fields) -> Result<Vec<u8>, CodecError> {
    let password = fields
        .get("password")
        .ok_or(CodecError::MissingField {
            opcode: LOGIN_REQUEST,
            field: "password",
        })?
        .as_str()
        .ok_or_else(|| CodecError::InvalidField {
            field: "password",
            reason: "expected a string".to_string(),
        })?;

    if password.len() > PASSWORD_LEN {
        return Err(CodecError::InvalidField {
            field: "password",
            reason: format!("longer than {PASSWORD_LEN} bytes"),
        });
    }

    let mut payload = Vec::with_capacity(PASSWORD_LEN);
    payload.put_slice(password.as_bytes());
    payload.resize(PASSWORD_LEN, 0);
    Ok(payload)
}

fn expect_len(opcode: &'static str, payload: &[u8], expected: usize) -> Result<(), CodecError> {
    if payload.len() < expected {
        return Err(CodecError::ShortPayload {
            opcode,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn fields<const N: usize>(entries: [(&str, Value); N]) -> Fields {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn decode_error_ntf(payload: &[u8]) -> Result<Fields, CodecError> {
    expect_len("GW_ERROR_NTF", payload, 1)?;
    Ok(fields([("error_number", payload[0].into())]))
}

fn decode_status_cfm(payload: &[u8]) -> Result<Fields, CodecError> {
    expect_len("status confirmation", payload, 1)?;
    Ok(fields([("status", payload[0].into())]))
}

fn decode_version_cfm(mut payload: &[u8]) -> Result<Fields, CodecError> {
    expect_len("GW_GET_VERSION_CFM", payload, 9)?;
    let software = payload[..6]
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".");
    payload.advance(6);
    Ok(fields([
        ("software_version", software.into()),
        ("hardware_version", payload.get_u8().into()),
        ("product_group", payload.get_u8().into()),
        ("product_type", payload.get_u8().into()),
    ]))
}

fn decode_protocol_version_cfm(mut payload: &[u8]) -> Result<Fields, CodecError> {
    expect_len("GW_GET_PROTOCOL_VERSION_CFM", payload, 4)?;
    Ok(fields([
        ("major", payload.get_u16().into()),
        ("minor", payload.get_u16().into()),
    ]))
}

fn decode_state_cfm(mut payload: &[u8]) -> Result<Fields, CodecError> {
    expect_len("GW_GET_STATE_CFM", payload, 2)?;
    Ok(fields([
        ("gateway_state", payload.get_u8().into()),
        ("sub_state", payload.get_u8().into()),
    ]))
}

fn decode_position_changed_ntf(mut payload: &[u8]) -> Result<Fields, CodecError> {
    expect_len("GW_NODE_STATE_POSITION_CHANGED_NTF", payload, 6)?;
    Ok(fields([
        ("node_id", payload.get_u8().into()),
        ("state", payload.get_u8().into()),
        ("current_position", payload.get_u16().into()),
        ("target", payload.get_u16().into()),
    ]))
}

fn decode_run_status_ntf(mut payload: &[u8]) -> Result<Fields, CodecError> {
    expect_len("GW_COMMAND_RUN_STATUS_NTF", payload, 10)?;
    Ok(fields([
        ("session_id", payload.get_u16().into()),
        ("status_id", payload.get_u8().into()),
        ("node_id", payload.get_u8().into()),
        ("parameter", payload.get_u8().into()),
        ("value", payload.get_u16().into()),
        ("run_status", payload.get_u8().into()),
        ("status_reply", payload.get_u8().into()),
    ]))
}

fn decode_session_finished_ntf(mut payload: &[u8]) -> Result<Fields, CodecError> {
    expect_len("GW_SESSION_FINISHED_NTF", payload, 2)?;
    Ok(fields([("session_id", payload.get_u16().into())]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::confirmation_name;
    use std::collections::HashSet;

    #[test]
    fn test_names_and_opcodes_are_unique() {
        let names: HashSet<_> = OPCODES.iter().map(|entry| entry.name).collect();
        let opcodes: HashSet<_> = OPCODES.iter().map(|entry| entry.opcode).collect();

        assert_eq!(names.len(), OPCODES.len());
        assert_eq!(opcodes.len(), OPCODES.len());
    }

    #[test]
    fn test_every_request_has_a_confirmation() {
        let registry = StandardRegistry;

        for entry in OPCODES.iter().filter(|entry| entry.encoder.is_some()) {
            let confirmation = confirmation_name(entry.name).unwrap();
            assert!(
                registry.opcode_for_name(&confirmation).is_some(),
                "{} has no confirmation",
                entry.name
            );
        }
    }

    #[test]
    fn test_lookup() {
        let registry = StandardRegistry;

        assert_eq!(registry.opcode_for_name(LOGIN_REQUEST), Some(0x3000));
        assert_eq!(registry.name_for_opcode(0x000D), Some("GW_GET_STATE_CFM"));
        assert_eq!(registry.name_for_opcode(0xBEEF), None);
        assert!(registry.payload_encoder("GW_GET_STATE_CFM").is_none());
        assert!(registry.payload_decoder(KEEPALIVE_REQUEST).is_none());
    }

    #[test]
    fn test_password_is_padded() {
        let mut request = Fields::new();
        request.insert("password".to_string(), "secret".into());

        let payload = encode_password(&request).unwrap();

        assert_eq!(payload.len(), PASSWORD_LEN);
        assert_eq!(&payload[..6], b"secret");
        assert!(payload[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_password_validation() {
        assert!(matches!(
            encode_password(&Fields::new()),
            Err(CodecError::MissingField { field: "password", .. })
        ));

        let mut request = Fields::new();
        request.insert("password".to_string(), "x".repeat(PASSWORD_LEN + 1).into());
        assert!(matches!(
            encode_password(&request),
            Err(CodecError::InvalidField { field: "password", .. })
        ));

        request.insert("password".to_string(), 42.into());
        assert!(encode_password(&request).is_err());
    }

    #[test]
    fn test_decode_position_changed() {
        let fields = decode_position_changed_ntf(&[3, 5, 0xC8, 0x00, 0x00, 0x00, 0xFF]).unwrap();

        assert_eq!(fields["node_id"], 3);
        assert_eq!(fields["state"], 5);
        assert_eq!(fields["current_position"], 0xC800);
        assert_eq!(fields["target"], 0);
    }

    #[test]
    fn test_decode_version() {
        let fields = decode_version_cfm(&[0, 2, 0, 0, 71, 0, 6, 14, 3]).unwrap();

        assert_eq!(fields["software_version"], "0.2.0.0.71.0");
        assert_eq!(fields["hardware_version"], 6);
        assert_eq!(fields["product_group"], 14);
        assert_eq!(fields["product_type"], 3);
    }

    #[test]
    fn test_short_payload() {
        assert_eq!(
            decode_run_status_ntf(&[0, 1, 2]),
            Err(CodecError::ShortPayload {
                opcode: "GW_COMMAND_RUN_STATUS_NTF",
                expected: 10,
                actual: 3,
            })
        );
    }
}
