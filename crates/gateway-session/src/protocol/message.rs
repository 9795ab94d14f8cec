//! Request and record types exchanged with the gateway.

use serde_json::{Map, Value};

/// Decoded payload fields, keyed by field name.
pub type Fields = Map<String, Value>;

/// Suffix marking a request opcode name.
pub const REQUEST_SUFFIX: &str = "_REQ";

/// Suffix marking a confirmation opcode name.
pub const CONFIRMATION_SUFFIX: &str = "_CFM";

/// Suffix marking a notification opcode name.
pub const NOTIFICATION_SUFFIX: &str = "_NTF";

/// Logical role of a message, derived from its opcode name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    /// Sent by the client, answered by a confirmation.
    Request,
    /// Direct answer to a request.
    Confirmation,
    /// Sent by the gateway on its own.
    Notification,
}

impl MessageRole {
    /// Classify an opcode name by its suffix.
    #[must_use]
    pub fn of(name: &str) -> Option<Self> {
        if name.ends_with(REQUEST_SUFFIX) {
            Some(Self::Request)
        } else if name.ends_with(CONFIRMATION_SUFFIX) {
            Some(Self::Confirmation)
        } else if name.ends_with(NOTIFICATION_SUFFIX) {
            Some(Self::Notification)
        } else {
            None
        }
    }
}

/// Name of the confirmation answering `request`, if it is a request name.
#[must_use]
pub fn confirmation_name(request: &str) -> Option<String> {
    request
        .strip_suffix(REQUEST_SUFFIX)
        .map(|stem| format!("{stem}{CONFIRMATION_SUFFIX}"))
}

/// How a request names its opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpcodeRef {
    /// Registry name, e.g. `GW_GET_STATE_REQ`.
    Name(String),
    /// Numeric opcode.
    Id(u16),
}

/// A request to send to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Opcode to send.
    pub opcode: OpcodeRef,
    /// Fields handed to the opcode's payload encoder.
    pub fields: Fields,
}

impl Request {
    /// Create a request for a named opcode.
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            opcode: OpcodeRef::Name(name.into()),
            fields: Fields::new(),
        }
    }

    /// Create a request for a numeric opcode.
    #[must_use]
    pub fn by_opcode(opcode: u16) -> Self {
        Self {
            opcode: OpcodeRef::Id(opcode),
            fields: Fields::new(),
        }
    }

    /// Add a payload field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Session byte of the envelope.
    pub id: u8,
    /// Numeric opcode, `None` when the envelope was too short to carry one.
    pub opcode: Option<u16>,
    /// Registry name of the opcode, if known.
    pub opcode_name: Option<&'static str>,
    /// Whether the trailing checksum matched.
    pub checksum_valid: bool,
    /// Decoded payload fields. Empty unless the payload could be decoded.
    pub fields: Fields,
}

impl Record {
    pub(crate) fn invalid(id: u8) -> Self {
        Self {
            id,
            opcode: None,
            opcode_name: None,
            checksum_valid: false,
            fields: Fields::new(),
        }
    }

    /// Role of this record, if its opcode name follows the naming convention.
    #[must_use]
    pub fn role(&self) -> Option<MessageRole> {
        self.opcode_name.and_then(MessageRole::of)
    }

    /// Numeric payload field.
    #[must_use]
    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.fields.get(name).and_then(Value::as_u64)
    }

    /// String payload field.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_name() {
        assert_eq!(
            confirmation_name("GW_PASSWORD_ENTER_REQ").as_deref(),
            Some("GW_PASSWORD_ENTER_CFM")
        );
        assert_eq!(confirmation_name("GW_ERROR_NTF"), None);
        // Only a trailing marker counts.
        assert_eq!(confirmation_name("GW_REQ_THING_CFM"), None);
    }

    #[test]
    fn test_message_role() {
        assert_eq!(MessageRole::of("GW_GET_STATE_REQ"), Some(MessageRole::Request));
        assert_eq!(
            MessageRole::of("GW_GET_STATE_CFM"),
            Some(MessageRole::Confirmation)
        );
        assert_eq!(
            MessageRole::of("GW_SESSION_FINISHED_NTF"),
            Some(MessageRole::Notification)
        );
        assert_eq!(MessageRole::of("GW_UNKNOWN"), None);
    }

    #[test]
    fn test_request_builder() {
        let request = Request::by_name("GW_PASSWORD_ENTER_REQ").with_field("password", "secret");

        assert_eq!(
            request.opcode,
            OpcodeRef::Name("GW_PASSWORD_ENTER_REQ".to_string())
        );
        assert_eq!(request.fields["password"], "secret");
    }
}
