//! The envelope: the uniform routing+payload unit.
//!
//! Every message that crosses a component boundary - client frame, bus
//! bridge publication, hub delivery - travels as an [`Envelope`]. The
//! payload is kept as raw JSON and decoded only by the handler that
//! recognizes the type tag.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::codec::ProtocolError;

/// Well-known envelope type tags.
///
/// The protocol is open: tags outside this list decode fine and are
/// ignored at dispatch.
pub mod kinds {
    /// Client announces a user session (payload: bare user id string).
    pub const JOIN: &str = "join";
    /// Client announces it is going away (payload: bare user id string).
    pub const DISCONNECT: &str = "disconnect";
    /// Client submits a direct message (payload: [`MessagePayload`](crate::MessagePayload)).
    pub const MESSAGE: &str = "message";
    /// Delivery of a direct message, and the sender-side ack.
    pub const MESSAGE_RESPONSE: &str = "message-response";
    /// Roster events: who came online, who left, the full list on join.
    pub const CHATLIST_RESPONSE: &str = "chatlist-response";
    /// Client reports typing activity toward another user.
    pub const TYPING: &str = "typing";
    /// Relayed typing activity.
    pub const TYPING_RESPONSE: &str = "typing-response";
    /// Out-of-band alert for the recipient (new message, friend request).
    pub const NOTIFICATION: &str = "notification";
    /// Fan-out of a group message created by the request layer.
    pub const GROUP_MESSAGE_RESPONSE: &str = "group-message-response";
}

/// The uniform message unit.
///
/// `target_user_id == ""` means "deliver to every locally-registered
/// connection"; any other value means "deliver only to connections whose
/// session user id matches". Envelopes are immutable after construction;
/// clones (not shared mutable state) cross the bus-bridge and
/// outbound-queue boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Type tag selecting the payload shape.
    #[serde(rename = "type")]
    pub kind: String,

    /// Raw payload, decoded lazily by the handler that recognizes `kind`.
    pub payload: Box<RawValue>,

    /// Routing target; empty string broadcasts.
    #[serde(rename = "targetID", default, skip_serializing_if = "String::is_empty")]
    pub target_user_id: String,
}

impl Envelope {
    /// Build an envelope addressed to a single user.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn targeted<T: Serialize>(
        kind: &str,
        payload: &T,
        target_user_id: &str,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: kind.to_string(),
            payload: serde_json::value::to_raw_value(payload)?,
            target_user_id: target_user_id.to_string(),
        })
    }

    /// Build an untargeted envelope, delivered to every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn broadcast<T: Serialize>(kind: &str, payload: &T) -> Result<Self, ProtocolError> {
        Self::targeted(kind, payload, "")
    }

    /// Build an envelope from an already-raw payload, without re-encoding.
    #[must_use]
    pub fn from_raw(kind: &str, payload: Box<RawValue>, target_user_id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            target_user_id: target_user_id.to_string(),
        }
    }

    /// Decode the payload into the shape `kind` implies.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn decode_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_str(self.payload.get())?)
    }

    /// Whether this envelope is addressed to everyone.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target_user_id.is_empty()
    }

    /// Re-address this envelope to a single user.
    #[must_use]
    pub fn with_target(mut self, target_user_id: &str) -> Self {
        self.target_user_id = target_user_id.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::MessagePayload;

    #[test]
    fn test_targeted_envelope() {
        let msg = MessagePayload {
            from_user_id: "alice".into(),
            to_user_id: "bob".into(),
            message: "hi".into(),
            kind: "text".into(),
            temp_id: None,
        };
        let env = Envelope::targeted(kinds::MESSAGE_RESPONSE, &msg, "bob").unwrap();
        assert_eq!(env.kind, kinds::MESSAGE_RESPONSE);
        assert_eq!(env.target_user_id, "bob");
        assert!(!env.is_broadcast());

        let decoded: MessagePayload = env.decode_payload().unwrap();
        assert_eq!(decoded.message, "hi");
        assert_eq!(decoded.from_user_id, "alice");
    }

    #[test]
    fn test_broadcast_envelope() {
        let env = Envelope::broadcast(kinds::JOIN, &"alice").unwrap();
        assert!(env.is_broadcast());
        let user: String = env.decode_payload().unwrap();
        assert_eq!(user, "alice");
    }

    #[test]
    fn test_unknown_kind_stays_representable() {
        let wire = r#"{"type":"future-feature","payload":{"x":1},"targetID":"u1"}"#;
        let env: Envelope = serde_json::from_str(wire).unwrap();
        assert_eq!(env.kind, "future-feature");
        assert_eq!(env.target_user_id, "u1");
        // Payload was not touched by the decode.
        assert_eq!(env.payload.get(), r#"{"x":1}"#);
    }

    #[test]
    fn test_empty_target_omitted_on_wire() {
        let env = Envelope::broadcast("typing", &serde_json::json!({"a": 1})).unwrap();
        let wire = serde_json::to_string(&env).unwrap();
        assert!(!wire.contains("targetID"));
    }

    #[test]
    fn test_payload_shape_mismatch() {
        let env = Envelope::broadcast(kinds::MESSAGE, &"just a string").unwrap();
        assert!(env.decode_payload::<MessagePayload>().is_err());
    }
}
