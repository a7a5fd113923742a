//! Typed payload shapes for the chat hub's envelope kinds.

use serde::{Deserialize, Serialize};

/// A direct message, both as submitted (`message`) and as delivered
/// (`message-response`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "fromUserID", default)]
    pub from_user_id: String,

    #[serde(rename = "toUserID")]
    pub to_user_id: String,

    pub message: String,

    /// "text" or "image"; defaults to "text" when the client omits it.
    #[serde(rename = "type", default = "default_message_kind")]
    pub kind: String,

    /// Client-supplied temporary id for optimistic-UI reconciliation.
    /// Echoed back unchanged in the sender ack.
    #[serde(rename = "tempId", default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

fn default_message_kind() -> String {
    "text".to_string()
}

/// One user as shown in the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,

    #[serde(rename = "userID")]
    pub user_id: String,

    pub online: bool,
}

/// Roster event carried by `chatlist-response` envelopes.
///
/// The inner `type` tag distinguishes the three shapes the client
/// handles: `new-user-joined` and `user-disconnected` carry a single
/// user, `my-chatlist` carries the full online roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "chatlist", rename_all = "kebab-case")]
pub enum ChatListEvent {
    NewUserJoined(UserSummary),
    UserDisconnected(UserSummary),
    MyChatlist(Vec<UserSummary>),
}

/// Out-of-band alert pushed at a recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,

    /// "new_message", "friend_request", ...
    #[serde(rename = "type")]
    pub kind: String,

    pub message: String,

    #[serde(rename = "fromUser", default, skip_serializing_if = "Option::is_none")]
    pub from_user: Option<String>,

    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Notification {
    #[must_use]
    pub fn new(kind: &str, message: String, from_user: Option<String>) -> Self {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            id: format!("ntf_{now_ms:x}"),
            kind: kind.to_string(),
            message,
            from_user,
            timestamp: now_ms,
        }
    }
}

/// Typing activity; relayed verbatim, only the target is inspected.
#[derive(Debug, Clone, Deserialize)]
pub struct TypingPayload {
    #[serde(rename = "toUserID")]
    pub to_user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_defaults() {
        let msg: MessagePayload =
            serde_json::from_str(r#"{"toUserID":"bob","message":"hi"}"#).unwrap();
        assert_eq!(msg.kind, "text");
        assert_eq!(msg.from_user_id, "");
        assert!(msg.temp_id.is_none());
    }

    #[test]
    fn test_chatlist_event_wire_shape() {
        let ev = ChatListEvent::NewUserJoined(UserSummary {
            username: "alice".into(),
            user_id: "u1".into(),
            online: true,
        });
        let wire = serde_json::to_string(&ev).unwrap();
        assert!(wire.contains(r#""type":"new-user-joined""#));
        assert!(wire.contains(r#""userID":"u1""#));

        let back: ChatListEvent = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_roster_event() {
        let ev = ChatListEvent::MyChatlist(vec![]);
        let wire = serde_json::to_string(&ev).unwrap();
        assert!(wire.contains(r#""type":"my-chatlist""#));
    }
}
