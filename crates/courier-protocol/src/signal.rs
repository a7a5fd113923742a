//! WebRTC signaling message types for the room service.
//!
//! Supported message types:
//!   - "offer" / "answer"  - SDP descriptions relayed to one target peer
//!   - "ice-candidate"     - trickled ICE candidate for one target peer
//!   - "request-offer"     - newcomer asking existing peers to initiate
//!   - "user-joined" / "user-left" / "new-peer" / "room-joined" - control
//!     events emitted by the room manager itself
//!
//! Unknown types are logged and dropped by the relay, never fatal.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::warn;

/// Signal message type tags.
pub mod kinds {
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    pub const REQUEST_OFFER: &str = "request-offer";
    pub const USER_JOINED: &str = "user-joined";
    pub const USER_LEFT: &str = "user-left";
    pub const NEW_PEER: &str = "new-peer";
    pub const ROOM_JOINED: &str = "room-joined";
}

/// An SDP description, matching RTCSessionDescription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDesc {
    /// "offer" or "answer".
    #[serde(rename = "type")]
    pub kind: String,

    pub sdp: String,
}

/// An ICE candidate, matching RTCIceCandidateInit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

/// A signaling message as exchanged with room participants.
///
/// `user_id` is the sender. The room manager overwrites it with the
/// authenticated session's id on every inbound message, so a peer can
/// never forge another peer's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "userId", default)]
    pub user_id: String,

    /// Recipient peer for point-to-point kinds; empty for broadcasts.
    #[serde(rename = "targetId", default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,

    #[serde(rename = "roomId", default)]
    pub room_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDesc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<IceCandidate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Box<RawValue>>,
}

impl SignalMessage {
    /// Build a control event (`user-joined`, `user-left`, `new-peer`, ...).
    #[must_use]
    pub fn control(kind: &str, user_id: &str, room_id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            user_id: user_id.to_string(),
            target_id: String::new(),
            room_id: room_id.to_string(),
            sdp: None,
            ice: None,
            metadata: None,
        }
    }

    /// Re-address a control event at a specific peer.
    #[must_use]
    pub fn with_target(mut self, target_id: &str) -> Self {
        self.target_id = target_id.to_string();
        self
    }

    /// Attach opaque metadata (e.g. the ICE server list in the greeting).
    #[must_use]
    pub fn with_metadata(mut self, metadata: Box<RawValue>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Check that an SDP description is plausible before relaying it.
#[must_use]
pub fn validate_sdp(sdp: &SessionDesc) -> bool {
    if sdp.kind != "offer" && sdp.kind != "answer" {
        warn!(kind = %sdp.kind, "invalid SDP type");
        return false;
    }
    if sdp.sdp.is_empty() {
        warn!("empty SDP string");
        return false;
    }
    true
}

/// Check that an ICE candidate is plausible before relaying it.
#[must_use]
pub fn validate_ice(ice: &IceCandidate) -> bool {
    if ice.candidate.is_empty() {
        warn!("empty ICE candidate");
        return false;
    }
    true
}
