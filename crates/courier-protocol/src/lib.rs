//! # courier-protocol
//!
//! Wire protocol definitions for the Courier realtime core.
//!
//! This crate provides the fundamental units of communication:
//!
//! - **Envelope** - The uniform routing+payload unit passed between all
//!   components (connections, hub, bus bridge)
//! - **Payloads** - Typed payload shapes decoded lazily per envelope type
//! - **Signal** - WebRTC signaling message types for the room service
//! - **Codec** - JSON text framing with size limits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Client    │────▶│  Envelope   │────▶│   Handler   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │ Bus Bridge  │
//!                     └─────────────┘
//! ```
//!
//! The envelope's `type` tag is an open, string-keyed protocol: handlers
//! decode only the payloads they recognize, and unknown tags remain
//! representable (the payload stays raw) so they can be logged and ignored
//! rather than failing the decode.

pub mod codec;
pub mod envelope;
pub mod payloads;
pub mod signal;

pub use codec::{ProtocolError, DEFAULT_MAX_FRAME_SIZE};
pub use envelope::{kinds, Envelope};
pub use payloads::{ChatListEvent, MessagePayload, Notification, UserSummary};
pub use signal::{IceCandidate, SessionDesc, SignalMessage};
