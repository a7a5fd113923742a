//! # courier-core
//!
//! The per-process delivery core for Courier:
//!
//! - **Hub** - registry and router of live connections, serialized through
//!   a single control loop
//! - **Bridge** - cross-instance fan-out over a shared pub/sub medium
//!   (in-process broadcast or Redis)
//! - **Presence** - online/offline state, offline-queue flush, and direct
//!   message delivery semantics
//! - **Matcher** - rendezvous pairing of anonymous callers
//! - **Store** - narrow collaborator interfaces for the durable layers,
//!   with in-memory implementations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connection  │────▶│     Hub     │◀────│   Bridge    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   ▲
//!                            ▼                   │
//!                     ┌─────────────┐     publish│
//!                     │  Presence   │────────────┘
//!                     └─────────────┘
//! ```
//!
//! An inbound envelope is handled by a type-specific handler which emits
//! zero or more outbound envelopes; every outbound envelope goes through
//! the bridge, and every process's bridge subscription forwards back into
//! its local hub, which routes by `target_user_id`.

pub mod bridge;
pub mod hub;
pub mod matcher;
pub mod presence;
pub mod redis_bus;
pub mod store;

pub use bridge::{Bus, BridgeError, LocalBus};
pub use hub::{ConnectionHandle, Hub, HubHandle, MemberEvent, SessionId};
pub use matcher::{MatchOutcome, MatchRole, RendezvousMatcher};
pub use presence::{PresenceError, PresenceService};
pub use redis_bus::RedisBus;
pub use store::{
    MemoryDirectory, MemoryMessageStore, MemoryOfflineQueue, MemoryRoomStore, MessageStore,
    OfflineQueue, RoomStore, StoreError, UserDirectory, UserRecord,
};
