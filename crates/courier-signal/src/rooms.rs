//! Signaling room registry.
//!
//! A room is a map from user id to [`Peer`]. The registry lock is held
//! only for map mutation, never for network I/O: broadcasts snapshot the
//! peer list under the lock, release it, then write against the
//! snapshot - each write serialized through that peer's own lock, all
//! writes dispatched concurrently. One slow peer can therefore never
//! stall join/leave for the whole room, and the room lock never nests
//! inside a peer's write lock.
//!
//! A room is created on first join and destroyed when its last peer
//! leaves, releasing the TTL'd tracking state in the external room
//! store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_core::{RoomStore, StoreError};
use courier_protocol::signal::{kinds, validate_ice, validate_sdp, SignalMessage};
use futures_util::future::join_all;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// A peer link write failure; the peer is likely mid-disconnect.
#[derive(Debug, thiserror::Error)]
#[error("peer link write failed: {0}")]
pub struct LinkError(pub String);

/// The outbound-write capability of one room participant.
#[async_trait]
pub trait PeerLink: Send + 'static {
    async fn send_signal(&mut self, message: &SignalMessage) -> Result<(), LinkError>;
}

/// A room participant: identity plus its write-serialized link.
pub struct Peer<L> {
    user_id: String,
    link: AsyncMutex<L>,
}

impl<L: PeerLink> Peer<L> {
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Write to this peer, serialized through its own lock. Failures are
    /// logged, not propagated: the peer may have left mid-flight.
    pub async fn send(&self, message: &SignalMessage) {
        if let Err(e) = self.link.lock().await.send_signal(message).await {
            warn!(peer = %self.user_id, error = %e, "signal write failed");
        }
    }
}

/// Per-process registry of signaling rooms.
pub struct RoomRegistry<L> {
    rooms: Mutex<HashMap<String, HashMap<String, Arc<Peer<L>>>>>,
    store: Arc<dyn RoomStore>,
}

impl<L: PeerLink> RoomRegistry<L> {
    #[must_use]
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Add a participant, creating the room if absent, then announce the
    /// arrival to everyone already there.
    pub async fn join(&self, room_id: &str, user_id: &str, link: L) -> Arc<Peer<L>> {
        let peer = Arc::new(Peer {
            user_id: user_id.to_string(),
            link: AsyncMutex::new(link),
        });
        {
            let mut rooms = self.rooms.lock().unwrap();
            rooms
                .entry(room_id.to_string())
                .or_default()
                .insert(user_id.to_string(), Arc::clone(&peer));
        }
        debug!(room = %room_id, user = %user_id, "peer joined room");

        if let Err(e) = self.store.add_participant(room_id, user_id).await {
            self.log_store_error(room_id, &e);
        }

        self.broadcast_except(
            room_id,
            user_id,
            &SignalMessage::control(kinds::USER_JOINED, user_id, room_id),
        )
        .await;
        peer
    }

    /// Remove a participant; the last one out destroys the room and
    /// releases its tracking state. The departure broadcast is
    /// best-effort - the room may already be gone.
    pub async fn leave(&self, room_id: &str, user_id: &str) {
        let emptied = {
            let mut rooms = self.rooms.lock().unwrap();
            let Some(peers) = rooms.get_mut(room_id) else {
                return;
            };
            peers.remove(user_id);
            if peers.is_empty() {
                rooms.remove(room_id);
                true
            } else {
                false
            }
        };
        debug!(room = %room_id, user = %user_id, "peer left room");

        if let Err(e) = self.store.remove_participant(room_id, user_id).await {
            self.log_store_error(room_id, &e);
        }

        if emptied {
            debug!(room = %room_id, "room empty, releasing");
            if let Err(e) = self.store.delete_room_metadata(room_id).await {
                self.log_store_error(room_id, &e);
            }
        } else {
            self.broadcast_except(
                room_id,
                user_id,
                &SignalMessage::control(kinds::USER_LEFT, user_id, room_id),
            )
            .await;
        }
    }

    /// Relay one inbound message from `sender_id`'s session.
    ///
    /// The sender identity on the message is always overwritten with the
    /// session's authenticated id, so a peer can never forge another
    /// peer's identity. Point-to-point kinds go to their single target
    /// (silently dropped if the target already left); `request-offer`
    /// tells every other peer to initiate toward the newcomer.
    pub async fn relay(&self, room_id: &str, sender_id: &str, mut message: SignalMessage) {
        message.user_id = sender_id.to_string();
        message.room_id = room_id.to_string();

        match message.kind.as_str() {
            kinds::OFFER | kinds::ANSWER => {
                if !message.sdp.as_ref().is_some_and(validate_sdp) {
                    warn!(room = %room_id, from = %sender_id, kind = %message.kind,
                        "dropping session description without valid SDP");
                    return;
                }
                if !message.target_id.is_empty() {
                    self.send_to(room_id, &message.target_id.clone(), &message).await;
                }
            }
            kinds::ICE_CANDIDATE => {
                if !message.ice.as_ref().is_some_and(validate_ice) {
                    warn!(room = %room_id, from = %sender_id, "dropping invalid ICE candidate");
                    return;
                }
                if !message.target_id.is_empty() {
                    self.send_to(room_id, &message.target_id.clone(), &message).await;
                }
            }
            kinds::REQUEST_OFFER => {
                // Mesh topology: each existing participant independently
                // initiates toward the newcomer.
                let announce = SignalMessage::control(kinds::NEW_PEER, sender_id, room_id)
                    .with_target(sender_id);
                self.broadcast_except(room_id, sender_id, &announce).await;
            }
            other => {
                debug!(kind = %other, "ignoring unknown signal type");
            }
        }
    }

    /// Participants currently in a room on this process.
    #[must_use]
    pub fn peers_in(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .lock()
            .unwrap()
            .get(room_id)
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    async fn send_to(&self, room_id: &str, target_id: &str, message: &SignalMessage) {
        let peer = {
            let rooms = self.rooms.lock().unwrap();
            rooms
                .get(room_id)
                .and_then(|peers| peers.get(target_id))
                .cloned()
        };
        match peer {
            Some(peer) => peer.send(message).await,
            None => {
                debug!(room = %room_id, target = %target_id, "relay target not in room");
            }
        }
    }

    async fn broadcast_except(&self, room_id: &str, exclude: &str, message: &SignalMessage) {
        // Snapshot under the lock, write outside it.
        let snapshot: Vec<Arc<Peer<L>>> = {
            let rooms = self.rooms.lock().unwrap();
            rooms
                .get(room_id)
                .map(|peers| {
                    peers
                        .values()
                        .filter(|peer| peer.user_id != exclude)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        join_all(snapshot.iter().map(|peer| peer.send(message))).await;
    }

    fn log_store_error(&self, room_id: &str, error: &StoreError) {
        warn!(room = %room_id, error = %error, "room store update failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MemoryRoomStore;
    use courier_protocol::signal::SessionDesc;

    /// Collects everything written to it.
    #[derive(Clone, Default)]
    struct CollectorLink {
        sent: Arc<Mutex<Vec<SignalMessage>>>,
    }

    #[async_trait]
    impl PeerLink for CollectorLink {
        async fn send_signal(&mut self, message: &SignalMessage) -> Result<(), LinkError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Fixture {
        registry: RoomRegistry<CollectorLink>,
        store: Arc<MemoryRoomStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryRoomStore::default());
            Self {
                registry: RoomRegistry::new(Arc::clone(&store) as Arc<dyn RoomStore>),
                store,
            }
        }

        async fn join(&self, room: &str, user: &str) -> CollectorLink {
            let link = CollectorLink::default();
            self.registry.join(room, user, link.clone()).await;
            link
        }
    }

    fn kinds_of(link: &CollectorLink) -> Vec<String> {
        link.sent.lock().unwrap().iter().map(|m| m.kind.clone()).collect()
    }

    fn offer(target: &str) -> SignalMessage {
        SignalMessage {
            kind: kinds::OFFER.into(),
            user_id: String::new(),
            target_id: target.into(),
            room_id: String::new(),
            sdp: Some(SessionDesc {
                kind: "offer".into(),
                sdp: "v=0".into(),
            }),
            ice: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_join_announces_to_others_not_joiner() {
        let fx = Fixture::new();
        let x = fx.join("r1", "x").await;
        let y = fx.join("r1", "y").await;

        // x learns about y; the joiner itself hears nothing.
        assert_eq!(kinds_of(&x), vec![kinds::USER_JOINED]);
        assert!(kinds_of(&y).is_empty());
        let announced = x.sent.lock().unwrap()[0].user_id.clone();
        assert_eq!(announced, "y");
    }

    #[tokio::test]
    async fn test_offer_reaches_only_its_target() {
        let fx = Fixture::new();
        let _x = fx.join("r1", "x").await;
        let y = fx.join("r1", "y").await;
        let z = fx.join("r1", "z").await;

        let y_before = y.sent.lock().unwrap().len();
        let z_before = z.sent.lock().unwrap().len();

        fx.registry.relay("r1", "x", offer("y")).await;

        let y_sent = y.sent.lock().unwrap();
        assert_eq!(y_sent.len(), y_before + 1);
        assert_eq!(y_sent.last().unwrap().kind, kinds::OFFER);
        assert_eq!(z.sent.lock().unwrap().len(), z_before, "z receives nothing");
    }

    #[tokio::test]
    async fn test_sender_identity_cannot_be_forged() {
        let fx = Fixture::new();
        let _x = fx.join("r1", "x").await;
        let y = fx.join("r1", "y").await;

        let mut spoofed = offer("y");
        spoofed.user_id = "mallory".into();
        fx.registry.relay("r1", "x", spoofed).await;

        let delivered = y.sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(delivered.user_id, "x");
        assert_eq!(delivered.room_id, "r1");
    }

    #[tokio::test]
    async fn test_request_offer_broadcasts_new_peer() {
        let fx = Fixture::new();
        let x = fx.join("r1", "x").await;
        let y = fx.join("r1", "y").await;
        let z = fx.join("r1", "z").await;

        fx.registry
            .relay("r1", "z", SignalMessage::control(kinds::REQUEST_OFFER, "z", "r1"))
            .await;

        for (link, name) in [(&x, "x"), (&y, "y")] {
            let sent = link.sent.lock().unwrap();
            let new_peer = sent
                .iter()
                .find(|m| m.kind == kinds::NEW_PEER)
                .unwrap_or_else(|| panic!("{name} should see new-peer"));
            assert_eq!(new_peer.user_id, "z");
            assert_eq!(new_peer.target_id, "z");
        }
        assert!(
            !kinds_of(&z).contains(&kinds::NEW_PEER.to_string()),
            "the requester is excluded from its own announcement"
        );
    }

    #[tokio::test]
    async fn test_relay_to_departed_peer_is_a_noop() {
        let fx = Fixture::new();
        let _x = fx.join("r1", "x").await;
        let y = fx.join("r1", "y").await;
        fx.registry.leave("r1", "y").await;

        // y left mid-flight; the stale offer is silently dropped.
        fx.registry.relay("r1", "x", offer("y")).await;
        assert!(!kinds_of(&y).contains(&kinds::OFFER.to_string()));
    }

    #[tokio::test]
    async fn test_invalid_sdp_is_dropped() {
        let fx = Fixture::new();
        let _x = fx.join("r1", "x").await;
        let y = fx.join("r1", "y").await;

        let mut bad = offer("y");
        bad.sdp = Some(SessionDesc {
            kind: "offer".into(),
            sdp: String::new(),
        });
        fx.registry.relay("r1", "x", bad).await;

        let mut missing = offer("y");
        missing.sdp = None;
        fx.registry.relay("r1", "x", missing).await;

        assert!(!kinds_of(&y).contains(&kinds::OFFER.to_string()));
    }

    #[tokio::test]
    async fn test_last_leave_destroys_room_and_store_state() {
        let fx = Fixture::new();
        let x = fx.join("r1", "x").await;
        let _y = fx.join("r1", "y").await;
        assert_eq!(fx.registry.room_count(), 1);
        assert_eq!(
            fx.store.list_room_participants("r1").await.unwrap().len(),
            2
        );

        fx.registry.leave("r1", "y").await;
        assert!(kinds_of(&x).contains(&kinds::USER_LEFT.to_string()));
        assert_eq!(fx.registry.room_count(), 1);

        fx.registry.leave("r1", "x").await;
        assert_eq!(fx.registry.room_count(), 0);
        assert!(fx.store.list_room_participants("r1").await.unwrap().is_empty());

        // Leaving an already-gone room is a safe no-op.
        fx.registry.leave("r1", "x").await;
    }

    #[tokio::test]
    async fn test_broadcast_survives_concurrent_membership() {
        // A broadcast writes against its snapshot while a join mutates
        // the room; neither blocks the other.
        let fx = Fixture::new();
        let _x = fx.join("r1", "x").await;
        let _y = fx.join("r1", "y").await;

        let broadcast = fx
            .registry
            .relay("r1", "y", SignalMessage::control(kinds::REQUEST_OFFER, "y", "r1"));
        let join = fx.join("r1", "w");
        let (_, w) = tokio::join!(broadcast, join);
        let _ = w;
        assert_eq!(fx.registry.peers_in("r1").len(), 3);
    }
}
