//! Presence and offline-queue orchestration.
//!
//! Per user the state machine is `Offline -> Online -> Offline`, driven
//! by hub membership events. Presence changes are always broadcast
//! untargeted through the bus bridge; direct messages are always
//! targeted. The invariant protected by the offline queue: no message is
//! silently dropped solely because the recipient was offline.
//!
//! All collaborator I/O runs on the presence worker task, never on the
//! hub control loop.

use std::sync::Arc;

use courier_protocol::envelope::kinds;
use courier_protocol::payloads::TypingPayload;
use courier_protocol::{ChatListEvent, Envelope, MessagePayload, Notification, ProtocolError};
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, Bus};
use crate::hub::{ConnectionHandle, MemberEvent};
use crate::store::{MessageStore, OfflineQueue, StoreError, UserDirectory};

/// Presence/delivery errors surfaced to the request layer.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("message is missing sender, recipient, or body")]
    InvalidMessage,

    #[error("unknown sender: {0}")]
    UnknownSender(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Presence, offline delivery, and direct-message semantics.
pub struct PresenceService {
    bus: Arc<dyn Bus>,
    directory: Arc<dyn UserDirectory>,
    messages: Arc<dyn MessageStore>,
    offline: Arc<dyn OfflineQueue>,
}

impl PresenceService {
    #[must_use]
    pub fn new(
        bus: Arc<dyn Bus>,
        directory: Arc<dyn UserDirectory>,
        messages: Arc<dyn MessageStore>,
        offline: Arc<dyn OfflineQueue>,
    ) -> Self {
        Self {
            bus,
            directory,
            messages,
            offline,
        }
    }

    /// Consume hub membership events, running the join/leave side
    /// effects off the control loop.
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MemberEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MemberEvent::Joined { connection } => {
                        if let Err(e) = service.handle_join(&connection).await {
                            warn!(
                                user = %connection.user_id(),
                                error = %e,
                                "join side effects failed"
                            );
                        }
                    }
                    MemberEvent::Left {
                        user_id,
                        remaining_sessions,
                        ..
                    } => {
                        // Another device is still attached locally.
                        if remaining_sessions > 0 {
                            continue;
                        }
                        if let Err(e) = service.handle_disconnect(&user_id).await {
                            warn!(user = %user_id, error = %e, "leave side effects failed");
                        }
                    }
                }
            }
        })
    }

    /// Join side effects: mark online, announce to everyone, hand the
    /// new session its roster, then flush the offline backlog straight
    /// to it (the recipient is local by definition, so no bridge trip).
    pub async fn handle_join(&self, connection: &ConnectionHandle) -> Result<(), PresenceError> {
        let user_id = connection.user_id();
        let Some(user) = self.directory.lookup_user(user_id).await? else {
            warn!(user = %user_id, "unknown user tried to join the chat hub");
            return Ok(());
        };

        self.directory.set_online_status(user_id, true).await?;

        let mut joined = user.summary();
        joined.online = true;
        self.publish_logged(Envelope::broadcast(
            kinds::CHATLIST_RESPONSE,
            &ChatListEvent::NewUserJoined(joined),
        )?)
        .await;

        let roster: Vec<_> = self
            .directory
            .list_online_users(user_id)
            .await?
            .iter()
            .map(|u| u.summary())
            .collect();
        self.deliver_direct(
            connection,
            Envelope::targeted(
                kinds::CHATLIST_RESPONSE,
                &ChatListEvent::MyChatlist(roster),
                user_id,
            )?,
        );

        let backlog = self.offline.flush(user_id).await?;
        if !backlog.is_empty() {
            info!(user = %user_id, count = backlog.len(), "flushing offline messages");
        }
        for message in &backlog {
            self.deliver_direct(
                connection,
                Envelope::targeted(kinds::MESSAGE_RESPONSE, message, user_id)?,
            );
        }
        Ok(())
    }

    /// Leave side effects: mark offline and announce to everyone.
    pub async fn handle_disconnect(&self, user_id: &str) -> Result<(), PresenceError> {
        let Some(user) = self.directory.lookup_user(user_id).await? else {
            return Ok(());
        };

        self.directory.set_online_status(user_id, false).await?;

        let mut left = user.summary();
        left.online = false;
        self.publish_logged(Envelope::broadcast(
            kinds::CHATLIST_RESPONSE,
            &ChatListEvent::UserDisconnected(left),
        )?)
        .await;
        Ok(())
    }

    /// Send a direct message.
    ///
    /// History is persisted first; live delivery is best-effort through
    /// the bridge; an offline recipient additionally gets the message
    /// queued durably (duplicates are acceptable, the client dedupes by
    /// `tempId`). The sender receives its own delivery as an ack.
    ///
    /// # Errors
    ///
    /// A persist failure is returned for retry at a higher layer, but
    /// only after live delivery has been attempted.
    pub async fn send_message(&self, message: MessagePayload) -> Result<(), PresenceError> {
        if message.message.is_empty()
            || message.from_user_id.is_empty()
            || message.to_user_id.is_empty()
        {
            return Err(PresenceError::InvalidMessage);
        }
        let Some(sender) = self.directory.lookup_user(&message.from_user_id).await? else {
            return Err(PresenceError::UnknownSender(message.from_user_id.clone()));
        };
        let recipient = self.directory.lookup_user(&message.to_user_id).await?;

        let persisted = self.messages.persist_message(&message).await;

        self.publish_logged(Envelope::targeted(
            kinds::MESSAGE_RESPONSE,
            &message,
            &message.to_user_id,
        )?)
        .await;

        if !recipient.as_ref().is_some_and(|u| u.online) {
            debug!(user = %message.to_user_id, "recipient offline, queueing message");
            self.offline.append(&message.to_user_id, &message).await?;
        }

        if message.from_user_id != message.to_user_id {
            self.publish_logged(Envelope::targeted(
                kinds::MESSAGE_RESPONSE,
                &message,
                &message.from_user_id,
            )?)
            .await;
        }

        self.publish_logged(Envelope::targeted(
            kinds::NOTIFICATION,
            &Notification::new(
                "new_message",
                format!("New message from {}", sender.username),
                Some(sender.username.clone()),
            ),
            &message.to_user_id,
        )?)
        .await;

        persisted.map(|_| ()).map_err(PresenceError::from)
    }

    /// Relay typing activity at its target, payload untouched.
    pub async fn relay_typing(&self, payload: &RawValue) -> Result<(), PresenceError> {
        let typing: TypingPayload =
            serde_json::from_str(payload.get()).map_err(ProtocolError::from)?;
        self.publish_logged(Envelope::from_raw(
            kinds::TYPING_RESPONSE,
            payload.to_owned(),
            &typing.to_user_id,
        ))
        .await;
        Ok(())
    }

    /// Bridge failures are logged and never block the caller; the
    /// forwarder side retries on its own.
    async fn publish_logged(&self, envelope: Envelope) {
        if let Err(e) = self.bus.publish(&envelope).await {
            warn!(kind = %envelope.kind, error = %e, "bridge publish failed");
        }
    }

    fn deliver_direct(&self, connection: &ConnectionHandle, envelope: Envelope) {
        if let Err(rejected) = connection.try_send(envelope) {
            warn!(
                user = %connection.user_id(),
                ?rejected,
                "direct delivery dropped"
            );
        }
    }
}
