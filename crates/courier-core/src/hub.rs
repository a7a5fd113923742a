//! The per-process connection hub.
//!
//! The hub owns the membership set of live connections. All mutation and
//! delivery decisions are serialized through one control-loop task
//! consuming register/unregister/deliver commands, so the set needs no
//! external synchronization and no two operations interleave
//! inconsistently.
//!
//! Delivery to a connection never blocks the loop: each connection has a
//! bounded outbound queue, and a full queue means the client is slow or
//! wedged - the envelope is dropped and the connection evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_protocol::Envelope;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Opaque session identity, unique per process.
pub type SessionId = u64;

/// Why a send into a connection's outbound queue was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    /// The bounded queue is full; the connection will be evicted.
    Full,
    /// The outbound loop already shut down.
    Closed,
}

/// One live session's delivery handle: user identity plus the sending
/// half of its bounded outbound queue.
///
/// Exactly one inbound loop and one outbound loop own the underlying
/// connection; everything else interacts through this handle.
#[derive(Clone)]
pub struct ConnectionHandle {
    session_id: SessionId,
    user_id: String,
    tx: mpsc::Sender<Envelope>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue an envelope without blocking.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason if the queue is full or closed.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), SendRejected> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendRejected::Full,
            mpsc::error::TrySendError::Closed(_) => SendRejected::Closed,
        })
    }

    /// Signal the outbound loop to shut down. Idempotent.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Handle the outbound loop waits on to observe eviction.
    #[must_use]
    pub fn close_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.close)
    }
}

/// Membership change observed by the hub, consumed by the presence
/// worker. Side-effect I/O (store lookups, offline flush) happens there,
/// never on the control loop.
#[derive(Clone)]
pub enum MemberEvent {
    Joined {
        connection: ConnectionHandle,
    },
    Left {
        user_id: String,
        session_id: SessionId,
        /// Sessions this user still holds in this hub (other devices).
        remaining_sessions: usize,
    },
}

enum HubCommand {
    Register(ConnectionHandle),
    Unregister(SessionId),
    Deliver(Envelope),
}

/// The hub's control-loop state. Constructed and consumed by
/// [`Hub::spawn`]; the membership map is owned exclusively by the loop.
pub struct Hub {
    sessions: HashMap<SessionId, ConnectionHandle>,
    events: mpsc::UnboundedSender<MemberEvent>,
}

impl Hub {
    /// Start the control loop.
    ///
    /// Returns the cloneable handle used to interact with the hub, and
    /// the membership-event stream for the presence worker. The loop ends
    /// when every handle is dropped.
    #[must_use]
    pub fn spawn() -> (HubHandle, mpsc::UnboundedReceiver<MemberEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let hub = Hub {
            sessions: HashMap::new(),
            events: event_tx,
        };
        tokio::spawn(hub.run(cmd_rx));
        (
            HubHandle {
                cmd_tx,
                next_session: Arc::new(AtomicU64::new(1)),
            },
            event_rx,
        )
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register(connection) => self.register(connection),
                HubCommand::Unregister(session_id) => self.unregister(session_id),
                HubCommand::Deliver(envelope) => self.deliver(envelope),
            }
        }
        debug!("hub control loop stopped");
    }

    fn register(&mut self, connection: ConnectionHandle) {
        debug!(
            user = %connection.user_id,
            session = connection.session_id,
            "session registered"
        );
        self.sessions.insert(connection.session_id, connection.clone());
        let _ = self.events.send(MemberEvent::Joined { connection });
    }

    fn unregister(&mut self, session_id: SessionId) {
        let Some(connection) = self.sessions.remove(&session_id) else {
            return;
        };
        connection.close();
        let remaining_sessions = self
            .sessions
            .values()
            .filter(|c| c.user_id == connection.user_id)
            .count();
        debug!(
            user = %connection.user_id,
            session = session_id,
            remaining = remaining_sessions,
            "session unregistered"
        );
        let _ = self.events.send(MemberEvent::Left {
            user_id: connection.user_id,
            session_id,
            remaining_sessions,
        });
    }

    fn deliver(&mut self, envelope: Envelope) {
        let mut evicted: Vec<SessionId> = Vec::new();
        for connection in self.sessions.values() {
            if !envelope.is_broadcast() && connection.user_id != envelope.target_user_id {
                continue;
            }
            match connection.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(SendRejected::Full) => {
                    warn!(
                        user = %connection.user_id,
                        session = connection.session_id,
                        "outbound queue full, evicting slow consumer"
                    );
                    evicted.push(connection.session_id);
                }
                Err(SendRejected::Closed) => {
                    evicted.push(connection.session_id);
                }
            }
        }
        for session_id in evicted {
            self.unregister(session_id);
        }
    }
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
    next_session: Arc<AtomicU64>,
}

impl HubHandle {
    /// Register a new session and return its delivery handle.
    ///
    /// `tx` is the sending half of the session's bounded outbound queue;
    /// the caller's outbound loop owns the receiving half.
    pub fn register(&self, user_id: &str, tx: mpsc::Sender<Envelope>) -> ConnectionHandle {
        let connection = ConnectionHandle {
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.to_string(),
            tx,
            close: Arc::new(Notify::new()),
        };
        self.send(HubCommand::Register(connection.clone()));
        connection
    }

    /// Remove a session. Idempotent; the first removal closes the
    /// session's outbound loop.
    pub fn unregister(&self, session_id: SessionId) {
        self.send(HubCommand::Unregister(session_id));
    }

    /// Route an envelope to local connections matching its target
    /// (all of them when untargeted).
    pub fn deliver(&self, envelope: Envelope) {
        self.send(HubCommand::Deliver(envelope));
    }

    /// Inject a targeted envelope from outside a session (e.g. a REST
    /// handler fanning out a group message).
    pub fn send_to_user(&self, user_id: &str, envelope: Envelope) {
        self.deliver(envelope.with_target(user_id));
    }

    /// Inject an untargeted envelope from outside a session.
    pub fn broadcast_all(&self, envelope: Envelope) {
        self.deliver(envelope.with_target(""));
    }

    fn send(&self, command: HubCommand) {
        if self.cmd_tx.send(command).is_err() {
            warn!("hub control loop is gone");
        }
    }
}
