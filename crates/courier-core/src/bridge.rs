//! The cross-instance bus bridge.
//!
//! Every process publishes its outbound envelopes to one shared,
//! at-least-once broadcast medium and subscribes to the same medium,
//! forwarding whatever it receives into its local hub. Recipients filter
//! by target at the hub layer, so the bridge stays transport-agnostic:
//! every subscriber sees every envelope, including its own publications.
//!
//! The bridge is a best-effort fan-out layer, not a durable log: order is
//! preserved per publisher only, and envelopes published while a process
//! is disconnected from the medium are lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_protocol::Envelope;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::hub::HubHandle;

/// Bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Could not reach the medium.
    #[error("bus connect failed: {0}")]
    Connect(String),

    /// The publish was not accepted by the medium.
    #[error("bus publish failed: {0}")]
    Publish(String),

    /// Could not establish a subscription.
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),

    /// Envelope could not be put on the wire.
    #[error(transparent)]
    Protocol(#[from] courier_protocol::ProtocolError),
}

/// A live subscription to the medium.
#[async_trait]
pub trait BusSubscription: Send {
    /// Next envelope from the medium, or `None` once the stream ends and
    /// the caller should resubscribe.
    async fn next_envelope(&mut self) -> Option<Envelope>;
}

/// The shared broadcast medium.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish one envelope to every subscriber.
    async fn publish(&self, envelope: &Envelope) -> Result<(), BridgeError>;

    /// Open a fresh subscription; restartable after a stream ends.
    async fn subscribe(&self) -> Result<Box<dyn BusSubscription>, BridgeError>;

    /// Medium name for logs ("local", "redis").
    fn name(&self) -> &'static str;
}

/// In-process medium for single-node deployments and tests, built on a
/// tokio broadcast channel. Several hubs subscribed to one `LocalBus`
/// behave like several processes sharing a pub/sub channel.
pub struct LocalBus {
    tx: broadcast::Sender<Envelope>,
}

impl LocalBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        // No subscribers yet is not a failure.
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn BusSubscription>, BridgeError> {
        Ok(Box::new(LocalSubscription {
            rx: self.tx.subscribe(),
        }))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

struct LocalSubscription {
    rx: broadcast::Receiver<Envelope>,
}

#[async_trait]
impl BusSubscription for LocalSubscription {
    async fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged, envelopes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Spawn the per-process subscriber task: every envelope received from
/// the medium is handed to the local hub's deliver. Resubscribes with
/// backoff whenever the medium drops; failures never reach the hub loop.
pub fn spawn_forwarder(bus: Arc<dyn Bus>, hub: HubHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new();
        loop {
            match bus.subscribe().await {
                Ok(mut subscription) => {
                    debug!(bus = bus.name(), "bridge subscribed");
                    backoff.reset();
                    while let Some(envelope) = subscription.next_envelope().await {
                        hub.deliver(envelope);
                    }
                    warn!(bus = bus.name(), "bridge stream ended, resubscribing");
                }
                Err(e) => {
                    warn!(bus = bus.name(), error = %e, "bridge subscribe failed");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    })
}

/// Exponential reconnect backoff, capped.
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(30);

    pub(crate) fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}
