//! Redis-backed bus bridge.
//!
//! All processes publish to and subscribe on one well-known channel.
//! Publishing uses a multiplexed connection that is reopened on the next
//! publish after a failure; subscribing hands back a message stream that
//! ends when the connection drops, at which point the forwarder
//! resubscribes (see [`crate::bridge::spawn_forwarder`]). Envelopes
//! published while disconnected are lost - this layer is best-effort
//! fan-out, not a durable log.

use async_trait::async_trait;
use courier_protocol::{codec, Envelope};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::Mutex;
use tracing::warn;

use crate::bridge::{BridgeError, Bus, BusSubscription};

/// Default well-known channel name.
pub const DEFAULT_CHANNEL: &str = "courier:events";

/// Bus bridge over Redis pub/sub.
pub struct RedisBus {
    client: redis::Client,
    channel: String,
    publish_conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisBus {
    /// Create a bus against `url`, publishing on `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not a valid Redis URL. No network
    /// I/O happens here; connections are opened lazily.
    pub fn open(url: &str, channel: &str) -> Result<Self, BridgeError> {
        let client = redis::Client::open(url).map_err(|e| BridgeError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.to_string(),
            publish_conn: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        let wire = codec::encode(envelope)?;

        let mut guard = self.publish_conn.lock().await;
        if guard.is_none() {
            let conn = self
                .client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(|e| BridgeError::Connect(e.to_string()))?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(BridgeError::Connect("no publish connection".into()));
        };

        match redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(&wire)
            .query_async::<()>(conn)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // Drop the broken connection; the next publish reopens it.
                *guard = None;
                Err(BridgeError::Publish(e.to_string()))
            }
        }
    }

    async fn subscribe(&self) -> Result<Box<dyn BusSubscription>, BridgeError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BridgeError::Subscribe(e.to_string()))?;

        Ok(Box::new(RedisSubscription {
            stream: pubsub.into_on_message().boxed(),
        }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct RedisSubscription {
    stream: BoxStream<'static, redis::Msg>,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            let msg = self.stream.next().await?;
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "non-text payload on bus channel, skipping");
                    continue;
                }
            };
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    warn!(error = %e, "undecodable envelope on bus channel, skipping");
                }
            }
        }
    }
}
