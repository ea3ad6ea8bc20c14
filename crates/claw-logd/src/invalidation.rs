//! Cross-instance invalidation.
//!
//! Every filter mutation publishes an [`Invalidation`] carrying the
//! publishing instance's identity. Each instance runs one listener task that
//! ignores its own messages and reloads the registry from the store on any
//! other. The persisted definitions stay the source of truth; a lost message
//! only delays convergence.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LogdError, Result};
use crate::lifecycle::FilterManager;

/// Receiver half of a shutdown broadcast.
pub type ShutdownRx = broadcast::Receiver<()>;

/// Default per-channel buffer of a [`LocalBus`].
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// A message delivered by the pub/sub transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// Publish/subscribe transport for invalidation messages.
///
/// Delivery is best effort. Publishing to a channel nobody listens on is not
/// an error.
pub trait InvalidationBus: Send + Sync {
    /// Publishes a payload to every subscriber of `channel`.
    fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribes to `channel`.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage>;
}

/// In-process bus shared by several service instances.
#[derive(Debug)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
    offline: AtomicBool,
    published: AtomicU64,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }
}

impl LocalBus {
    /// Creates a bus with the default per-channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus buffering up to `capacity` messages per channel.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            offline: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    /// Simulates a transport outage: publishes fail while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Returns the number of messages published successfully.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl InvalidationBus for LocalBus {
    fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LogdError::Broadcast(format!("bus offline, channel {channel}")));
        }
        let message = BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // A send error only means nobody is subscribed.
        let _ = self.sender(channel).send(message);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        self.sender(channel).subscribe()
    }
}

/// Invalidation envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// Identity of the publishing instance.
    pub origin: Uuid,
}

impl Invalidation {
    /// Creates an envelope for `origin`.
    #[must_use]
    pub const fn new(origin: Uuid) -> Self {
        Self { origin }
    }

    /// Encodes the envelope as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not an invalidation envelope.
    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// What a listener should do with a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Another instance changed the filter set.
    Reload(Uuid),
    /// Published by this instance.
    Own,
    /// Not for the invalidation channel.
    OtherChannel,
    /// The payload could not be decoded.
    Malformed(String),
}

/// Classifies a message received by the instance `instance`.
#[must_use]
pub fn classify(message: &BusMessage, channel: &str, instance: Uuid) -> Verdict {
    if message.channel != channel {
        return Verdict::OtherChannel;
    }
    match Invalidation::decode(&message.payload) {
        Ok(inv) if inv.origin == instance => Verdict::Own,
        Ok(inv) => Verdict::Reload(inv.origin),
        Err(e) => Verdict::Malformed(e.to_string()),
    }
}

/// Spawns the listener task for `manager`. It stops when `shutdown` fires or
/// the bus closes.
pub fn spawn_listener(
    manager: Arc<FilterManager>,
    mut messages: broadcast::Receiver<BusMessage>,
    mut shutdown: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let channel = manager.channel().to_string();
        let instance = manager.instance_id();
        info!(%channel, %instance, "invalidation listener started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("invalidation listener stopping");
                    break;
                }
                received = messages.recv() => match received {
                    Ok(message) => match classify(&message, &channel, instance) {
                        Verdict::Reload(origin) => {
                            debug!(%origin, "filter invalidation received");
                            reload(&manager).await;
                        }
                        Verdict::Own => debug!("ignoring own invalidation"),
                        Verdict::OtherChannel => {}
                        Verdict::Malformed(reason) => {
                            warn!(%reason, "ignoring malformed invalidation message");
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "invalidation listener lagged, reloading");
                        reload(&manager).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("invalidation bus closed, listener exiting");
                        break;
                    }
                },
            }
        }
    })
}

async fn reload(manager: &FilterManager) {
    match manager.reload().await {
        Ok(count) => info!(filters = count, "filters reloaded after invalidation"),
        Err(e) => warn!(error = %e, "filter reload after invalidation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: &str, payload: &str) -> BusMessage {
        BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn envelope_encoding() {
        let origin = Uuid::new_v4();
        let payload = Invalidation::new(origin).encode().unwrap_or_default();
        assert_eq!(payload, format!(r#"{{"origin":"{origin}"}}"#));
        assert_eq!(Invalidation::decode(&payload).ok(), Some(Invalidation::new(origin)));
        assert!(Invalidation::decode("{}").is_err());
    }

    #[test]
    fn classify_messages() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let own = Invalidation::new(me).encode().unwrap_or_default();
        let foreign = Invalidation::new(other).encode().unwrap_or_default();

        assert_eq!(classify(&message("ch", &own), "ch", me), Verdict::Own);
        assert_eq!(classify(&message("ch", &foreign), "ch", me), Verdict::Reload(other));
        assert_eq!(classify(&message("x", &foreign), "ch", me), Verdict::OtherChannel);
        assert!(matches!(
            classify(&message("ch", "garbage"), "ch", me),
            Verdict::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn local_bus_delivers_to_every_subscriber() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("ch");
        let mut b = bus.subscribe("ch");
        let mut other = bus.subscribe("other");

        assert!(bus.publish("ch", "hello").is_ok());
        assert_eq!(a.recv().await.ok(), Some(message("ch", "hello")));
        assert_eq!(b.recv().await.ok(), Some(message("ch", "hello")));
        assert!(other.try_recv().is_err());
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn publish_without_subscribers_succeeds() {
        let bus = LocalBus::new();
        assert!(bus.publish("ch", "x").is_ok());
    }

    #[test]
    fn offline_bus_fails_publish() {
        let bus = LocalBus::new();
        let _rx = bus.subscribe("ch");
        bus.set_offline(true);
        assert!(matches!(bus.publish("ch", "x"), Err(LogdError::Broadcast(_))));
        bus.set_offline(false);
        assert!(bus.publish("ch", "x").is_ok());
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn lagged_receiver_reports_lag() {
        let bus = LocalBus::with_capacity(2);
        let mut rx = bus.subscribe("ch");
        for n in 0..5 {
            let _ = bus.publish("ch", &n.to_string());
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }
}
