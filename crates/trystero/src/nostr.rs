//! Nostr relay transport implementation
//!
//! Wraps nostr-sdk Client to implement the RelayTransport trait for production use.
//! Signals are plain events of the channel's derived kind, tagged `["x", topicHash]`
//! and signed with the room's keypair.

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::topic::{Channel, TOPIC_TAG};
use crate::transport::{RelayEvent, RelayTransport, TransportError};

/// Nostr relay transport for production signaling
pub struct NostrRelayTransport {
    /// Our pubkey (hex), used as relay identity
    pubkey: String,
    keys: Keys,
    client: Client,
    connected: AtomicBool,
    event_tx: mpsc::UnboundedSender<RelayEvent>,
    event_rx: Mutex<mpsc::UnboundedReceiver<RelayEvent>>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl NostrRelayTransport {
    /// Create a new Nostr relay transport with its own client
    pub fn new(keys: Keys) -> Self {
        // In-memory database so repeated announcements are not deduplicated away
        let client = ClientBuilder::new()
            .signer(keys.clone())
            .database(nostr_sdk::database::MemoryDatabase::new())
            .build();

        Self::with_client(client, keys)
    }

    /// Create a new Nostr relay transport with an existing client
    pub fn with_client(client: Client, keys: Keys) -> Self {
        let pubkey = keys.public_key().to_hex();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            pubkey,
            keys,
            client,
            connected: AtomicBool::new(false),
            event_tx,
            event_rx: Mutex::new(event_rx),
            handler: Mutex::new(None),
        }
    }

    /// Get the nostr client (for advanced usage)
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Start the background event handler
    fn start_event_handler(&self) -> JoinHandle<()> {
        let event_tx = self.event_tx.clone();
        let mut notifications = self.client.notifications();

        tokio::spawn(async move {
            debug!("[NostrTransport] Event handler started");
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event { event, .. }) => {
                        if event_tx.send(Self::to_relay_event(&event)).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("[NostrTransport] Event handler closed");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[NostrTransport] Event handler lagged by {} messages", n);
                        continue;
                    }
                }
            }
        })
    }

    fn to_relay_event(event: &Event) -> RelayEvent {
        let tags = event
            .tags
            .iter()
            .filter_map(|tag| {
                let v: Vec<String> = tag.clone().to_vec();
                if v.len() >= 2 {
                    Some((v[0].clone(), v[1].clone()))
                } else {
                    None
                }
            })
            .collect();

        RelayEvent {
            kind: event.kind.as_u16(),
            tags,
            content: event.content.clone(),
            identity: event.pubkey.to_hex(),
        }
    }

    fn topic_tag(topic_hash: &str) -> Tag {
        Tag::custom(
            TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::X)),
            vec![topic_hash.to_string()],
        )
    }
}

#[async_trait]
impl RelayTransport for NostrRelayTransport {
    async fn connect(&self, relays: &[String]) -> Result<(), TransportError> {
        for relay in relays {
            self.client
                .add_relay(relay)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        }

        info!("[NostrTransport] Connecting to {} relays...", relays.len());
        self.client.connect().await;

        let mut handler = self.handler.lock().await;
        if handler.is_none() {
            *handler = Some(self.start_event_handler());
        }

        self.connected.store(true, Ordering::Relaxed);
        info!("[NostrTransport] Transport connected and ready");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(handler) = self.handler.lock().await.take() {
            handler.abort();
        }
        if let Err(e) = self.client.disconnect().await {
            debug!("[NostrTransport] Disconnect error: {}", e);
        }
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }

        let filters: Vec<Filter> = channels
            .iter()
            .map(|channel| {
                Filter::new()
                    .kind(Kind::Custom(channel.event_kind))
                    .custom_tag(
                        SingleLetterTag::lowercase(Alphabet::X),
                        vec![channel.topic_hash.clone()],
                    )
                    .since(Timestamp::now())
            })
            .collect();

        self.client
            .subscribe(filters, None)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!("[NostrTransport] Subscribed to {} channels", channels.len());
        Ok(())
    }

    async fn publish(&self, channel: &Channel, content: String) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }

        let tags = vec![Self::topic_tag(&channel.topic_hash)];
        let event = EventBuilder::new(Kind::Custom(channel.event_kind), content, tags)
            .to_event(&self.keys)
            .map_err(|e| TransportError::SendFailed(format!("Failed to sign event: {}", e)))?;

        match self.client.send_event(event).await {
            Ok(output) => {
                if output.success.is_empty() {
                    warn!("[NostrTransport] Event rejected - no relay accepted it");
                    return Err(TransportError::SendFailed("No relay accepted event".to_string()));
                }
                debug!(
                    "[NostrTransport] kind={} {}={} sent to {} relays",
                    channel.event_kind,
                    TOPIC_TAG,
                    channel.topic_hash,
                    output.success.len()
                );
                Ok(())
            }
            Err(e) => {
                warn!("[NostrTransport] Send error: {}", e);
                Err(TransportError::SendFailed(e.to_string()))
            }
        }
    }

    async fn recv(&self) -> Option<RelayEvent> {
        self.event_rx.lock().await.recv().await
    }

    fn identity(&self) -> &str {
        &self.pubkey
    }
}
