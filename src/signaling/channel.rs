//! WebSocket-Kanal zum Signaling-Relay
//!
//! Verwaltet genau eine Verbindung zum Relay:
//! - `connect()` ist idempotent, `disconnect()` beliebig oft aufrufbar
//! - Authentifizierung per Bearer-Credential im Upgrade-Request
//! - Keepalive-Pings gegen Idle-Timeouts des Relays
//! - Event-basierte Zustellung in Ankunftsreihenfolge
//!
//! Ein Reconnect nach Verbindungsabriss passiert bewusst NICHT
//! automatisch: ob ein abgerissener Kanal mitten im Anruf wieder
//! aufgebaut wird, entscheidet die Call State Machine.

use super::messages::{Envelope, SignalingMessage};
use crate::call::PeerId;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("websocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected to signaling relay")]
    NotConnected,

    #[error("failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// CHANNEL EVENTS
// ============================================================================

/// Events, die der Kanal an seine Abonnenten verteilt
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbindung zum Relay steht
    Connected,

    /// Verbindung wurde getrennt (vom Relay oder lokal)
    Disconnected,

    /// Eingehende Signaling-Nachricht
    Message(SignalingMessage),
}

// ============================================================================
// CONNECTION TRAIT
// ============================================================================

/// Abstraktion über den Relay-Transport
///
/// Produktiv implementiert durch [`SignalingChannel`]; Tests verwenden
/// das In-Memory-Relay aus [`crate::mock`].
#[async_trait]
pub trait SignalingConnection: Send + Sync {
    /// Baut die Verbindung auf; no-op falls bereits verbunden
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Sendet eine Nachricht; Zustellfehler werden nie verschluckt
    async fn send(&self, message: SignalingMessage) -> Result<(), ChannelError>;

    /// Gibt einen Event-Receiver zurück (Zustellung in Ankunftsreihenfolge)
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    /// Trennt die Verbindung; beliebig oft aufrufbar
    async fn disconnect(&self);

    /// Prüft ob verbunden
    fn is_connected(&self) -> bool;
}

// ============================================================================
// CHANNEL STATE
// ============================================================================

#[derive(Debug, Default)]
struct ChannelState {
    is_connected: bool,
}

/// Markiert den Kanal als getrennt und meldet das genau einmal
fn mark_disconnected(state: &Arc<RwLock<ChannelState>>, event_tx: &broadcast::Sender<SignalingEvent>) {
    let was_connected = {
        let mut s = state.write();
        std::mem::replace(&mut s.is_connected, false)
    };
    if was_connected {
        let _ = event_tx.send(SignalingEvent::Disconnected);
    }
}

// ============================================================================
// WEBSOCKET CHANNEL
// ============================================================================

/// WebSocket-Client für die Relay-Kommunikation
pub struct SignalingChannel {
    relay_url: String,
    user_id: PeerId,
    bearer_token: String,
    keepalive_interval: Duration,
    state: Arc<RwLock<ChannelState>>,
    tx: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingChannel {
    /// Erstellt einen neuen, noch nicht verbundenen Kanal
    pub fn new(
        relay_url: String,
        user_id: PeerId,
        bearer_token: String,
        keepalive_interval: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            relay_url,
            user_id,
            bearer_token,
            keepalive_interval,
            state: Arc::new(RwLock::new(ChannelState::default())),
            tx: Arc::new(RwLock::new(None)),
            event_tx,
        }
    }

    /// Leitet die WebSocket-URL aus der Relay-URL ab
    fn websocket_url(relay_url: &str) -> Result<String, ChannelError> {
        let url = Url::parse(relay_url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ChannelError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };

        let rest = url
            .as_str()
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or_default();

        Ok(format!("{scheme}://{}/ws", rest.trim_end_matches('/')))
    }

    /// Startet den Lese-Task: parst eingehende Frames und verteilt sie
    fn spawn_read_task(
        &self,
        mut read: impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin
            + Send
            + 'static,
    ) {
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(message) => {
                                tracing::debug!("Received {} message", message.message_type());
                                let _ = event_tx.send(SignalingEvent::Message(message));
                            }
                            Err(e) => {
                                tracing::warn!("Dropping unparseable relay frame: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            mark_disconnected(&state, &event_tx);
        });
    }

    /// Startet den Schreib-Task: leitet ausgehende Frames an den Socket
    fn spawn_write_task(
        &self,
        mut write: impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin
            + Send
            + 'static,
        mut rx: mpsc::Receiver<Message>,
    ) {
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }

            mark_disconnected(&state, &event_tx);
        });
    }

    /// Startet den Keepalive-Task gegen Relay-Idle-Timeouts
    fn spawn_keepalive_task(&self, tx: mpsc::Sender<Message>) {
        let state = Arc::clone(&self.state);
        let interval = self.keepalive_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !state.read().is_connected {
                    break;
                }
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl SignalingConnection for SignalingChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Ok(());
        }

        let ws_url = Self::websocket_url(&self.relay_url)?;
        tracing::info!("Connecting to signaling relay: {}", ws_url);

        // Bearer-Credential in den Upgrade-Request
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.bearer_token))
            .map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth_value);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<Message>(100);

        *self.tx.write() = Some(tx.clone());
        self.state.write().is_connected = true;

        self.spawn_read_task(read);
        self.spawn_write_task(write, rx);
        self.spawn_keepalive_task(tx);

        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Anmeldung beim Relay, damit es target-basiert routen kann
        self.send(SignalingMessage::Register {
            user_id: self.user_id.clone(),
        })
        .await?;

        tracing::info!("Registered at relay as {}", self.user_id);
        Ok(())
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), ChannelError> {
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or(ChannelError::NotConnected)?;

        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        tracing::debug!("Sending {} message", message.message_type());

        let envelope = Envelope::wrap(message);
        let json =
            serde_json::to_string(&envelope).map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        tx.send(Message::Text(json))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    async fn disconnect(&self) {
        // Sender fallen lassen beendet den Schreib-Task und damit den Socket
        let _ = self.tx.write().take();
        mark_disconnected(&self.state, &self.event_tx);
    }

    fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("relay_url", &self.relay_url)
            .field("user_id", &self.user_id)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}
