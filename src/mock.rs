//! Mock-Implementierungen für Tests und Simulation
//!
//! In-Memory-Relay, Peer-Connection-Fabrik, Medienquelle und Presenter
//! auf Kanal-Basis, ohne echtes Netzwerk, Geräte oder ICE. Das Relay
//! routet anhand der `target`-Identität und broadcastet `peer-joined`
//! in beide Richtungen (Beitretender ↔ bestehende Mitglieder).

use crate::call::{PeerId, RoomId};
use crate::peer::{
    Connectivity, LocalMedia, MediaConstraints, MediaError, MediaSource, NegotiationError,
    PeerConnection, PeerConnector, PeerEvent, SdpKind,
};
use crate::presenter::{CallDecision, IncomingCallPresenter, IncomingCallRequest};
use crate::signaling::{ChannelError, SignalingConnection, SignalingEvent, SignalingMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

// ============================================================================
// MOCK RELAY
// ============================================================================

struct RelayInner {
    clients: HashMap<PeerId, broadcast::Sender<SignalingEvent>>,
    rooms: HashMap<RoomId, Vec<PeerId>>,
    log: Vec<SignalingMessage>,
    paused: bool,
    held: Vec<(PeerId, SignalingMessage)>,
}

/// In-Memory-Signaling-Relay für beliebig viele Clients
pub struct MockRelay {
    inner: Mutex<RelayInner>,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RelayInner {
                clients: HashMap::new(),
                rooms: HashMap::new(),
                log: Vec::new(),
                paused: false,
                held: Vec::new(),
            }),
        })
    }

    /// Erstellt einen Kanal für die angegebene Identität
    pub fn client(self: &Arc<Self>, user_id: PeerId) -> Arc<MockSignaling> {
        let (event_tx, _) = broadcast::channel(100);
        Arc::new(MockSignaling {
            relay: Arc::clone(self),
            user_id,
            connected: AtomicBool::new(false),
            fail_next_connect: AtomicBool::new(false),
            event_tx,
        })
    }

    /// Alle gerouteten Nachrichten, in Versandreihenfolge
    pub fn sent_messages(&self) -> Vec<SignalingMessage> {
        self.inner.lock().log.clone()
    }

    /// Anzahl der gerouteten Offers (inklusive ICE-Restarts)
    pub fn offer_count(&self) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|m| matches!(m, SignalingMessage::Offer { .. }))
            .count()
    }

    fn attach(&self, user_id: PeerId, events: broadcast::Sender<SignalingEvent>) {
        self.inner.lock().clients.insert(user_id, events);
    }

    fn detach(&self, user_id: &PeerId) {
        self.inner.lock().clients.remove(user_id);
    }

    /// Hält alle Zustellungen zurück, bis `resume()` sie freigibt
    ///
    /// Damit lassen sich Wettläufe (z.B. Glare: beide Einladungen
    /// kreuzen sich) deterministisch herstellen.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    /// Stellt zurückgehaltene Nachrichten in Originalreihenfolge zu
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.paused = false;
        let held = std::mem::take(&mut inner.held);
        for (target, message) in held {
            Self::deliver(&mut inner, &target, message);
        }
    }

    fn deliver(inner: &mut RelayInner, target: &PeerId, message: SignalingMessage) {
        if inner.paused {
            inner.held.push((target.clone(), message));
            return;
        }
        if let Some(events) = inner.clients.get(target) {
            let _ = events.send(SignalingEvent::Message(message));
        } else {
            tracing::debug!("Mock relay: no client for {}, dropping message", target);
        }
    }

    fn route(&self, from: &PeerId, message: SignalingMessage) {
        let mut inner = self.inner.lock();
        inner.log.push(message.clone());

        match &message {
            SignalingMessage::Register { .. } => {}
            SignalingMessage::JoinRoom { room_id } => {
                let members = inner.rooms.entry(room_id.clone()).or_default();
                if !members.contains(from) {
                    members.push(from.clone());
                }
                let members = members.clone();

                // Beitritt in beide Richtungen bekannt machen
                for member in members.iter().filter(|m| *m != from) {
                    Self::deliver(
                        &mut inner,
                        member,
                        SignalingMessage::PeerJoined {
                            user_id: from.clone(),
                            room_id: room_id.clone(),
                        },
                    );
                    Self::deliver(
                        &mut inner,
                        from,
                        SignalingMessage::PeerJoined {
                            user_id: member.clone(),
                            room_id: room_id.clone(),
                        },
                    );
                }
            }
            other => {
                if let Some(target) = other.target() {
                    let target = target.clone();
                    Self::deliver(&mut inner, &target, message);
                }
            }
        }
    }
}

// ============================================================================
// MOCK SIGNALING CHANNEL
// ============================================================================

/// Kanal eines einzelnen Clients zum [`MockRelay`]
pub struct MockSignaling {
    relay: Arc<MockRelay>,
    user_id: PeerId,
    connected: AtomicBool,
    fail_next_connect: AtomicBool,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl MockSignaling {
    /// Simuliert einen Transportabriss (Relay-seitig getrennt)
    pub fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.relay.detach(&self.user_id);
            let _ = self.event_tx.send(SignalingEvent::Disconnected);
        }
    }

    /// Lässt den nächsten `connect()`-Versuch fehlschlagen
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingConnection for MockSignaling {
    async fn connect(&self) -> Result<(), ChannelError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(ChannelError::ConnectionFailed(
                "simulated connect failure".to_string(),
            ));
        }

        self.relay
            .attach(self.user_id.clone(), self.event_tx.clone());
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(SignalingEvent::Connected);

        self.relay.route(
            &self.user_id,
            SignalingMessage::Register {
                user_id: self.user_id.clone(),
            },
        );
        Ok(())
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.relay.route(&self.user_id, message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    async fn disconnect(&self) {
        self.drop_connection();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ============================================================================
// MOCK MEDIA SOURCE
// ============================================================================

/// Medienquelle ohne Geräte; Stop-Flags bleiben für Assertions erhalten
pub struct MockMediaSource {
    fail_remaining: AtomicUsize,
    delay: Mutex<Duration>,
    handles: Mutex<Vec<Arc<AtomicBool>>>,
    acquisitions: AtomicUsize,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            handles: Mutex::new(Vec::new()),
            acquisitions: AtomicUsize::new(0),
        })
    }

    /// Lässt die nächsten `n` Acquisitions fehlschlagen
    pub fn fail_times(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Verzögert jede Acquisition (simulierter Permission-Prompt)
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Anzahl gestarteter Acquisitions
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Anzahl erfolgreich ausgegebener Handles
    pub fn handles_created(&self) -> usize {
        self.handles.lock().len()
    }

    /// true wenn jedes ausgegebene Handle gestoppt wurde
    pub fn all_released(&self) -> bool {
        self.handles
            .lock()
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(MediaError::AccessDenied("simulated denial".to_string()));
        }

        let media = LocalMedia::new(constraints, None);
        self.handles.lock().push(media.stop_flag());
        Ok(media)
    }
}

// ============================================================================
// MOCK PEER CONNECTOR
// ============================================================================

/// Beobachtbarer Zustand einer Mock-Verbindung
pub struct MockConnectionState {
    events: mpsc::Sender<PeerEvent>,
    applied_candidates: Mutex<Vec<String>>,
    remote_descriptions: Mutex<Vec<(SdpKind, String)>>,
    offers_created: AtomicUsize,
    closed: AtomicBool,
}

impl MockConnectionState {
    /// Speist ein Connectivity-Ereignis in die Session ein
    pub async fn emit_connectivity(&self, connectivity: Connectivity) {
        let _ = self
            .events
            .send(PeerEvent::ConnectivityChanged(connectivity))
            .await;
    }

    /// Speist einen lokal "entdeckten" Kandidaten ein
    pub async fn emit_candidate(&self, candidate: &str) {
        let _ = self
            .events
            .send(PeerEvent::CandidateDiscovered(candidate.to_string()))
            .await;
    }

    /// Angewendete Remote-Kandidaten, in Reihenfolge
    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied_candidates.lock().clone()
    }

    /// Gesetzte Remote Descriptions, in Reihenfolge
    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.remote_descriptions.lock().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    state: Arc<MockConnectionState>,
    label: String,
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let n = self.state.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 offer-{}-{}", self.label, n))
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        Ok(format!("v=0 answer-{}", self.label))
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), NegotiationError> {
        self.state
            .remote_descriptions
            .lock()
            .push((kind, sdp.to_string()));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError> {
        if candidate.contains("malformed") {
            return Err(NegotiationError::InvalidCandidate(candidate.to_string()));
        }
        self.state
            .applied_candidates
            .lock()
            .push(candidate.to_string());
        Ok(())
    }

    async fn restart_negotiation(&self) -> Result<String, NegotiationError> {
        let n = self.state.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 restart-offer-{}-{}", self.label, n))
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Fabrik für Mock-Verbindungen; erzeugte Zustände bleiben einsehbar
pub struct MockConnector {
    label: String,
    created: Mutex<Vec<Arc<MockConnectionState>>>,
    connection_ready: Notify,
}

impl MockConnector {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            created: Mutex::new(Vec::new()),
            connection_ready: Notify::new(),
        })
    }

    /// Zustände aller bisher erzeugten Verbindungen
    pub fn connections(&self) -> Vec<Arc<MockConnectionState>> {
        self.created.lock().clone()
    }

    /// Wartet bis mindestens eine Verbindung erzeugt wurde
    pub async fn wait_for_connection(&self) -> Arc<MockConnectionState> {
        loop {
            // Erst den Waiter registrieren, dann prüfen: kein lost wakeup
            let mut notified = std::pin::pin!(self.connection_ready.notified());
            notified.as_mut().enable();
            if let Some(state) = self.created.lock().first().cloned() {
                return state;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn create(
        &self,
        _media: &LocalMedia,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        let state = Arc::new(MockConnectionState {
            events,
            applied_candidates: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            offers_created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.created.lock().push(Arc::clone(&state));
        self.connection_ready.notify_waiters();

        Ok(Box::new(MockConnection {
            state,
            label: self.label.clone(),
        }))
    }
}

// ============================================================================
// SCRIPTED PRESENTER
// ============================================================================

enum Script {
    Decide(CallDecision),
    /// Nie entscheiden; nur `dismiss()` beendet die Anzeige
    Silent,
}

/// Presenter mit vorab festgelegtem Verhalten
pub struct ScriptedPresenter {
    script: Script,
    delay: Duration,
    dismissed: Notify,
    dismiss_count: AtomicUsize,
}

impl ScriptedPresenter {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            script: Script::Decide(CallDecision::Accept),
            delay: Duration::ZERO,
            dismissed: Notify::new(),
            dismiss_count: AtomicUsize::new(0),
        })
    }

    /// Benutzer überlegt kurz und nimmt dann an
    pub fn accepting_after(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Decide(CallDecision::Accept),
            delay,
            dismissed: Notify::new(),
            dismiss_count: AtomicUsize::new(0),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            script: Script::Decide(CallDecision::Reject),
            delay: Duration::ZERO,
            dismissed: Notify::new(),
            dismiss_count: AtomicUsize::new(0),
        })
    }

    /// Benutzer reagiert nie; der Ring-Timeout muss greifen
    pub fn never_answering() -> Arc<Self> {
        Arc::new(Self {
            script: Script::Silent,
            delay: Duration::ZERO,
            dismissed: Notify::new(),
            dismiss_count: AtomicUsize::new(0),
        })
    }

    /// Wie oft `dismiss()` aufgerufen wurde
    pub fn dismiss_count(&self) -> usize {
        self.dismiss_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IncomingCallPresenter for ScriptedPresenter {
    async fn present_incoming_call(&self, _request: IncomingCallRequest) -> CallDecision {
        match self.script {
            Script::Decide(decision) => {
                if self.delay > Duration::ZERO {
                    tokio::time::sleep(self.delay).await;
                }
                decision
            }
            Script::Silent => {
                self.dismissed.notified().await;
                CallDecision::Reject
            }
        }
    }

    fn dismiss(&self) {
        self.dismiss_count.fetch_add(1, Ordering::SeqCst);
        self.dismissed.notify_waiters();
    }
}
