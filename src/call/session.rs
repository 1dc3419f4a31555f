//! Call State Machine
//!
//! Der Lebenszyklus-Controller: Idle → Calling → Ringing (Gegenseite) →
//! InCall → Idle, plus terminales Failed. Läuft als ein Actor-Task;
//! Kommandos, Signaling-Events, Peer-Events und Medienergebnisse werden
//! über genau eine `select!`-Schleife serialisiert, Handler laufen also
//! nie nebenläufig zueinander.
//!
//! Glare-Auflösung: nur der Initiator erstellt das erste Offer. Rufen
//! sich beide Seiten gleichzeitig an, bleibt die lexikographisch
//! kleinere PeerId Initiator und die größere wechselt auf Responder;
//! beide entscheiden das aus rein lokalen Daten identisch.

use super::monitor::{MonitorAction, ReconnectionMonitor};
use super::room::{PeerId, RoomId};
use crate::config::CallConfig;
use crate::peer::{
    Connectivity, LocalMedia, MediaError, MediaSource, NegotiationError, PeerConnection,
    PeerConnector, PeerEvent, SdpKind,
};
use crate::presenter::{CallDecision, IncomingCallPresenter, IncomingCallRequest};
use crate::signaling::{ChannelError, SignalingConnection, SignalingEvent, SignalingMessage};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("already in a call")]
    AlreadyInCall,

    #[error("call timed out")]
    Timeout,

    #[error("signaling channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("negotiation failure: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("call state machine stopped")]
    Stopped,
}

// ============================================================================
// STATES, ROLES, EVENTS
// ============================================================================

/// Rolle innerhalb einer Session; wird genau einmal entschieden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Responder,
}

/// Aktueller Status der State Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf wird aufgebaut (oder angenommener Anruf verhandelt)
    Calling { peer_id: PeerId },
    /// Eingehender Anruf wartet auf Antwort
    Ringing { peer_id: PeerId },
    /// Anruf aktiv
    InCall { peer_id: PeerId },
    /// Fataler Fehler; Ressourcen werden freigegeben, danach Idle
    Failed,
}

/// Events, die die State Machine an Abonnenten verteilt
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall(IncomingCallRequest),
    RejectedByPeer { peer_id: PeerId },
    Error(CallError),
}

/// Lokale Identität samt Anzeigename
#[derive(Debug, Clone)]
pub struct CallParticipant {
    pub id: PeerId,
    pub display_name: String,
}

// ============================================================================
// COMMANDS & INTERNAL EVENTS
// ============================================================================

enum Command {
    Initiate {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept,
    Reject,
    End,
    QueryState {
        reply: oneshot::Sender<CallState>,
    },
    PresenterDecision {
        session_id: Uuid,
        decision: CallDecision,
    },
}

/// Ergebnis einer (abbrechbaren) Medienaufnahme
struct MediaReady {
    generation: u64,
    result: Result<LocalMedia, MediaError>,
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

/// Aggregat einer laufenden Session; exklusiv vom Actor gehalten
struct ActiveCall {
    session_id: Uuid,
    remote: PeerId,
    room: RoomId,
    role: CallRole,
    media: Option<LocalMedia>,
    connection: Option<Box<dyn PeerConnection>>,
    /// Kandidaten, die vor der Remote Description eingetroffen sind
    pending_candidates: VecDeque<String>,
    /// Offer, das vor Abschluss der Medienaufnahme eingetroffen ist
    pending_offer: Option<String>,
    remote_description_set: bool,
    peer_joined: bool,
    offer_sent: bool,
    media_generation: u64,
    media_retry_used: bool,
    monitor: ReconnectionMonitor,
    ring_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
}

impl ActiveCall {
    fn new(session_id: Uuid, remote: PeerId, room: RoomId, role: CallRole, config: &CallConfig) -> Self {
        Self {
            session_id,
            remote,
            room,
            role,
            media: None,
            connection: None,
            pending_candidates: VecDeque::new(),
            pending_offer: None,
            remote_description_set: false,
            peer_joined: false,
            offer_sent: false,
            media_generation: 0,
            media_retry_used: false,
            monitor: ReconnectionMonitor::new(config.failure_window),
            ring_deadline: None,
            grace_deadline: None,
        }
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Griff auf die laufende State Machine
#[derive(Clone)]
pub struct CallHandle {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Startet einen ausgehenden Anruf
    pub async fn initiate(&self, peer: PeerId) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Initiate { peer, reply })
            .await
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept(&self) -> Result<(), CallError> {
        self.cmd_tx
            .send(Command::Accept)
            .await
            .map_err(|_| CallError::Stopped)
    }

    /// Lehnt den klingelnden Anruf ab
    pub async fn reject(&self) -> Result<(), CallError> {
        self.cmd_tx
            .send(Command::Reject)
            .await
            .map_err(|_| CallError::Stopped)
    }

    /// Beendet den laufenden Anruf(-Versuch)
    pub async fn end(&self) -> Result<(), CallError> {
        self.cmd_tx
            .send(Command::End)
            .await
            .map_err(|_| CallError::Stopped)
    }

    /// Gibt den aktuellen Status zurück
    pub async fn state(&self) -> Result<CallState, CallError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::QueryState { reply })
            .await
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)
    }
}

// ============================================================================
// CALL STATE MACHINE
// ============================================================================

/// Der Actor hinter [`CallHandle`]
pub struct CallStateMachine {
    local: CallParticipant,
    config: CallConfig,
    channel: Arc<dyn SignalingConnection>,
    media_source: Arc<dyn MediaSource>,
    connector: Arc<dyn PeerConnector>,
    presenter: Arc<dyn IncomingCallPresenter>,
    state: CallState,
    call: Option<ActiveCall>,
    next_generation: u64,
    reconnect_used: bool,
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<CallEvent>,
    peer_tx: mpsc::Sender<PeerEvent>,
    media_tx: mpsc::Sender<MediaReady>,
}

impl CallStateMachine {
    /// Startet die State Machine als Actor-Task
    ///
    /// Pro lokaler Identität darf es höchstens eine geben; der Kanal
    /// ist prozessweit geteilt und wird hier nur benutzt, nie besessen.
    pub fn spawn(
        local: CallParticipant,
        config: CallConfig,
        channel: Arc<dyn SignalingConnection>,
        media_source: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
        presenter: Arc<dyn IncomingCallPresenter>,
    ) -> CallHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(100);
        let (peer_tx, peer_rx) = mpsc::channel(100);
        let (media_tx, media_rx) = mpsc::channel(4);
        let sig_rx = channel.subscribe();

        let machine = Self {
            local,
            config,
            channel,
            media_source,
            connector,
            presenter,
            state: CallState::Idle,
            call: None,
            next_generation: 0,
            reconnect_used: false,
            cmd_tx: cmd_tx.clone(),
            event_tx: event_tx.clone(),
            peer_tx,
            media_tx,
        };

        tokio::spawn(machine.run(cmd_rx, sig_rx, peer_rx, media_rx));

        CallHandle { cmd_tx, event_tx }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut sig_rx: broadcast::Receiver<SignalingEvent>,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
        mut media_rx: mpsc::Receiver<MediaReady>,
    ) {
        loop {
            let ring_at = self.call.as_ref().and_then(|c| c.ring_deadline);
            let grace_at = self.call.as_ref().and_then(|c| c.grace_deadline);

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = sig_rx.recv() => match event {
                    Ok(event) => self.handle_signaling_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Signaling receiver lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::error!("Signaling event stream closed");
                        break;
                    }
                },
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
                Some(ready) = media_rx.recv() => self.handle_media_ready(ready).await,
                _ = tokio::time::sleep_until(ring_at.unwrap_or_else(Instant::now)), if ring_at.is_some() => {
                    self.handle_ring_timeout().await;
                }
                _ = tokio::time::sleep_until(grace_at.unwrap_or_else(Instant::now)), if grace_at.is_some() => {
                    self.handle_grace_expired().await;
                }
            }
        }

        // Actor endet: nichts hinterlassen
        self.teardown().await;
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Initiate { peer, reply } => {
                let result = self.start_outgoing_call(peer).await;
                let _ = reply.send(result);
            }
            Command::Accept => self.handle_accept().await,
            Command::Reject => self.handle_reject().await,
            Command::End => self.handle_end().await,
            Command::QueryState { reply } => {
                let _ = reply.send(self.state.clone());
            }
            Command::PresenterDecision {
                session_id,
                decision,
            } => {
                // Nur relevant, solange dieselbe Session noch klingelt
                if self.call.as_ref().map(|c| c.session_id) != Some(session_id) {
                    return;
                }
                match decision {
                    CallDecision::Accept => self.handle_accept().await,
                    CallDecision::Reject => self.handle_reject().await,
                }
            }
        }
    }

    async fn start_outgoing_call(&mut self, peer: PeerId) -> Result<(), CallError> {
        if !matches!(self.state, CallState::Idle) {
            return Err(CallError::AlreadyInCall);
        }

        self.channel.connect().await?;

        let session_id = Uuid::new_v4();
        let room = RoomId::between(&self.local.id, &peer);
        tracing::info!(session = %session_id, "Calling {}", peer);

        self.channel
            .send(SignalingMessage::CallInvite {
                target: peer.clone(),
                caller_id: self.local.id.clone(),
                caller_name: self.local.display_name.clone(),
            })
            .await?;

        // Medienaufnahme läuft parallel, der Invite wartet nicht darauf
        let mut call = ActiveCall::new(session_id, peer.clone(), room, CallRole::Initiator, &self.config);
        call.ring_deadline = Some(Instant::now() + self.config.ring_timeout);
        call.media_generation = self.spawn_media_acquisition();
        self.call = Some(call);

        self.set_state(CallState::Calling { peer_id: peer });
        Ok(())
    }

    async fn handle_accept(&mut self) {
        let CallState::Ringing { peer_id } = self.state.clone() else {
            return;
        };

        // Eine eventuell noch offene Anzeige ist damit erledigt
        self.presenter.dismiss();

        let generation = self.spawn_media_acquisition();
        if let Some(call) = self.call.as_mut() {
            call.ring_deadline = None;
            call.media_generation = generation;
        }

        self.join_room_and_accept().await;
        if self.call.is_some() {
            self.set_state(CallState::Calling { peer_id });
        }
    }

    async fn handle_reject(&mut self) {
        let CallState::Ringing { .. } = self.state else {
            return;
        };
        let Some(call) = self.call.as_ref() else {
            return;
        };

        self.presenter.dismiss();
        let remote = call.remote.clone();
        tracing::info!("Rejecting call from {}", remote);
        let _ = self
            .channel
            .send(SignalingMessage::CallRejected {
                target: remote.clone(),
                caller_id: remote,
            })
            .await;

        self.teardown().await;
        self.set_state(CallState::Idle);
    }

    async fn handle_end(&mut self) {
        match self.state.clone() {
            CallState::Idle => {}
            CallState::Ringing { .. } => {
                // Auflegen während des Klingelns ist eine Ablehnung
                self.handle_reject().await;
            }
            _ => {
                if let Some(call) = self.call.as_ref() {
                    let target = call.remote.clone();
                    tracing::info!("Hanging up call with {}", target);
                    let _ = self
                        .channel
                        .send(SignalingMessage::CallEnded { target })
                        .await;
                }
                self.teardown().await;
                self.set_state(CallState::Idle);
            }
        }
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => tracing::debug!("Signaling channel connected"),
            SignalingEvent::Disconnected => self.handle_channel_drop().await,
            SignalingEvent::Message(msg) => self.handle_message(msg).await,
        }
    }

    /// Kanalabriss: einmaliger Reconnect-Versuch, danach Aufgabe
    async fn handle_channel_drop(&mut self) {
        if matches!(self.state, CallState::Idle) {
            return;
        }

        if self.reconnect_used {
            self.fail_session(CallError::Channel(ChannelError::NotConnected))
                .await;
            return;
        }

        self.reconnect_used = true;
        tracing::warn!("Signaling channel dropped mid-call, attempting one reconnect");
        match self.channel.connect().await {
            Ok(()) => tracing::info!("Signaling channel re-established"),
            Err(e) => self.fail_session(CallError::Channel(e)).await,
        }
    }

    async fn handle_message(&mut self, msg: SignalingMessage) {
        // Fremd adressierte Nachrichten ignorieren (das Relay routet bereits)
        if let Some(target) = msg.target() {
            if target != &self.local.id {
                return;
            }
        }

        match msg {
            SignalingMessage::CallInvite {
                caller_id,
                caller_name,
                ..
            } => self.handle_invite(caller_id, caller_name).await,
            SignalingMessage::CallAccepted { caller_id, .. } => {
                self.handle_accepted(caller_id).await
            }
            SignalingMessage::CallRejected { .. } => self.handle_rejected().await,
            SignalingMessage::PeerJoined { user_id, room_id } => {
                self.handle_peer_joined(user_id, room_id).await
            }
            SignalingMessage::Offer { sdp, .. } => self.handle_offer(sdp).await,
            SignalingMessage::Answer { sdp, .. } => self.handle_answer(sdp).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.handle_candidate(candidate).await
            }
            SignalingMessage::CallEnded { .. } => self.handle_remote_hangup().await,
            SignalingMessage::Register { .. } | SignalingMessage::JoinRoom { .. } => {}
        }
    }

    async fn handle_invite(&mut self, caller_id: PeerId, caller_name: String) {
        match self.state.clone() {
            CallState::Idle => self.start_ringing(caller_id, caller_name).await,
            CallState::Calling { peer_id } if peer_id == caller_id => {
                self.resolve_glare(caller_id).await;
            }
            CallState::Ringing { peer_id } if peer_id == caller_id => {
                // Doppelt zugestellte Einladung, klingelt bereits
            }
            _ => {
                // Besetzt: automatisch ablehnen, eigener Zustand unverändert
                tracing::info!("Busy, auto-rejecting invite from {}", caller_id);
                let _ = self
                    .channel
                    .send(SignalingMessage::CallRejected {
                        target: caller_id.clone(),
                        caller_id,
                    })
                    .await;
            }
        }
    }

    async fn start_ringing(&mut self, caller_id: PeerId, caller_name: String) {
        let session_id = Uuid::new_v4();
        let room = RoomId::between(&self.local.id, &caller_id);
        tracing::info!(session = %session_id, "Incoming call from {}", caller_id);

        let mut call = ActiveCall::new(
            session_id,
            caller_id.clone(),
            room,
            CallRole::Responder,
            &self.config,
        );
        call.ring_deadline = Some(Instant::now() + self.config.ring_timeout);
        self.call = Some(call);
        self.set_state(CallState::Ringing {
            peer_id: caller_id.clone(),
        });

        let request = IncomingCallRequest {
            caller_id,
            caller_name,
        };
        self.emit(CallEvent::IncomingCall(request.clone()));

        // Presenter fragen; die Entscheidung kommt als Kommando zurück
        let presenter = Arc::clone(&self.presenter);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let decision = presenter.present_incoming_call(request).await;
            let _ = cmd_tx
                .send(Command::PresenterDecision {
                    session_id,
                    decision,
                })
                .await;
        });
    }

    /// Beide Seiten rufen gleichzeitig an: kleinere PeerId bleibt Initiator
    async fn resolve_glare(&mut self, caller_id: PeerId) {
        if self.local.id < caller_id {
            tracing::info!("Glare with {}: keeping initiator role", caller_id);
            return;
        }

        tracing::info!("Glare with {}: yielding to remote initiator", caller_id);
        if let Some(call) = self.call.as_mut() {
            call.role = CallRole::Responder;
            call.ring_deadline = None;
        }
        // Medien werden seit dem eigenen initiate() bereits beschafft
        self.join_room_and_accept().await;
    }

    async fn join_room_and_accept(&mut self) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let room = call.room.clone();
        let remote = call.remote.clone();

        if let Err(e) = self
            .channel
            .send(SignalingMessage::JoinRoom { room_id: room })
            .await
        {
            self.fail_session(CallError::Channel(e)).await;
            return;
        }
        if let Err(e) = self
            .channel
            .send(SignalingMessage::CallAccepted {
                target: remote.clone(),
                caller_id: remote,
            })
            .await
        {
            self.fail_session(CallError::Channel(e)).await;
        }
    }

    async fn handle_accepted(&mut self, caller_id: PeerId) {
        // `caller_id` benennt den Initiator des angenommenen Anrufs
        if caller_id != self.local.id {
            return;
        }
        if !matches!(self.state, CallState::Calling { .. }) {
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.role != CallRole::Initiator {
            return;
        }

        tracing::info!("Call accepted by {}", call.remote);
        call.ring_deadline = None;
        let room = call.room.clone();

        if let Err(e) = self
            .channel
            .send(SignalingMessage::JoinRoom { room_id: room })
            .await
        {
            self.fail_session(CallError::Channel(e)).await;
        }
    }

    async fn handle_rejected(&mut self) {
        if !matches!(self.state, CallState::Calling { .. }) {
            return;
        }
        let Some(call) = self.call.as_ref() else {
            return;
        };

        let peer_id = call.remote.clone();
        tracing::info!("Call rejected by {}", peer_id);
        // Ablehnung ist kein Fehler, sondern ein normales Ende
        self.emit(CallEvent::RejectedByPeer { peer_id });
        self.teardown().await;
        self.set_state(CallState::Idle);
    }

    async fn handle_peer_joined(&mut self, user_id: PeerId, room_id: RoomId) {
        if user_id == self.local.id {
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.room != room_id || call.remote != user_id {
            return;
        }
        if !matches!(self.state, CallState::Calling { .. }) {
            return;
        }

        call.peer_joined = true;
        self.maybe_send_offer().await;
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    /// Erstes Offer, sobald Initiator + Raum-Beitritt + Medien beisammen sind
    async fn maybe_send_offer(&mut self) {
        let ready = self
            .call
            .as_ref()
            .map(|c| {
                c.role == CallRole::Initiator && c.peer_joined && c.media.is_some() && !c.offer_sent
            })
            .unwrap_or(false);
        if !ready {
            return;
        }

        if let Err(e) = self.send_initial_offer().await {
            self.fail_session(e).await;
        }
    }

    async fn send_initial_offer(&mut self) -> Result<(), CallError> {
        self.ensure_connection().await?;

        let (sdp, target) = {
            let Some(call) = self.call.as_mut() else {
                return Ok(());
            };
            let Some(connection) = call.connection.as_ref() else {
                return Ok(());
            };
            let sdp = connection.create_offer().await?;
            call.offer_sent = true;
            (sdp, call.remote.clone())
        };

        tracing::info!("Sending offer to {}", target);
        self.channel
            .send(SignalingMessage::Offer { target, sdp })
            .await?;
        Ok(())
    }

    async fn handle_offer(&mut self, sdp: String) {
        match self.state.clone() {
            CallState::Calling { peer_id } => {
                let media_ready = self
                    .call
                    .as_ref()
                    .map(|c| c.media.is_some())
                    .unwrap_or(false);
                if !media_ready {
                    // Parken bis die Medienaufnahme abgeschlossen ist
                    if let Some(call) = self.call.as_mut() {
                        call.pending_offer = Some(sdp);
                    }
                    return;
                }

                match self.answer_offer(sdp).await {
                    Ok(()) => self.set_state(CallState::InCall { peer_id }),
                    Err(e) => self.fail_session(e).await,
                }
            }
            CallState::InCall { .. } => {
                // ICE-Restart der Gegenseite: in place beantworten
                if let Err(e) = self.answer_offer(sdp).await {
                    self.fail_session(e).await;
                }
            }
            _ => tracing::debug!("Ignoring offer in state {:?}", self.state),
        }
    }

    async fn answer_offer(&mut self, sdp: String) -> Result<(), CallError> {
        self.ensure_connection().await?;

        let (answer, target) = {
            let Some(call) = self.call.as_mut() else {
                return Ok(());
            };
            let Some(connection) = call.connection.as_ref() else {
                return Ok(());
            };

            connection.set_remote_description(SdpKind::Offer, &sdp).await?;
            call.remote_description_set = true;

            // Geparkte Kandidaten in Ankunftsreihenfolge anwenden
            while let Some(candidate) = call.pending_candidates.pop_front() {
                if let Err(e) = connection.add_remote_candidate(&candidate).await {
                    tracing::warn!("Discarding rejected ICE candidate: {}", e);
                }
            }

            let answer = connection.create_answer().await?;
            (answer, call.remote.clone())
        };

        tracing::info!("Sending answer to {}", target);
        self.channel
            .send(SignalingMessage::Answer { target, sdp: answer })
            .await?;
        Ok(())
    }

    async fn handle_answer(&mut self, sdp: String) {
        let entering_call = match self.state {
            CallState::Calling { .. } => true,
            // Antwort auf ein Restart-Offer während des Anrufs
            CallState::InCall { .. } => false,
            _ => return,
        };

        let applied = match self.apply_answer(sdp, entering_call).await {
            Ok(applied) => applied,
            Err(e) => {
                self.fail_session(e).await;
                return;
            }
        };

        if applied && entering_call {
            let peer_id = match self.call.as_ref() {
                Some(call) => call.remote.clone(),
                None => return,
            };
            // InCall beginnt mit der Answer, nicht erst mit Medienfluss
            self.set_state(CallState::InCall { peer_id });
        }
    }

    async fn apply_answer(&mut self, sdp: String, initial: bool) -> Result<bool, CallError> {
        let Some(call) = self.call.as_mut() else {
            return Ok(false);
        };
        if initial && call.role != CallRole::Initiator {
            return Ok(false);
        }
        let Some(connection) = call.connection.as_ref() else {
            return Ok(false);
        };

        connection.set_remote_description(SdpKind::Answer, &sdp).await?;
        call.remote_description_set = true;

        while let Some(candidate) = call.pending_candidates.pop_front() {
            if let Err(e) = connection.add_remote_candidate(&candidate).await {
                tracing::warn!("Discarding rejected ICE candidate: {}", e);
            }
        }

        Ok(true)
    }

    async fn handle_candidate(&mut self, candidate: String) {
        let Some(call) = self.call.as_mut() else {
            return;
        };

        if !call.remote_description_set {
            // Nicht verwerfen: bis zur Remote Description einreihen
            call.pending_candidates.push_back(candidate);
            return;
        }

        if let Some(connection) = call.connection.as_ref() {
            if let Err(e) = connection.add_remote_candidate(&candidate).await {
                tracing::warn!("Discarding rejected ICE candidate: {}", e);
            }
        }
    }

    async fn handle_remote_hangup(&mut self) {
        if matches!(self.state, CallState::Idle) {
            return;
        }

        tracing::info!("Call ended by remote peer");
        if matches!(self.state, CallState::Ringing { .. }) {
            self.presenter.dismiss();
        }
        // Kein Echo des call-ended zurück an die Gegenseite
        self.teardown().await;
        self.set_state(CallState::Idle);
    }

    /// Legt das Peer-Connection-Primitiv an, falls noch nicht vorhanden
    async fn ensure_connection(&mut self) -> Result<(), CallError> {
        let Some(call) = self.call.as_mut() else {
            return Ok(());
        };
        if call.connection.is_some() {
            return Ok(());
        }
        let Some(media) = call.media.as_ref() else {
            return Err(CallError::Media(MediaError::AccessDenied(
                "local media not ready".to_string(),
            )));
        };

        let connection = self.connector.create(media, self.peer_tx.clone()).await?;
        call.connection = Some(connection);
        Ok(())
    }

    // ========================================================================
    // MEDIA
    // ========================================================================

    fn spawn_media_acquisition(&mut self) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let source = Arc::clone(&self.media_source);
        let constraints = self.config.media_constraints;
        let tx = self.media_tx.clone();

        tokio::spawn(async move {
            let result = source.acquire(constraints).await;
            let _ = tx.send(MediaReady { generation, result }).await;
        });

        generation
    }

    async fn handle_media_ready(&mut self, ready: MediaReady) {
        let current = self.call.as_ref().map(|c| c.media_generation);
        if current != Some(ready.generation) {
            // Session wurde inzwischen beendet: Handle sofort freigeben
            if let Ok(mut media) = ready.result {
                media.release();
            }
            return;
        }

        match ready.result {
            Ok(media) => {
                if let Some(call) = self.call.as_mut() {
                    call.media = Some(media);
                }

                // Responder: geparktes Offer jetzt beantworten
                let pending = self.call.as_mut().and_then(|c| c.pending_offer.take());
                if let Some(sdp) = pending {
                    self.handle_offer(sdp).await;
                    return;
                }

                self.maybe_send_offer().await;
            }
            Err(e) => {
                let retry_used = self
                    .call
                    .as_ref()
                    .map(|c| c.media_retry_used)
                    .unwrap_or(true);
                if retry_used {
                    self.fail_session(CallError::Media(e)).await;
                    return;
                }

                // Genau ein erneuter Versuch
                tracing::warn!("Media acquisition failed ({}), retrying once", e);
                let generation = self.spawn_media_acquisition();
                if let Some(call) = self.call.as_mut() {
                    call.media_retry_used = true;
                    call.media_generation = generation;
                }
            }
        }
    }

    // ========================================================================
    // CONNECTIVITY & RECOVERY
    // ========================================================================

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::CandidateDiscovered(candidate) => {
                let Some(call) = self.call.as_ref() else {
                    return;
                };
                let target = call.remote.clone();
                if let Err(e) = self
                    .channel
                    .send(SignalingMessage::IceCandidate { target, candidate })
                    .await
                {
                    // Ein verlorener Kandidat bricht den Anruf nicht ab
                    tracing::warn!("Failed to send ICE candidate: {}", e);
                }
            }
            PeerEvent::ConnectivityChanged(connectivity) => {
                self.handle_connectivity(connectivity).await;
            }
            PeerEvent::TrackReceived { mime_type } => {
                tracing::debug!("Remote track active: {}", mime_type);
            }
        }
    }

    async fn handle_connectivity(&mut self, connectivity: Connectivity) {
        let now = Instant::now();
        let action = {
            let Some(call) = self.call.as_mut() else {
                return;
            };
            call.monitor.observe(connectivity, now)
        };

        match action {
            MonitorAction::None => {}
            MonitorAction::ArmGrace => {
                if let Some(call) = self.call.as_mut() {
                    if call.grace_deadline.is_none() {
                        tracing::warn!("Connection degraded, grace timer armed");
                        call.grace_deadline = Some(now + self.config.disconnect_grace);
                    }
                }
            }
            MonitorAction::CancelGrace => {
                if let Some(call) = self.call.as_mut() {
                    call.grace_deadline = None;
                }
            }
            MonitorAction::Restart => {
                if let Some(call) = self.call.as_mut() {
                    call.grace_deadline = None;
                }
                self.restart_negotiation().await;
            }
            MonitorAction::Fatal => {
                tracing::error!("Connectivity failed twice within the failure window");
                self.fail_session(CallError::Negotiation(NegotiationError::WebRtc(
                    "connectivity failed repeatedly".to_string(),
                )))
                .await;
            }
        }
    }

    async fn handle_grace_expired(&mut self) {
        let action = {
            let Some(call) = self.call.as_mut() else {
                return;
            };
            call.grace_deadline = None;
            call.monitor.grace_expired()
        };

        if action == MonitorAction::Restart {
            tracing::info!("Grace period elapsed without recovery");
            self.restart_negotiation().await;
        }
    }

    async fn restart_negotiation(&mut self) {
        let (target, restart) = {
            let Some(call) = self.call.as_ref() else {
                return;
            };
            let Some(connection) = call.connection.as_ref() else {
                return;
            };
            (call.remote.clone(), connection.restart_negotiation().await)
        };

        match restart {
            Ok(sdp) => {
                tracing::info!("Sending ICE restart offer to {}", target);
                if let Err(e) = self
                    .channel
                    .send(SignalingMessage::Offer { target, sdp })
                    .await
                {
                    self.fail_session(CallError::Channel(e)).await;
                }
            }
            Err(e) => self.fail_session(CallError::Negotiation(e)).await,
        }
    }

    // ========================================================================
    // TIMEOUTS & TEARDOWN
    // ========================================================================

    async fn handle_ring_timeout(&mut self) {
        match self.state.clone() {
            CallState::Ringing { peer_id } => {
                // Ablauf verhält sich wie eine Ablehnung
                tracing::info!("Ring timed out for call from {}", peer_id);
                self.presenter.dismiss();
                let _ = self
                    .channel
                    .send(SignalingMessage::CallRejected {
                        target: peer_id.clone(),
                        caller_id: peer_id,
                    })
                    .await;
                self.teardown().await;
                self.set_state(CallState::Idle);
            }
            CallState::Calling { peer_id } => {
                tracing::info!("No answer from {}, giving up", peer_id);
                self.emit(CallEvent::Error(CallError::Timeout));
                self.teardown().await;
                self.set_state(CallState::Idle);
            }
            _ => {}
        }
    }

    async fn fail_session(&mut self, error: CallError) {
        tracing::error!("Call failed: {}", error);
        self.emit(CallEvent::Error(error));

        if matches!(self.state, CallState::Ringing { .. }) {
            self.presenter.dismiss();
        }

        // Gegenseite informieren, bevor die Ressourcen fallen
        if let Some(call) = self.call.as_ref() {
            let target = call.remote.clone();
            let _ = self
                .channel
                .send(SignalingMessage::CallEnded { target })
                .await;
        }

        self.set_state(CallState::Failed);
        self.teardown().await;
        self.set_state(CallState::Idle);
    }

    /// Gibt alle Ressourcen der Session frei
    async fn teardown(&mut self) {
        if let Some(mut call) = self.call.take() {
            if let Some(mut media) = call.media.take() {
                media.release();
            }
            if let Some(connection) = call.connection.take() {
                connection.close().await;
            }
            tracing::debug!(session = %call.session_id, "Session resources released");
        }
        self.reconnect_used = false;
    }

    fn set_state(&mut self, new_state: CallState) {
        self.state = new_state.clone();
        tracing::info!("Call state: {:?}", new_state);
        let _ = self.event_tx.send(CallEvent::StateChanged(new_state));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}
