//! WebRTC Peer Connection Manager
//!
//! Kapselt das Peer-Connection-Primitiv: Offer/Answer-Verhandlung,
//! Kandidaten-Callbacks und Verbindungszustand. Kandidaten, die vor der
//! Local Description entstehen, puffert das Primitiv selbst; dieser
//! Manager puffert nichts.

use super::media::{LocalMedia, SAMPLE_RATE};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use std::sync::Arc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    #[error("webrtc error: {0}")]
    WebRtc(String),

    #[error("invalid sdp: {0}")]
    InvalidSdp(String),

    #[error("invalid ice candidate: {0}")]
    InvalidCandidate(String),
}

// ============================================================================
// CONNECTION EVENTS
// ============================================================================

/// Aggregierter Verbindungszustand für den Reconnection Monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected,
    Failed,
}

/// Events aus den Callbacks des Peer-Connection-Primitivs
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokal entdeckter ICE Candidate (JSON-serialisiert)
    CandidateDiscovered(String),

    /// Verbindungszustand hat sich geändert
    ConnectivityChanged(Connectivity),

    /// Remote-Spur eingetroffen
    TrackReceived { mime_type: String },
}

/// Art einer Remote Description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

// ============================================================================
// CONNECTOR TRAIT
// ============================================================================

/// Erzeugt Peer Connections
///
/// Produktiv implementiert durch [`WebRtcConnector`]; Tests verwenden
/// den Mock-Connector aus [`crate::mock`].
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Alloziert das Primitiv, hängt lokale Spuren an und registriert
    /// die Callbacks auf den Event-Sender
    async fn create(
        &self,
        media: &LocalMedia,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError>;
}

/// Eine verhandelbare Peer Connection
///
/// `create_offer`/`create_answer` setzen die Local Description selbst,
/// bevor sie zurückkehren; erst danach fließen Kandidaten.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    async fn create_answer(&self) -> Result<String, NegotiationError>;

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError>;

    /// Neue ICE-Verhandlung ohne Abbau der Session; liefert das
    /// Restart-Offer
    async fn restart_negotiation(&self) -> Result<String, NegotiationError>;

    /// Schließt die Verbindung; beliebig oft aufrufbar
    async fn close(&self);
}

// ============================================================================
// WEBRTC CONNECTOR
// ============================================================================

/// Connector auf Basis des webrtc-Stacks
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    /// Erstellt einen Connector mit den angegebenen STUN-Servern
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers,
                ..Default::default()
            }],
        }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(
        &self,
        media: &LocalMedia,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        // Media Engine mit Standard-Codecs konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| NegotiationError::WebRtc(e.to_string()))?,
        );

        let constraints = media.constraints();

        // Audio Track anhängen
        if constraints.audio {
            let audio_track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: SAMPLE_RATE,
                    channels: 1,
                    ..Default::default()
                },
                "audio".to_string(),
                "peerline".to_string(),
            ));

            pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;
        }

        // Ohne Kamera-Backend nur die Empfangsrichtung verhandeln
        if constraints.video {
            pc.add_transceiver_from_kind(RTPCodecType::Video, None)
                .await
                .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;
        }

        setup_callbacks(&pc, events);

        Ok(Box::new(WebRtcConnection { pc }))
    }
}

/// Registriert die Callbacks des Primitivs auf den Event-Sender
fn setup_callbacks(pc: &Arc<RTCPeerConnection>, events: mpsc::Sender<PeerEvent>) {
    // Connection State Handler
    let events_clone = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", state);

        let connectivity = match state {
            RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
            RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
            RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
            _ => None,
        };

        let events = events_clone.clone();
        Box::pin(async move {
            if let Some(connectivity) = connectivity {
                let _ = events.send(PeerEvent::ConnectivityChanged(connectivity)).await;
            }
        })
    }));

    // ICE Candidate Handler
    let events_clone = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let events = events_clone.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        let _ = events
                            .send(PeerEvent::CandidateDiscovered(candidate_str))
                            .await;
                    }
                }
            }
        })
    }));

    // Track Handler (für eingehende Medien)
    pc.on_track(Box::new(move |track, _, _| {
        let events = events.clone();
        Box::pin(async move {
            let mime_type = track.codec().capability.mime_type.clone();
            tracing::info!("Received remote track: {}", mime_type);
            let _ = events.send(PeerEvent::TrackReceived { mime_type }).await;
        })
    }));
}

// ============================================================================
// WEBRTC CONNECTION
// ============================================================================

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), NegotiationError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))?;

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn restart_negotiation(&self) -> Result<String, NegotiationError> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
    }
}
