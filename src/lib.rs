//! peerline - P2P Call Orchestrator
//!
//! Verhandelt einen direkten Audio/Video-Kanal zwischen zwei Clients
//! über ein zentrales, schmalbandiges Signaling-Relay und verwaltet den
//! Anrufer/Angerufenen-Lebenszyklus:
//! - Klingeln, Annahme, Ablehnung, Besetzt
//! - Glare-Auflösung (beide rufen gleichzeitig an)
//! - Offer/Answer- und ICE-Verhandlung über WebRTC
//! - Teardown und Verbindungs-Recovery
//!
//! Das Relay, das Benutzerverzeichnis und die Oberfläche sind externe
//! Kollaborateure hinter schmalen Grenzen (`SignalingConnection`,
//! `DirectoryProvider`, `IncomingCallPresenter`).

pub mod call;
pub mod config;
pub mod directory;
pub mod mock;
pub mod peer;
pub mod presenter;
pub mod signaling;

pub use call::{
    CallError, CallEvent, CallHandle, CallParticipant, CallRole, CallState, CallStateMachine,
    PeerId, RoomId,
};
pub use config::CallConfig;
pub use directory::{callable_peers, DirectoryProvider, PeerRecord};
pub use peer::{
    DeviceMediaSource, LocalMedia, MediaConstraints, MediaError, PeerConnector, WebRtcConnector,
};
pub use presenter::{CallDecision, ChannelPresenter, IncomingCallPresenter, IncomingCallRequest};
pub use signaling::{ChannelError, SignalingChannel, SignalingConnection, SignalingMessage};

/// Initialisiert das Logging (einmalig, weitere Aufrufe sind no-ops)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("peerline=debug".parse().expect("static directive"))
                .add_directive("webrtc=warn".parse().expect("static directive")),
        )
        .try_init();
}
