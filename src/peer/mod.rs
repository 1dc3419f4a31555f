//! Peer Module - Medien und Peer Connections
//!
//! Dieses Modul verwaltet:
//! - Lokale Medienaufnahme (Mikrofon, Playback)
//! - Das WebRTC Peer-Connection-Primitiv
//! - Offer/Answer-Verhandlung und ICE-Kandidaten

mod connection;
mod media;

pub use connection::{
    Connectivity, NegotiationError, PeerConnection, PeerConnector, PeerEvent, SdpKind,
    WebRtcConnector,
};
pub use media::{
    AudioCapture, DeviceMediaSource, LocalMedia, MediaConstraints, MediaError, MediaSource,
    CHANNELS, FRAME_SIZE, SAMPLE_RATE,
};
