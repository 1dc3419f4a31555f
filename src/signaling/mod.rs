//! Signaling Module - Kanal zum Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - WebSocket-Verbindung aufbauen und halten
//! - Nachrichten des Protokollvokabulars senden und parsen
//! - Eingehende Events in Ankunftsreihenfolge verteilen
//!

mod channel;
mod messages;

pub use channel::{ChannelError, SignalingChannel, SignalingConnection, SignalingEvent};
pub use messages::{Envelope, SignalingMessage};
