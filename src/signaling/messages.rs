//! Message Types für das Signaling-Protokoll
//!
//! Das Vokabular ist symmetrisch: bis auf `register`, `join-room`
//! (Client → Relay) und `peer-joined` (Relay → Client) leitet das Relay
//! jede Nachricht unverändert an die `target`-Identität weiter.

use crate::call::{PeerId, RoomId};
use serde::{Deserialize, Serialize};

// ============================================================================
// WIRE MESSAGES
// ============================================================================

/// Alle Signaling-Nachrichten auf dem Draht
///
/// Jede Variante trägt mindestens `type` (serde-Tag) und, wo das Relay
/// routen muss, eine `target`-Identität.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// Anmeldung beim Relay, direkt nach dem Verbindungsaufbau
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "userId")]
        user_id: PeerId,
    },

    /// Raum betreten; das Relay broadcastet daraufhin `peer-joined`
    #[serde(rename = "join-room")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },

    /// Eingehender Anrufwunsch
    #[serde(rename = "call-user")]
    CallInvite {
        target: PeerId,
        #[serde(rename = "callerId")]
        caller_id: PeerId,
        #[serde(rename = "callerName")]
        caller_name: String,
    },

    /// Der Angerufene hat angenommen; `caller_id` benennt den Initiator
    #[serde(rename = "call-answered")]
    CallAccepted {
        target: PeerId,
        #[serde(rename = "callerId")]
        caller_id: PeerId,
    },

    /// Der Angerufene hat abgelehnt (oder ist besetzt)
    #[serde(rename = "call-rejected")]
    CallRejected {
        target: PeerId,
        #[serde(rename = "callerId")]
        caller_id: PeerId,
    },

    /// SDP Offer
    #[serde(rename = "offer")]
    Offer { target: PeerId, sdp: String },

    /// SDP Answer
    #[serde(rename = "answer")]
    Answer { target: PeerId, sdp: String },

    /// ICE Candidate (JSON-serialisiert, Format des WebRTC-Stacks)
    #[serde(rename = "ice-candidate")]
    IceCandidate { target: PeerId, candidate: String },

    /// Anruf beendet
    #[serde(rename = "call-ended")]
    CallEnded { target: PeerId },

    /// Raum-Broadcast des Relays: ein Peer ist dem Raum beigetreten
    #[serde(rename = "peer-joined")]
    PeerJoined {
        #[serde(rename = "userId")]
        user_id: PeerId,
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
}

impl SignalingMessage {
    /// Routing-Ziel der Nachricht, falls vorhanden
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Self::CallInvite { target, .. }
            | Self::CallAccepted { target, .. }
            | Self::CallRejected { target, .. }
            | Self::Offer { target, .. }
            | Self::Answer { target, .. }
            | Self::IceCandidate { target, .. }
            | Self::CallEnded { target } => Some(target),
            Self::Register { .. } | Self::JoinRoom { .. } | Self::PeerJoined { .. } => None,
        }
    }

    /// Wire-Tag der Nachricht (für Logging)
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::JoinRoom { .. } => "join-room",
            Self::CallInvite { .. } => "call-user",
            Self::CallAccepted { .. } => "call-answered",
            Self::CallRejected { .. } => "call-rejected",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnded { .. } => "call-ended",
            Self::PeerJoined { .. } => "peer-joined",
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Versand-Hülle: Nachricht plus Millisekunden-Zeitstempel
///
/// Beim Parsen eingehender Nachrichten werden unbekannte Hüllenfelder
/// ignoriert, `SignalingMessage` kann also direkt deserialisiert werden.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: SignalingMessage,
    pub timestamp: i64,
}

impl Envelope {
    /// Verpackt eine Nachricht mit dem aktuellen Zeitstempel
    pub fn wrap(message: SignalingMessage) -> Self {
        Self {
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tags_match_protocol_table() {
        let msg = SignalingMessage::CallInvite {
            target: PeerId::from("bob"),
            caller_id: PeerId::from("alice"),
            caller_name: "Alice".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "call-user");
        assert_eq!(json["target"], "bob");
        assert_eq!(json["callerId"], "alice");
        assert_eq!(json["callerName"], "Alice");
    }

    #[test]
    fn test_offer_roundtrip() {
        let msg = SignalingMessage::Offer {
            target: PeerId::from("bob"),
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_peer_joined_parses_relay_broadcast() {
        let json = r#"{"type":"peer-joined","userId":"bob","roomId":"alice#bob"}"#;
        let parsed: SignalingMessage = serde_json::from_str(json).unwrap();

        match parsed {
            SignalingMessage::PeerJoined { user_id, room_id } => {
                assert_eq!(user_id.as_str(), "bob");
                assert_eq!(room_id.as_str(), "alice#bob");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_envelope_timestamp_is_ignored_on_parse() {
        let envelope = Envelope::wrap(SignalingMessage::CallEnded {
            target: PeerId::from("bob"),
        });
        let json = serde_json::to_string(&envelope).unwrap();

        // Eingehende Nachrichten werden ohne Hülle geparst
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope.message);
    }

    #[test]
    fn test_target_accessor() {
        let with_target = SignalingMessage::CallEnded {
            target: PeerId::from("bob"),
        };
        let without_target = SignalingMessage::Register {
            user_id: PeerId::from("alice"),
        };

        assert_eq!(with_target.target().map(PeerId::as_str), Some("bob"));
        assert!(without_target.target().is_none());
    }
}
