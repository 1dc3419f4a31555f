//! Peer- und Raum-Identitäten
//!
//! Eine `PeerId` ist ein opakes, stabiles Konto-Kennzeichen aus dem
//! Directory. Die `RoomId` wird deterministisch aus zwei PeerIds
//! abgeleitet, damit beide Seiten ohne Abstimmung denselben Raum
//! berechnen.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trennzeichen zwischen den beiden sortierten PeerIds
const ROOM_SEPARATOR: char = '#';

// ============================================================================
// PEER ID
// ============================================================================

/// Opakes, stabiles Kennzeichen eines Benutzers
///
/// Die Ordnung (`Ord`) wird für den Glare-Tie-Break und die
/// RoomId-Ableitung verwendet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// ROOM ID
// ============================================================================

/// Abgeleitete Raum-Kennung für genau zwei Peers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Leitet die RoomId aus zwei PeerIds ab
    ///
    /// Kommutativ: `between(a, b) == between(b, a)`. Die lexikographisch
    /// kleinere Id steht immer vorn.
    pub fn between(a: &PeerId, b: &PeerId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{}{}{}",
            first.as_str(),
            ROOM_SEPARATOR,
            second.as_str()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
