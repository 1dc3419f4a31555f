//! Reconnection Monitor
//!
//! Beobachtet den aggregierten Verbindungszustand der Peer Connection
//! und entscheidet über Recovery. Die Entscheidungslogik ist rein
//! (Zustand × Zeitstempel → Aktion); die eigentlichen Timer besitzt die
//! Session.

use crate::peer::Connectivity;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// MONITOR ACTIONS
// ============================================================================

/// Was die Session auf ein Connectivity-Ereignis hin tun soll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Nichts zu tun
    None,

    /// Karenz-Timer starten (falls nicht schon aktiv)
    ArmGrace,

    /// Karenz-Timer stoppen, Verbindung ist gesund
    CancelGrace,

    /// Einmalig `restart_negotiation()` anstoßen
    Restart,

    /// Zweites `failed` im Fenster: Session aufgeben
    Fatal,
}

// ============================================================================
// RECONNECTION MONITOR
// ============================================================================

/// Entscheidungstabelle für Verbindungs-Recovery
///
/// - `connected` ist rein beobachtend und räumt die Fehler-Historie auf
/// - `disconnected` startet die Karenzzeit; läuft sie ab, wird einmal
///   neu verhandelt
/// - `failed` verhandelt sofort neu; ein zweites `failed` innerhalb des
///   Fensters ist fatal
#[derive(Debug)]
pub struct ReconnectionMonitor {
    failure_window: Duration,
    last_failed_at: Option<Instant>,
}

impl ReconnectionMonitor {
    pub fn new(failure_window: Duration) -> Self {
        Self {
            failure_window,
            last_failed_at: None,
        }
    }

    /// Verarbeitet ein Connectivity-Ereignis
    pub fn observe(&mut self, connectivity: Connectivity, now: Instant) -> MonitorAction {
        match connectivity {
            Connectivity::Connected => {
                self.last_failed_at = None;
                MonitorAction::CancelGrace
            }
            Connectivity::Disconnected => MonitorAction::ArmGrace,
            Connectivity::Failed => match self.last_failed_at {
                Some(previous) if now.duration_since(previous) <= self.failure_window => {
                    MonitorAction::Fatal
                }
                _ => {
                    self.last_failed_at = Some(now);
                    MonitorAction::Restart
                }
            },
        }
    }

    /// Die Karenzzeit nach `disconnected` ist abgelaufen
    pub fn grace_expired(&mut self) -> MonitorAction {
        MonitorAction::Restart
    }
}
