//! Call Module - Lebenszyklus eines Anrufs
//!
//! Dieses Modul verwaltet:
//! - Peer- und Raum-Identitäten
//! - Die Call State Machine (Idle, Calling, Ringing, InCall, Failed)
//! - Den Reconnection Monitor für die Verbindungs-Recovery

mod monitor;
mod room;
mod session;

pub use monitor::{MonitorAction, ReconnectionMonitor};
pub use room::{PeerId, RoomId};
pub use session::{
    CallError, CallEvent, CallHandle, CallParticipant, CallRole, CallState, CallStateMachine,
};
