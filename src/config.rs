//! Konfiguration des Orchestrators
//!
//! Alle Zeitfenster und Endpunkte an einer Stelle; `from_env()` liest
//! die Umgebung und fällt auf Defaults zurück.

use crate::peer::MediaConstraints;
use std::time::Duration;

/// Default-Relay (überschreibbar über `SIGNALING_URL`)
const DEFAULT_RELAY_URL: &str = "https://signaling.peerline.dev";

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Laufzeit-Konfiguration für Kanal, Anrufe und Recovery
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Basis-URL des Signaling-Relays (http/https/ws/wss)
    pub relay_url: String,

    /// Bearer-Credential für den Relay-Handshake
    pub bearer_token: String,

    /// STUN-Server für die NAT-Traversierung
    pub stun_servers: Vec<String>,

    /// Media-Constraints für die lokale Aufnahme
    pub media_constraints: MediaConstraints,

    /// Klingeldauer, danach gilt der Anruf als abgelehnt bzw. unbeantwortet
    pub ring_timeout: Duration,

    /// Karenzzeit nach `disconnected`, bevor neu verhandelt wird
    pub disconnect_grace: Duration,

    /// Fenster, in dem ein zweites `failed` als fatal gilt
    pub failure_window: Duration,

    /// Intervall der Keepalive-Pings auf dem Kanal
    pub keepalive_interval: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            bearer_token: String::new(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            media_constraints: MediaConstraints::default(),
            ring_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(10),
            failure_window: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(25),
        }
    }
}

impl CallConfig {
    /// Liest die Konfiguration aus der Umgebung
    ///
    /// `SIGNALING_URL` und `SIGNALING_TOKEN` überschreiben die Defaults;
    /// `RING_TIMEOUT_SECS` die Klingeldauer.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SIGNALING_URL") {
            config.relay_url = url;
        }
        if let Ok(token) = std::env::var("SIGNALING_TOKEN") {
            config.bearer_token = token;
        }
        if let Some(secs) = std::env::var("RING_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.ring_timeout = Duration::from_secs(secs);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();

        assert_eq!(config.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.disconnect_grace, Duration::from_secs(10));
        assert_eq!(config.failure_window, Duration::from_secs(15));
        assert!(!config.stun_servers.is_empty());
    }
}
