//! Directory Provider - Verzeichnis anrufbarer Peers
//!
//! Das Verzeichnis ist ein externer Kollaborateur (REST-Backend o.ä.);
//! dieses Modul definiert nur die Grenze: eine Lese-Operation plus der
//! Filter, der die eigene Identität aussortiert.

use crate::call::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// PEER RECORDS
// ============================================================================

/// Ein Eintrag aus dem Verzeichnis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    pub name: String,
    pub email: String,
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Lese-Grenze zum externen Verzeichnis
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    /// Liefert alle bekannten Peers (inklusive der eigenen Identität)
    async fn list_peers(&self) -> Result<Vec<PeerRecord>, DirectoryError>;
}

/// Liefert die anrufbaren Peers: alle außer der eigenen Identität
pub async fn callable_peers(
    provider: &dyn DirectoryProvider,
    local_id: &PeerId,
) -> Result<Vec<PeerRecord>, DirectoryError> {
    let peers = provider.list_peers().await?;
    Ok(peers.into_iter().filter(|p| &p.id != local_id).collect())
}

// ============================================================================
// STATIC DIRECTORY
// ============================================================================

/// Festes In-Memory-Verzeichnis (für Tests und Demos)
pub struct StaticDirectory {
    peers: Vec<PeerRecord>,
}

impl StaticDirectory {
    pub fn new(peers: Vec<PeerRecord>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl DirectoryProvider for StaticDirectory {
    async fn list_peers(&self) -> Result<Vec<PeerRecord>, DirectoryError> {
        Ok(self.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str) -> PeerRecord {
        PeerRecord {
            id: PeerId::from(id),
            name: name.to_string(),
            email: format!("{id}@example.com"),
        }
    }

    #[tokio::test]
    async fn test_callable_peers_excludes_self() {
        let directory = StaticDirectory::new(vec![
            record("alice", "Alice"),
            record("bob", "Bob"),
            record("carol", "Carol"),
        ]);

        let peers = callable_peers(&directory, &PeerId::from("bob"))
            .await
            .unwrap();

        let ids: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "carol"]);
    }
}
