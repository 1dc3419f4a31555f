//! Incoming-Call Presenter - Klingel-Oberfläche
//!
//! Dünne Grenze zur Präsentationsschicht: die Session reicht einen
//! eingehenden Anrufwunsch hinein und bekommt eine Entscheidung zurück.
//! Desktop-Notifications o.ä. sind Sache der aufsetzenden Schicht und
//! für die Korrektheit der State Machine irrelevant.

use crate::call::PeerId;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};

// ============================================================================
// REQUEST & DECISION
// ============================================================================

/// Eingehender Anrufwunsch, solange die Session klingelt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallRequest {
    pub caller_id: PeerId,
    pub caller_name: String,
}

/// Entscheidung des Benutzers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    Accept,
    Reject,
}

// ============================================================================
// PRESENTER TRAIT
// ============================================================================

/// Grenze zur Klingel-Oberfläche
#[async_trait]
pub trait IncomingCallPresenter: Send + Sync {
    /// Zeigt den Anrufwunsch an und wartet auf die Entscheidung
    async fn present_incoming_call(&self, request: IncomingCallRequest) -> CallDecision;

    /// Zieht eine noch offene Anzeige zurück (Timeout, Remote-Hangup)
    fn dismiss(&self);
}

// ============================================================================
// CHANNEL PRESENTER
// ============================================================================

/// Klingel-Anfrage an eine UI-Schicht, mit Rückkanal für die Entscheidung
#[derive(Debug)]
pub struct IncomingPrompt {
    pub request: IncomingCallRequest,
    /// Entscheidung hierüber zurückgeben; ist der Empfänger weg, wurde
    /// die Anzeige zurückgezogen
    pub decision: oneshot::Sender<CallDecision>,
}

/// Presenter, der Anfragen über einen mpsc-Kanal an die UI reicht
///
/// `dismiss()` bricht eine offene Anfrage ab; sie gilt dann als
/// abgelehnt.
pub struct ChannelPresenter {
    prompt_tx: mpsc::Sender<IncomingPrompt>,
    dismissed: Arc<Notify>,
}

impl ChannelPresenter {
    /// Erstellt Presenter plus Empfänger-Seite für die UI
    pub fn new() -> (Self, mpsc::Receiver<IncomingPrompt>) {
        let (prompt_tx, prompt_rx) = mpsc::channel(8);
        (
            Self {
                prompt_tx,
                dismissed: Arc::new(Notify::new()),
            },
            prompt_rx,
        )
    }
}

#[async_trait]
impl IncomingCallPresenter for ChannelPresenter {
    async fn present_incoming_call(&self, request: IncomingCallRequest) -> CallDecision {
        let (decision_tx, decision_rx) = oneshot::channel();

        if self
            .prompt_tx
            .send(IncomingPrompt {
                request,
                decision: decision_tx,
            })
            .await
            .is_err()
        {
            tracing::warn!("No UI attached, rejecting incoming call");
            return CallDecision::Reject;
        }

        tokio::select! {
            decision = decision_rx => decision.unwrap_or(CallDecision::Reject),
            _ = self.dismissed.notified() => CallDecision::Reject,
        }
    }

    fn dismiss(&self) {
        self.dismissed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> IncomingCallRequest {
        IncomingCallRequest {
            caller_id: PeerId::from("alice"),
            caller_name: "Alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_decision_is_forwarded() {
        let (presenter, mut prompt_rx) = ChannelPresenter::new();

        let ui = tokio::spawn(async move {
            let prompt = prompt_rx.recv().await.unwrap();
            assert_eq!(prompt.request.caller_id.as_str(), "alice");
            let _ = prompt.decision.send(CallDecision::Accept);
        });

        let decision = presenter.present_incoming_call(request()).await;
        assert_eq!(decision, CallDecision::Accept);
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_dismiss_rejects_pending_prompt() {
        let (presenter, mut prompt_rx) = ChannelPresenter::new();
        let presenter = Arc::new(presenter);

        let dismisser = Arc::clone(&presenter);
        let ui = tokio::spawn(async move {
            // Anzeige entgegennehmen, aber nie entscheiden
            let _prompt = prompt_rx.recv().await.unwrap();
            dismisser.dismiss();
            _prompt
        });

        let decision = presenter.present_incoming_call(request()).await;
        assert_eq!(decision, CallDecision::Reject);
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_without_ui_prompt_is_rejected() {
        let (presenter, prompt_rx) = ChannelPresenter::new();
        drop(prompt_rx);

        let decision = presenter.present_incoming_call(request()).await;
        assert_eq!(decision, CallDecision::Reject);
    }
}
