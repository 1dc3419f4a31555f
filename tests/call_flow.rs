//! End-to-End-Szenarien der Call State Machine
//!
//! Zwei (oder drei) State Machines laufen gegen das In-Memory-Relay;
//! Medien und Peer Connections sind gemockt. Die Tests laufen auf der
//! pausierten Tokio-Uhr, Ring- und Karenz-Timer vergehen also sofort.

use peerline::call::{
    CallError, CallEvent, CallHandle, CallParticipant, CallState, CallStateMachine, PeerId,
};
use peerline::config::CallConfig;
use peerline::mock::{
    MockConnector, MockMediaSource, MockRelay, MockSignaling, ScriptedPresenter,
};
use peerline::peer::{Connectivity, SdpKind};
use peerline::signaling::{SignalingConnection, SignalingMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Obergrenze pro Wartevorgang; liegt bewusst über allen Call-Timern
const WAIT_LIMIT: Duration = Duration::from_secs(120);

struct TestPeer {
    handle: CallHandle,
    channel: Arc<MockSignaling>,
    media: Arc<MockMediaSource>,
    connector: Arc<MockConnector>,
    presenter: Arc<ScriptedPresenter>,
}

fn spawn_peer(relay: &Arc<MockRelay>, id: &str, presenter: Arc<ScriptedPresenter>) -> TestPeer {
    spawn_peer_with_config(relay, id, presenter, CallConfig::default())
}

fn spawn_peer_with_config(
    relay: &Arc<MockRelay>,
    id: &str,
    presenter: Arc<ScriptedPresenter>,
    config: CallConfig,
) -> TestPeer {
    let channel = relay.client(PeerId::from(id));
    let media = MockMediaSource::new();
    let connector = MockConnector::new(id);

    let handle = CallStateMachine::spawn(
        CallParticipant {
            id: PeerId::from(id),
            display_name: id.to_uppercase(),
        },
        config,
        channel.clone(),
        media.clone(),
        connector.clone(),
        presenter.clone(),
    );

    TestPeer {
        handle,
        channel,
        media,
        connector,
        presenter,
    }
}

async fn wait_for_state(events: &mut broadcast::Receiver<CallEvent>, want: CallState) {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged(state)) if state == want => break,
                Ok(_) => {}
                Err(e) => panic!("event stream ended while waiting for {want:?}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {want:?}"));
}

async fn wait_for_error(events: &mut broadcast::Receiver<CallEvent>) -> CallError {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match events.recv().await {
                Ok(CallEvent::Error(error)) => break error,
                Ok(_) => {}
                Err(e) => panic!("event stream ended while waiting for error: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for error event")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

fn peer(id: &str) -> PeerId {
    PeerId::from(id)
}

/// Baut einen Anruf alice → bob bis beide InCall sind
async fn establish_call(alice: &TestPeer, bob: &TestPeer) -> anyhow::Result<()> {
    let mut a_events = alice.handle.subscribe();
    let mut b_events = bob.handle.subscribe();

    bob.channel.connect().await?;
    alice.handle.initiate(peer("bob")).await?;

    wait_for_state(&mut a_events, CallState::InCall { peer_id: peer("bob") }).await;
    wait_for_state(&mut b_events, CallState::InCall { peer_id: peer("alice") }).await;
    Ok(())
}

// ============================================================================
// HAPPY PATH
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_call_accept_reaches_in_call_on_both_sides() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());

    let mut a_events = alice.handle.subscribe();
    let mut b_events = bob.handle.subscribe();

    bob.channel.connect().await?;
    alice.handle.initiate(peer("bob")).await?;

    wait_for_state(&mut a_events, CallState::Calling { peer_id: peer("bob") }).await;
    wait_for_state(&mut b_events, CallState::Ringing { peer_id: peer("alice") }).await;

    wait_for_state(&mut a_events, CallState::InCall { peer_id: peer("bob") }).await;
    wait_for_state(&mut b_events, CallState::InCall { peer_id: peer("alice") }).await;

    // Genau ein Offer für die Session, vom Initiator
    assert_eq!(relay.offer_count(), 1);
    let answers = relay
        .sent_messages()
        .iter()
        .filter(|m| matches!(m, SignalingMessage::Answer { .. }))
        .count();
    assert_eq!(answers, 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_incoming_call_surfaces_caller_identity() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());

    let mut b_events = bob.handle.subscribe();
    bob.channel.connect().await?;
    alice.handle.initiate(peer("bob")).await?;

    let request = tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Ok(CallEvent::IncomingCall(request)) = b_events.recv().await {
                break request;
            }
        }
    })
    .await?;

    assert_eq!(request.caller_id, peer("alice"));
    assert_eq!(request.caller_name, "ALICE");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_candidates_flow_after_call_is_established() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(
        &relay,
        "bob",
        ScriptedPresenter::accepting_after(Duration::from_secs(3)),
    );
    establish_call(&alice, &bob).await?;

    let a_conn = alice.connector.wait_for_connection().await;
    let b_conn = bob.connector.wait_for_connection().await;

    // Nach der Answer werden Kandidaten direkt angewendet
    a_conn.emit_candidate("cand-from-alice").await;
    wait_until(|| b_conn.applied_candidates() == vec!["cand-from-alice".to_string()]).await;

    Ok(())
}

// ============================================================================
// GLARE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_simultaneous_calls_resolve_to_one_initiator() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::rejecting());

    let mut a_events = alice.handle.subscribe();
    let mut b_events = bob.handle.subscribe();

    alice.channel.connect().await?;
    bob.channel.connect().await?;

    // Beide Einladungen kreuzen sich: das Relay hält sie zurück, bis
    // beide Seiten in Calling sind
    relay.pause();
    let (a_result, b_result) = tokio::join!(
        alice.handle.initiate(peer("bob")),
        bob.handle.initiate(peer("alice")),
    );
    a_result?;
    b_result?;
    relay.resume();

    wait_for_state(&mut a_events, CallState::InCall { peer_id: peer("bob") }).await;
    wait_for_state(&mut b_events, CallState::InCall { peer_id: peer("alice") }).await;

    // Tie-Break: kleinere Id (alice) bleibt Initiator, genau ein Offer
    assert_eq!(relay.offer_count(), 1);
    let offer_target = relay.sent_messages().into_iter().find_map(|m| match m {
        SignalingMessage::Offer { target, .. } => Some(target),
        _ => None,
    });
    assert_eq!(offer_target, Some(peer("bob")));

    Ok(())
}

// ============================================================================
// BUSY & REJECT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_invite_while_in_call_is_auto_rejected() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());
    let carol = spawn_peer(&relay, "carol", ScriptedPresenter::rejecting());
    establish_call(&alice, &bob).await?;

    let mut c_events = carol.handle.subscribe();
    carol.handle.initiate(peer("bob")).await?;

    let rejected = tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match c_events.recv().await {
                Ok(CallEvent::RejectedByPeer { peer_id }) => break peer_id,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await?;
    assert_eq!(rejected, peer("bob"));

    wait_for_state(&mut c_events, CallState::Idle).await;

    // Der Besetzte bleibt unverändert im Anruf, ohne zweite Session
    assert_eq!(
        bob.handle.state().await?,
        CallState::InCall { peer_id: peer("alice") }
    );
    assert_eq!(bob.media.handles_created(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rejected_call_releases_caller_resources() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::rejecting());

    let mut a_events = alice.handle.subscribe();
    bob.channel.connect().await?;
    alice.handle.initiate(peer("bob")).await?;

    wait_for_state(&mut a_events, CallState::Idle).await;
    assert_eq!(relay.offer_count(), 0);

    // Auch das parallel beschaffte Medien-Handle ist wieder frei
    wait_until(|| alice.media.all_released()).await;
    assert_eq!(bob.handle.state().await?, CallState::Idle);

    Ok(())
}

// ============================================================================
// RING TIMEOUT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unanswered_ring_times_out_on_both_sides() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    // Der Anrufer gibt früher auf als der Angerufene klingelt, damit
    // beide Abläufe unabhängig beobachtbar sind
    let caller_config = CallConfig {
        ring_timeout: Duration::from_secs(20),
        ..CallConfig::default()
    };
    let alice = spawn_peer_with_config(
        &relay,
        "alice",
        ScriptedPresenter::rejecting(),
        caller_config,
    );
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::never_answering());

    let mut a_events = alice.handle.subscribe();
    let mut b_events = bob.handle.subscribe();

    bob.channel.connect().await?;
    alice.handle.initiate(peer("bob")).await?;
    wait_for_state(&mut b_events, CallState::Ringing { peer_id: peer("alice") }).await;

    // Niemand reagiert; die pausierte Uhr springt zum Ring-Timeout
    let error = wait_for_error(&mut a_events).await;
    assert!(matches!(error, CallError::Timeout));
    wait_for_state(&mut a_events, CallState::Idle).await;
    wait_for_state(&mut b_events, CallState::Idle).await;

    // Die offene Anzeige wurde zurückgezogen, ohne dass je Medien liefen
    wait_until(|| bob.presenter.dismiss_count() == 1).await;
    assert_eq!(bob.media.handles_created(), 0);

    Ok(())
}

// ============================================================================
// ICE CANDIDATE QUEUE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_early_candidates_are_queued_and_drained_in_order() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());

    // Die Anruferseite wird hier roh simuliert, um die Reihenfolge der
    // Zustellung vollständig zu kontrollieren
    let raw_alice = relay.client(peer("alice"));
    raw_alice.connect().await?;
    let mut alice_inbox = raw_alice.subscribe();

    let mut b_events = bob.handle.subscribe();
    bob.channel.connect().await?;

    raw_alice
        .send(SignalingMessage::CallInvite {
            target: peer("bob"),
            caller_id: peer("alice"),
            caller_name: "Alice".to_string(),
        })
        .await?;
    wait_for_state(&mut b_events, CallState::Calling { peer_id: peer("alice") }).await;

    // Kandidaten treffen vor dem Offer ein, einer davon kaputt
    for candidate in ["cand-1", "cand-2", "malformed-3", "cand-4"] {
        raw_alice
            .send(SignalingMessage::IceCandidate {
                target: peer("bob"),
                candidate: candidate.to_string(),
            })
            .await?;
    }

    raw_alice
        .send(SignalingMessage::Offer {
            target: peer("bob"),
            sdp: "v=0 raw-offer".to_string(),
        })
        .await?;

    wait_for_state(&mut b_events, CallState::InCall { peer_id: peer("alice") }).await;

    // Queue wurde in Ankunftsreihenfolge geleert; der kaputte Kandidat
    // fällt leise weg, bricht aber nichts ab
    let b_conn = bob.connector.wait_for_connection().await;
    assert_eq!(
        b_conn.applied_candidates(),
        vec!["cand-1".to_string(), "cand-2".to_string(), "cand-4".to_string()]
    );
    assert_eq!(
        b_conn.remote_descriptions().first().map(|(kind, _)| *kind),
        Some(SdpKind::Offer)
    );

    // Die rohe Gegenseite hat Answer und CallAccepted bekommen
    let mut saw_answer = false;
    while let Ok(event) = alice_inbox.try_recv() {
        if let peerline::signaling::SignalingEvent::Message(SignalingMessage::Answer {
            ..
        }) = event
        {
            saw_answer = true;
        }
    }
    assert!(saw_answer);

    Ok(())
}

// ============================================================================
// HANGUP & RESOURCE RELEASE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_hangup_releases_both_sides_without_echo() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());
    establish_call(&alice, &bob).await?;

    let mut a_events = alice.handle.subscribe();
    let mut b_events = bob.handle.subscribe();

    alice.handle.end().await?;
    wait_for_state(&mut a_events, CallState::Idle).await;
    wait_for_state(&mut b_events, CallState::Idle).await;

    // Kein Medien-Handle überlebt die Session
    wait_until(|| alice.media.all_released() && bob.media.all_released()).await;
    assert!(alice.connector.connections().iter().all(|c| c.is_closed()));
    assert!(bob.connector.connections().iter().all(|c| c.is_closed()));

    // Genau ein call-ended: der Empfänger echot nicht zurück
    let ended = relay
        .sent_messages()
        .iter()
        .filter(|m| matches!(m, SignalingMessage::CallEnded { .. }))
        .count();
    assert_eq!(ended, 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_second_initiate_fails_while_busy() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());
    establish_call(&alice, &bob).await?;

    let result = alice.handle.initiate(peer("carol")).await;
    assert!(matches!(result, Err(CallError::AlreadyInCall)));
    assert_eq!(
        alice.handle.state().await?,
        CallState::InCall { peer_id: peer("bob") }
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_media_arriving_after_hangup_is_released_immediately() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::never_answering());

    // Permission-Prompt dauert; der Benutzer legt vorher auf
    alice.media.set_delay(Duration::from_secs(5));

    let mut a_events = alice.handle.subscribe();
    bob.channel.connect().await?;
    alice.handle.initiate(peer("bob")).await?;
    alice.handle.end().await?;
    wait_for_state(&mut a_events, CallState::Idle).await;

    // Das verspätete Handle wird beim Eintreffen sofort freigegeben
    wait_until(|| alice.media.handles_created() == 1 && alice.media.all_released()).await;
    assert_eq!(alice.handle.state().await?, CallState::Idle);

    Ok(())
}

// ============================================================================
// MEDIA RETRY
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_media_failure_is_retried_once() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());

    alice.media.fail_times(1);
    establish_call(&alice, &bob).await?;

    assert_eq!(alice.media.acquisitions(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_second_media_failure_fails_the_session() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());

    alice.media.fail_times(2);

    let mut a_events = alice.handle.subscribe();
    let mut b_events = bob.handle.subscribe();
    bob.channel.connect().await?;
    alice.handle.initiate(peer("bob")).await?;

    let error = wait_for_error(&mut a_events).await;
    assert!(matches!(error, CallError::Media(_)));
    wait_for_state(&mut a_events, CallState::Failed).await;
    wait_for_state(&mut a_events, CallState::Idle).await;

    // Die Gegenseite wird per call-ended informiert und räumt auf
    wait_for_state(&mut b_events, CallState::Idle).await;
    Ok(())
}

// ============================================================================
// CONNECTIVITY RECOVERY
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_failure_triggers_ice_restart() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());
    establish_call(&alice, &bob).await?;

    let a_conn = alice.connector.wait_for_connection().await;
    let offers_before = relay.offer_count();

    a_conn.emit_connectivity(Connectivity::Failed).await;

    // Restart-Offer geht raus und wird von der Gegenseite beantwortet
    wait_until(|| relay.offer_count() == offers_before + 1).await;
    assert_eq!(
        alice.handle.state().await?,
        CallState::InCall { peer_id: peer("bob") }
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_double_failure_within_window_is_fatal() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());
    establish_call(&alice, &bob).await?;

    let mut a_events = alice.handle.subscribe();
    let mut b_events = bob.handle.subscribe();
    let a_conn = alice.connector.wait_for_connection().await;

    a_conn.emit_connectivity(Connectivity::Failed).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    a_conn.emit_connectivity(Connectivity::Failed).await;

    let error = wait_for_error(&mut a_events).await;
    assert!(matches!(error, CallError::Negotiation(_)));
    wait_for_state(&mut a_events, CallState::Failed).await;
    wait_for_state(&mut a_events, CallState::Idle).await;

    // Medien gestoppt, Gegenseite per call-ended beendet
    wait_until(|| alice.media.all_released()).await;
    wait_for_state(&mut b_events, CallState::Idle).await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_grace_recovers_without_restart() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());
    establish_call(&alice, &bob).await?;

    let a_conn = alice.connector.wait_for_connection().await;
    let offers_before = relay.offer_count();

    // Kurzer Aussetzer, Verbindung erholt sich innerhalb der Karenz
    a_conn.emit_connectivity(Connectivity::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    a_conn.emit_connectivity(Connectivity::Connected).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(relay.offer_count(), offers_before);
    assert_eq!(
        alice.handle.state().await?,
        CallState::InCall { peer_id: peer("bob") }
    );

    Ok(())
}

// ============================================================================
// CHANNEL DROP
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_channel_drop_mid_call_reconnects_once() -> anyhow::Result<()> {
    let relay = MockRelay::new();
    let alice = spawn_peer(&relay, "alice", ScriptedPresenter::rejecting());
    let bob = spawn_peer(&relay, "bob", ScriptedPresenter::accepting());
    establish_call(&alice, &bob).await?;

    alice.channel.drop_connection();
    wait_until(|| alice.channel.is_connected()).await;
    assert_eq!(
        alice.handle.state().await?,
        CallState::InCall { peer_id: peer("bob") }
    );

    // Der zweite Abriss derselben Session wird nicht mehr repariert
    let mut a_events = alice.handle.subscribe();
    alice.channel.drop_connection();

    let error = wait_for_error(&mut a_events).await;
    assert!(matches!(error, CallError::Channel(_)));
    wait_for_state(&mut a_events, CallState::Idle).await;
    wait_until(|| alice.media.all_released()).await;

    Ok(())
}
