//! Session negotiator driven against a real registry.
//!
//! Every session talks to an in-process registry on a mock media engine
//! over an in-memory link, with loopback capture and device on the client
//! side.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::{ParticipantId, RoomId};
use registry_test_utils::{random_room, spawn_registry, MockMediaEngine};
use room_registry::actors::{RegistryActorHandle, RoomState};
use session_client::config::RecoverySettings;
use session_client::errors::MediaAcquisitionError;
use session_client::media::loopback::{LoopbackDevice, LoopbackMedia};
use session_client::media::RemoteTrack;
use session_client::{
    JoinMode, SessionActor, SessionError, SessionEvent, SessionHandle, SessionSettings,
    SessionState,
};
use signaling_protocol::link::link_pair;
use signaling_protocol::{IceTransportPolicy, MediaKind, TransportRole};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(3);

fn fast_recovery() -> RecoverySettings {
    RecoverySettings {
        send_backoff: Duration::from_millis(50),
        recv_backoff: Duration::from_millis(80),
        max_attempts: 3,
    }
}

/// One participant: a session plus the loopback device it runs on.
struct Peer {
    handle: SessionHandle,
    device: Arc<LoopbackDevice>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Peer {
    fn spawn(registry: &RegistryActorHandle, room: &RoomId, user_id: &str) -> Self {
        Self::spawn_with(registry, room, user_id, LoopbackMedia::new())
    }

    fn spawn_with(
        registry: &RegistryActorHandle,
        room: &RoomId,
        user_id: &str,
        media: LoopbackMedia,
    ) -> Self {
        let (client, server) = link_pair();
        let _connection = registry.accept(server);

        let device = Arc::new(LoopbackDevice::new());
        let settings = SessionSettings::new(room.clone(), ParticipantId::new(user_id))
            .with_recovery(fast_recovery());
        let (handle, _task) = SessionActor::spawn(
            settings,
            client,
            Arc::new(media),
            device.clone(),
            CancellationToken::new(),
        );
        let events = handle.subscribe();

        Self {
            handle,
            device,
            events,
        }
    }

    async fn next(&mut self, predicate: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        tokio::time::timeout(STEP, async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    async fn published(&mut self, count: usize) {
        for _ in 0..count {
            self.next(|e| matches!(e, SessionEvent::Published { .. }))
                .await;
        }
    }

    async fn tracks_added(&mut self, count: usize) -> Vec<RemoteTrack> {
        let mut tracks = Vec::new();
        for _ in 0..count {
            if let SessionEvent::TrackAdded(track) = self
                .next(|e| matches!(e, SessionEvent::TrackAdded(_)))
                .await
            {
                tracks.push(track);
            }
        }
        tracks
    }

    async fn tracks_removed(&mut self, count: usize) -> Vec<RemoteTrack> {
        let mut tracks = Vec::new();
        for _ in 0..count {
            if let SessionEvent::TrackRemoved(track) = self
                .next(|e| matches!(e, SessionEvent::TrackRemoved(_)))
                .await
            {
                tracks.push(track);
            }
        }
        tracks
    }

    async fn remote_owners(&self) -> HashSet<String> {
        self.handle
            .snapshot()
            .await
            .unwrap()
            .remote_tracks
            .iter()
            .map(|t| t.owner.as_str().to_string())
            .collect()
    }
}

async fn room_state(registry: &RegistryActorHandle, room: &RoomId) -> RoomState {
    registry
        .lookup_room(room.clone())
        .await
        .unwrap()
        .expect("room not found")
        .get_state()
        .await
        .unwrap()
}

fn kinds(tracks: &[RemoteTrack]) -> HashSet<MediaKind> {
    tracks.iter().map(|t| t.kind).collect()
}

#[tokio::test]
async fn test_publisher_receives_existing_tracks() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = Peer::spawn(&registry, &room, "alice");
    alice.handle.join(JoinMode::Publisher).await.unwrap();
    alice.published(2).await;

    let mut bob = Peer::spawn(&registry, &room, "bob");
    bob.handle.join(JoinMode::Publisher).await.unwrap();

    // Bob consumes exactly Alice's two tracks
    let added = bob.tracks_added(2).await;
    assert!(added.iter().all(|t| t.owner.as_str() == "alice"));
    assert_eq!(kinds(&added), HashSet::from([MediaKind::Audio, MediaKind::Video]));

    // And Alice picks up Bob's as they are published
    let added = alice.tracks_added(2).await;
    assert!(added.iter().all(|t| t.owner.as_str() == "bob"));

    let snapshot = bob.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(snapshot.remote_tracks.len(), 2);
    assert_eq!(snapshot.published.len(), 2);

    let recv = bob.device.latest_transport(TransportRole::Recv).unwrap();
    assert_eq!(recv.consumer_count(), 2);

    let state = room_state(&registry, &room).await;
    assert_eq!(state.publications.len(), 4);
}

#[tokio::test]
async fn test_spectator_never_publishes() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = Peer::spawn(&registry, &room, "alice");
    alice.handle.join(JoinMode::Publisher).await.unwrap();
    alice.published(2).await;

    let mut carol = Peer::spawn(&registry, &room, "carol");
    carol.handle.join(JoinMode::Spectator).await.unwrap();
    let added = carol.tracks_added(2).await;
    assert!(added.iter().all(|t| t.owner.as_str() == "alice"));

    let snapshot = carol.handle.snapshot().await.unwrap();
    assert!(snapshot.send_transport.is_none());
    assert!(snapshot.local_tracks.is_empty());
    assert!(carol.device.latest_transport(TransportRole::Send).is_none());

    let state = room_state(&registry, &room).await;
    let carol_state = state.participant(&ParticipantId::new("carol")).unwrap();
    assert!(carol_state.is_spectator);
    assert!(carol_state.transports_with_role(TransportRole::Send).is_empty());
    assert!(state
        .publications
        .iter()
        .all(|p| p.producer_owner_identity.as_str() == "alice"));

    // Tracks published after the spectator joined still reach it
    let bob = Peer::spawn(&registry, &room, "bob");
    bob.handle.join(JoinMode::Publisher).await.unwrap();
    let added = carol.tracks_added(2).await;
    assert!(added.iter().all(|t| t.owner.as_str() == "bob"));

    // Nobody consumes anything from the spectator
    let owners = bob.remote_owners().await;
    assert!(!owners.contains("carol"));
}

#[tokio::test]
async fn test_failed_send_transport_is_superseded() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = Peer::spawn(&registry, &room, "alice");
    alice.handle.join(JoinMode::Publisher).await.unwrap();
    alice.published(2).await;

    let mut bob = Peer::spawn(&registry, &room, "bob");
    bob.handle.join(JoinMode::Spectator).await.unwrap();
    bob.tracks_added(2).await;

    let failed = alice.device.latest_transport(TransportRole::Send).unwrap();
    failed.fail();

    let scheduled = alice
        .next(|e| matches!(e, SessionEvent::RecoveryScheduled { .. }))
        .await;
    assert!(matches!(
        scheduled,
        SessionEvent::RecoveryScheduled {
            role: TransportRole::Send,
            attempt: 1,
            ..
        }
    ));

    // The replacement republishes both tracks
    alice.published(2).await;
    assert!(failed.is_closed());

    let replacement = alice.device.latest_transport(TransportRole::Send).unwrap();
    assert_eq!(replacement.ice_transport_policy(), IceTransportPolicy::Relay);
    let options = engine.transport_options();
    let last = options.last().unwrap();
    assert!(last.enable_tcp);
    assert!(!last.enable_udp);

    // Registry holds exactly one send transport for Alice: the new one
    let snapshot = alice.handle.snapshot().await.unwrap();
    let state = room_state(&registry, &room).await;
    let alice_state = state.participant(&ParticipantId::new("alice")).unwrap();
    assert_eq!(
        alice_state.transports_with_role(TransportRole::Send),
        vec![snapshot.send_transport.as_ref().unwrap()]
    );
    assert_eq!(alice_state.producers.len(), 2);

    // Bob swaps the old tracks for the new ones
    let removed = bob.tracks_removed(2).await;
    let added = bob.tracks_added(2).await;
    assert_eq!(kinds(&removed), kinds(&added));
    assert_eq!(bob.handle.snapshot().await.unwrap().remote_tracks.len(), 2);
}

#[tokio::test]
async fn test_leave_notifies_room_and_allows_rejoin() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = Peer::spawn(&registry, &room, "alice");
    alice.handle.join(JoinMode::Publisher).await.unwrap();
    alice.published(2).await;

    let mut bob = Peer::spawn(&registry, &room, "bob");
    bob.handle.join(JoinMode::Spectator).await.unwrap();
    bob.tracks_added(2).await;

    alice.handle.leave().await.unwrap();
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.send_transport.is_none());
    assert!(alice.device.transports().iter().all(|t| t.is_closed()));

    bob.tracks_removed(2).await;
    bob.next(|e| matches!(e, SessionEvent::ParticipantLeft { user_id } if user_id.as_str() == "alice"))
        .await;
    assert!(bob.remote_owners().await.is_empty());

    // Same identity, same link
    alice.handle.join(JoinMode::Publisher).await.unwrap();
    alice.published(2).await;
    let added = bob.tracks_added(2).await;
    assert!(added.iter().all(|t| t.owner.as_str() == "alice"));
}

#[tokio::test]
async fn test_media_failure_never_reaches_registry() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let alice = Peer::spawn_with(
        &registry,
        &room,
        "alice",
        LoopbackMedia::failing(MediaAcquisitionError::DeviceNotFound),
    );
    let err = alice.handle.join(JoinMode::Publisher).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::MediaAcquisition(MediaAcquisitionError::DeviceNotFound)
    );
    assert_eq!(alice.handle.state().await.unwrap(), SessionState::Idle);

    assert_eq!(registry.get_status().await.unwrap().room_count, 0);
    assert_eq!(engine.contexts_created(), 0);

    // A spectator join still works on the same session
    alice.handle.join(JoinMode::Spectator).await.unwrap();
}

#[tokio::test]
async fn test_engine_not_ready_fails_join() {
    let engine = MockMediaEngine::builder().not_ready().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let alice = Peer::spawn(&registry, &room, "alice");
    let err = alice.handle.join(JoinMode::Publisher).await.unwrap_err();
    assert_eq!(
        err.wire_kind(),
        Some(signaling_protocol::ErrorKind::ServerNotReady)
    );
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.local_tracks.is_empty());

    engine.set_ready(true);
    alice.handle.join(JoinMode::Publisher).await.unwrap();
}

#[tokio::test]
async fn test_subscriptions_track_live_producers() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = Peer::spawn(&registry, &room, "alice");
    let mut bob = Peer::spawn(&registry, &room, "bob");
    let mut carol = Peer::spawn(&registry, &room, "carol");

    alice.handle.join(JoinMode::Publisher).await.unwrap();
    alice.published(2).await;
    bob.handle.join(JoinMode::Publisher).await.unwrap();
    bob.published(2).await;
    carol.handle.join(JoinMode::Publisher).await.unwrap();
    carol.published(2).await;

    alice.tracks_added(4).await;
    bob.tracks_added(4).await;
    carol.tracks_added(4).await;

    bob.handle.leave().await.unwrap();
    alice.tracks_removed(2).await;
    carol.tracks_removed(2).await;

    assert_eq!(alice.remote_owners().await, HashSet::from(["carol".to_string()]));
    assert_eq!(carol.remote_owners().await, HashSet::from(["alice".to_string()]));
    assert!(bob.remote_owners().await.is_empty());

    let state = room_state(&registry, &room).await;
    let live: HashSet<String> = state
        .publications
        .iter()
        .map(|p| p.producer_owner_identity.as_str().to_string())
        .collect();
    assert_eq!(live, HashSet::from(["alice".to_string(), "carol".to_string()]));
}
