//! Multi-participant room scenarios driven through the signaling protocol.
//!
//! Each test spawns a registry on a mock media engine and talks to it with
//! [`TestClient`]s over in-memory links, so the full connection actor,
//! registry actor and room actor chain is exercised.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::{ParticipantId, ProducerId};
use registry_test_utils::{
    audio_only_capabilities, random_room, spawn_registry, spawn_registry_with, MockMediaEngine,
    TestClient,
};
use room_registry::actors::{RegistryActorHandle, RegistrySettings, RoomSettings};
use signaling_protocol::{ErrorKind, MediaKind, ServerEvent, TransportRole};
use std::collections::HashSet;
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(100);

/// Poll the registry until `room_count` reaches `expected`.
async fn wait_for_room_count(registry: &RegistryActorHandle, expected: usize) {
    for _ in 0..50 {
        if registry.get_status().await.unwrap().room_count == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let actual = registry.get_status().await.unwrap().room_count;
    assert_eq!(actual, expected, "room count never settled");
}

#[tokio::test]
async fn test_two_publishers_see_each_other() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let alice_send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    alice.connect_transport(&room, &alice_send.id).await.unwrap();
    let audio = alice
        .produce(&room, &alice_send.id, MediaKind::Audio)
        .await
        .unwrap();
    let video = alice
        .produce(&room, &alice_send.id, MediaKind::Video)
        .await
        .unwrap();

    let mut bob = TestClient::connect(&registry, "bob");
    bob.join(&room).await.unwrap();

    // Alice learns about Bob
    let joined = alice
        .expect_event(|e| matches!(e, ServerEvent::ParticipantJoined { .. }))
        .await;
    assert_eq!(
        joined,
        ServerEvent::ParticipantJoined {
            user_id: ParticipantId::new("bob")
        }
    );

    let bob_recv = bob
        .create_transport(&room, TransportRole::Recv)
        .await
        .unwrap();
    bob.connect_transport(&room, &bob_recv.id).await.unwrap();

    let existing = bob.get_producers(&room).await.unwrap();
    assert_eq!(existing.len(), 2);
    let ids: HashSet<_> = existing.iter().map(|p| p.producer_id.clone()).collect();
    assert!(ids.contains(&audio));
    assert!(ids.contains(&video));
    assert!(existing
        .iter()
        .all(|p| p.producer_owner_identity == ParticipantId::new("alice")));

    for publication in &existing {
        let consumer = bob
            .consume(&room, &bob_recv.id, &publication.producer_id)
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, publication.producer_id);
        assert_eq!(consumer.kind, publication.kind);
        bob.resume(&room, &consumer.id).await.unwrap();
    }

    // Bob publishes; Alice is told, Bob is not
    let bob_send = bob
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let bob_audio = bob
        .produce(&room, &bob_send.id, MediaKind::Audio)
        .await
        .unwrap();

    let announced = alice
        .expect_event(|e| matches!(e, ServerEvent::NewProducer(_)))
        .await;
    match announced {
        ServerEvent::NewProducer(info) => {
            assert_eq!(info.producer_id, bob_audio);
            assert_eq!(info.producer_owner_identity, ParticipantId::new("bob"));
            assert_eq!(info.kind, MediaKind::Audio);
        }
        other => unreachable!("filtered above: {other:?}"),
    }
    bob.expect_no_event(QUIET).await;

    // Alice's own listing excludes her publications
    let for_alice = alice.get_producers(&room).await.unwrap();
    assert_eq!(for_alice.len(), 1);
    assert_eq!(for_alice.first().unwrap().producer_id, bob_audio);
}

#[tokio::test]
async fn test_producer_owner_leaving_closes_downstream() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let audio = alice
        .produce(&room, &send.id, MediaKind::Audio)
        .await
        .unwrap();

    let mut bob = TestClient::connect(&registry, "bob");
    bob.join(&room).await.unwrap();
    let recv = bob
        .create_transport(&room, TransportRole::Recv)
        .await
        .unwrap();
    let consumer = bob.consume(&room, &recv.id, &audio).await.unwrap();

    alice.leave(&room).await.unwrap();

    let closed = bob
        .expect_event(|e| matches!(e, ServerEvent::ConsumerClosed { .. }))
        .await;
    assert_eq!(
        closed,
        ServerEvent::ConsumerClosed {
            consumer_id: consumer.id.clone(),
            producer_id: audio.clone(),
        }
    );
    bob.expect_event(|e| *e == ServerEvent::ProducerClosed { producer_id: audio.clone() })
        .await;
    bob.expect_event(|e| {
        *e == ServerEvent::ParticipantLeft {
            user_id: ParticipantId::new("alice"),
        }
    })
    .await;

    // The publication is gone
    assert!(bob.get_producers(&room).await.unwrap().is_empty());
    let err = bob.consume(&room, &recv.id, &audio).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProducerNotFound);

    // Resuming the closed consumer is a silent no-op
    bob.resume(&room, &consumer.id).await.unwrap();
}

#[tokio::test]
async fn test_leave_twice_broadcasts_once() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    let mut bob = TestClient::connect(&registry, "bob");
    alice.join(&room).await.unwrap();
    bob.join(&room).await.unwrap();
    alice
        .expect_event(|e| matches!(e, ServerEvent::ParticipantJoined { .. }))
        .await;

    bob.leave(&room).await.unwrap();
    bob.leave(&room).await.unwrap();

    alice
        .expect_event(|e| {
            *e == ServerEvent::ParticipantLeft {
                user_id: ParticipantId::new("bob"),
            }
        })
        .await;
    alice.expect_no_event(QUIET).await;
}

#[tokio::test]
async fn test_last_leave_closes_room_and_rejoin_gets_fresh_context() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    alice
        .produce(&room, &send.id, MediaKind::Video)
        .await
        .unwrap();
    assert_eq!(engine.contexts_created(), 1);

    alice.leave(&room).await.unwrap();
    wait_for_room_count(&registry, 0).await;
    assert!(registry.lookup_room(room.clone()).await.unwrap().is_none());
    assert_eq!(engine.contexts_closed(), 1);
    assert_eq!(engine.transports_closed(), 1);

    alice.join(&room).await.unwrap();
    assert_eq!(engine.contexts_created(), 2);
    let handle = registry.lookup_room(room.clone()).await.unwrap().unwrap();
    let state = handle.get_state().await.unwrap();
    assert_eq!(state.participants.len(), 1);
    assert!(state.publications.is_empty());
}

#[tokio::test]
async fn test_second_send_transport_supersedes_first() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let first = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let old_audio = alice
        .produce(&room, &first.id, MediaKind::Audio)
        .await
        .unwrap();

    let mut bob = TestClient::connect(&registry, "bob");
    bob.join(&room).await.unwrap();

    let second = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(engine.transports_closed(), 1);

    bob.expect_event(|e| {
        *e == ServerEvent::ProducerClosed {
            producer_id: old_audio.clone(),
        }
    })
    .await;

    let state = registry
        .lookup_room(room.clone())
        .await
        .unwrap()
        .unwrap()
        .get_state()
        .await
        .unwrap();
    let snapshot = state.participant(&ParticipantId::new("alice")).unwrap();
    assert_eq!(snapshot.transports_with_role(TransportRole::Send), vec![&second.id]);
    assert!(snapshot.producers.is_empty());

    // Producing on the superseded transport fails as a stale reference
    let err = alice
        .produce(&room, &first.id, MediaKind::Audio)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransportNotFound);
    assert!(err.kind.is_stale_reference());

    // Connect on the superseded transport is tolerated
    alice.connect_transport(&room, &first.id).await.unwrap();
}

#[tokio::test]
async fn test_recv_transport_supersede_notifies_owner() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let audio = alice
        .produce(&room, &send.id, MediaKind::Audio)
        .await
        .unwrap();

    let mut bob = TestClient::connect(&registry, "bob");
    bob.join(&room).await.unwrap();
    let recv = bob
        .create_transport(&room, TransportRole::Recv)
        .await
        .unwrap();
    let consumer = bob.consume(&room, &recv.id, &audio).await.unwrap();

    bob.create_transport(&room, TransportRole::Recv)
        .await
        .unwrap();
    bob.expect_event(|e| {
        *e == ServerEvent::ConsumerClosed {
            consumer_id: consumer.id.clone(),
            producer_id: audio.clone(),
        }
    })
    .await;

    // Alice's publication is untouched
    assert_eq!(bob.get_producers(&room).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_engine_closed_send_transport_withdraws_publications() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let audio = alice
        .produce(&room, &send.id, MediaKind::Audio)
        .await
        .unwrap();

    let mut bob = TestClient::connect(&registry, "bob");
    bob.join(&room).await.unwrap();
    let recv = bob
        .create_transport(&room, TransportRole::Recv)
        .await
        .unwrap();
    let consumer = bob.consume(&room, &recv.id, &audio).await.unwrap();

    // DTLS closed underneath the registry
    assert!(engine.force_close(&send.id));

    bob.expect_event(|e| {
        *e == ServerEvent::ConsumerClosed {
            consumer_id: consumer.id.clone(),
            producer_id: audio.clone(),
        }
    })
    .await;
    bob.expect_event(|e| *e == ServerEvent::ProducerClosed { producer_id: audio.clone() })
        .await;

    assert!(bob.get_producers(&room).await.unwrap().is_empty());
    let err = bob.consume(&room, &recv.id, &audio).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProducerNotFound);

    // Alice stays in the room without a send transport
    let state = registry
        .lookup_room(room.clone())
        .await
        .unwrap()
        .unwrap()
        .get_state()
        .await
        .unwrap();
    assert!(state.publications.is_empty());
    let alice_state = state.participant(&ParticipantId::new("alice")).unwrap();
    assert!(alice_state.transports_with_role(TransportRole::Send).is_empty());
    assert!(alice_state.producers.is_empty());
    assert!(engine.transports_closed() >= 1);
}

#[tokio::test]
async fn test_engine_closed_recv_transport_notifies_owner_only() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let audio = alice
        .produce(&room, &send.id, MediaKind::Audio)
        .await
        .unwrap();

    let mut bob = TestClient::connect(&registry, "bob");
    bob.join(&room).await.unwrap();
    let recv = bob
        .create_transport(&room, TransportRole::Recv)
        .await
        .unwrap();
    let consumer = bob.consume(&room, &recv.id, &audio).await.unwrap();
    alice
        .expect_event(|e| matches!(e, ServerEvent::ParticipantJoined { .. }))
        .await;
    alice.drain_events();

    assert!(engine.force_close(&recv.id));

    bob.expect_event(|e| {
        *e == ServerEvent::ConsumerClosed {
            consumer_id: consumer.id.clone(),
            producer_id: audio.clone(),
        }
    })
    .await;
    alice.expect_no_event(QUIET).await;

    // The publication survives; Bob's stale transport is gone
    assert_eq!(bob.get_producers(&room).await.unwrap().len(), 1);
    let err = bob.consume(&room, &recv.id, &audio).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransportNotFound);
}

#[tokio::test]
async fn test_spectator_receives_but_cannot_publish() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let audio = alice
        .produce(&room, &send.id, MediaKind::Audio)
        .await
        .unwrap();

    let mut viewer = TestClient::connect(&registry, "viewer");
    viewer.join_as_spectator(&room).await.unwrap();

    let err = viewer
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);

    let recv = viewer
        .create_transport(&room, TransportRole::Recv)
        .await
        .unwrap();
    let existing = viewer.get_producers(&room).await.unwrap();
    assert_eq!(existing.len(), 1);
    viewer.consume(&room, &recv.id, &audio).await.unwrap();

    let video = alice
        .produce(&room, &send.id, MediaKind::Video)
        .await
        .unwrap();
    viewer
        .expect_event(|e| matches!(e, ServerEvent::NewProducer(info) if info.producer_id == video))
        .await;

    let state = registry
        .lookup_room(room.clone())
        .await
        .unwrap()
        .unwrap()
        .get_state()
        .await
        .unwrap();
    let snapshot = state.participant(&ParticipantId::new("viewer")).unwrap();
    assert!(snapshot.is_spectator);
    assert!(snapshot.transports_with_role(TransportRole::Send).is_empty());
    assert_eq!(snapshot.transports_with_role(TransportRole::Recv).len(), 1);
}

#[tokio::test]
async fn test_engine_not_ready_rejects_join() {
    let engine = MockMediaEngine::builder().not_ready().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    let err = alice.join(&room).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServerNotReady);
    assert_eq!(engine.contexts_created(), 0);

    engine.set_ready(true);
    alice.join(&room).await.unwrap();
    assert_eq!(engine.contexts_created(), 1);
}

#[tokio::test]
async fn test_incompatible_consumer_rejected() {
    let engine = MockMediaEngine::builder().reject_consume().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let video = alice
        .produce(&room, &send.id, MediaKind::Video)
        .await
        .unwrap();

    let mut bob = TestClient::connect(&registry, "bob");
    bob.join(&room).await.unwrap();
    let recv = bob
        .create_transport(&room, TransportRole::Recv)
        .await
        .unwrap();

    let err = bob
        .consume_with(&room, &recv.id, &video, audio_only_capabilities())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::CannotConsume);
    assert!(!err.kind.is_stale_reference());
}

#[tokio::test]
async fn test_force_tcp_disables_udp() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    alice
        .create_transport_with(&room, TransportRole::Recv, true)
        .await
        .unwrap();

    let options = engine.transport_options();
    assert_eq!(options.len(), 2);
    let normal = options.first().unwrap();
    let forced = options.get(1).unwrap();
    assert!(normal.enable_udp && normal.prefer_udp);
    assert!(!forced.enable_udp && forced.enable_tcp);
    assert_eq!(forced.announced_ip, registry_test_utils::TEST_ANNOUNCED_IP);
}

#[tokio::test]
async fn test_transport_failure_reports_media_error() {
    let engine = MockMediaEngine::builder().fail_transports().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let err = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MediaEngine);
    assert_eq!(engine.transports_created(), 0);
}

#[tokio::test]
async fn test_disconnect_is_equivalent_to_leave() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    alice.join(&room).await.unwrap();
    let send = alice
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();
    let audio = alice
        .produce(&room, &send.id, MediaKind::Audio)
        .await
        .unwrap();

    let mut bob = TestClient::connect(&registry, "bob");
    bob.join(&room).await.unwrap();

    alice.disconnect().await;

    bob.expect_event(|e| *e == ServerEvent::ProducerClosed { producer_id: audio.clone() })
        .await;
    bob.expect_event(|e| {
        *e == ServerEvent::ParticipantLeft {
            user_id: ParticipantId::new("alice"),
        }
    })
    .await;
    assert!(bob.get_producers(&room).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_connection_close_keeps_rebound_participant() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let old = {
        let mut client = TestClient::connect(&registry, "alice");
        client.join(&room).await.unwrap();
        client
    };

    // Same identity reconnects before the old socket is noticed as dead
    let mut fresh = TestClient::connect(&registry, "alice");
    fresh.join(&room).await.unwrap();
    let send = fresh
        .create_transport(&room, TransportRole::Send)
        .await
        .unwrap();

    old.disconnect().await;

    let state = registry
        .lookup_room(room.clone())
        .await
        .unwrap()
        .unwrap()
        .get_state()
        .await
        .unwrap();
    let snapshot = state.participant(&ParticipantId::new("alice")).unwrap();
    assert_eq!(&snapshot.connection_id, fresh.connection().connection_id());
    assert_eq!(snapshot.transports_with_role(TransportRole::Send), vec![&send.id]);
}

#[tokio::test]
async fn test_concurrent_first_joiners_share_one_context() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let mut tasks = Vec::new();
    for n in 0..10 {
        let registry = registry.clone();
        let room = room.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(&registry, &format!("user-{n}"));
            client.join(&room).await.unwrap();
            client
        }));
    }

    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    assert_eq!(engine.contexts_created(), 1);
    let state = registry
        .lookup_room(room.clone())
        .await
        .unwrap()
        .unwrap()
        .get_state()
        .await
        .unwrap();
    assert_eq!(state.participants.len(), 10);
    assert_eq!(registry.get_status().await.unwrap().room_count, 1);
}

#[tokio::test]
async fn test_room_participant_limit() {
    let engine = MockMediaEngine::builder().build();
    let settings = RegistrySettings {
        room: RoomSettings {
            max_participants: 2,
            ..RoomSettings::default()
        },
        ..RegistrySettings::default()
    };
    let registry = spawn_registry_with(engine.clone(), settings);
    let room = random_room();

    let mut alice = TestClient::connect(&registry, "alice");
    let mut bob = TestClient::connect(&registry, "bob");
    let mut carol = TestClient::connect(&registry, "carol");
    alice.join(&room).await.unwrap();
    bob.join(&room).await.unwrap();

    let err = carol.join(&room).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::CapacityExceeded);

    // A rejoin under an existing identity is not counted twice
    alice.join(&room).await.unwrap();
}

/// Deterministic mixed sequence of joins, publishes and leaves.
///
/// After every step each member's listing must equal the live publications
/// of everyone else.
#[tokio::test]
async fn test_listings_track_membership_changes() {
    let engine = MockMediaEngine::builder().build();
    let registry = spawn_registry(engine.clone());
    let room = random_room();

    let names = ["ann", "ben", "cat", "dan"];
    let mut clients: Vec<Option<TestClient>> = names.iter().map(|_| None).collect();
    // Live producers per member
    let mut published: Vec<Vec<ProducerId>> =
        names.iter().map(|_| Vec::new()).collect();

    // xorshift so the sequence is reproducible without extra dev-dependencies
    let mut seed: u32 = 0x9E37_79B9;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        seed
    };

    for _ in 0..40 {
        let who = (next() as usize) % names.len();
        let action = next() % 3;
        let slot = clients.get_mut(who).unwrap();
        let name = names.get(who).unwrap();
        let producers = published.get_mut(who).unwrap();

        match (slot.as_mut(), action) {
            (None, _) => {
                let mut client = TestClient::connect(&registry, name);
                client.join(&room).await.unwrap();
                *slot = Some(client);
            }
            (Some(client), 0 | 1) => {
                let send = client
                    .create_transport(&room, TransportRole::Send)
                    .await
                    .unwrap();
                // A new send transport replaces the old one and its producers
                producers.clear();
                let id = client
                    .produce(&room, &send.id, MediaKind::Audio)
                    .await
                    .unwrap();
                producers.push(id);
            }
            (Some(client), _) => {
                client.leave(&room).await.unwrap();
                producers.clear();
                *slot = None;
            }
        }

        let live_members: Vec<usize> = (0..names.len())
            .filter(|i| clients.get(*i).is_some_and(Option::is_some))
            .collect();
        for member in live_members {
            let expected: HashSet<_> = published
                .iter()
                .enumerate()
                .filter(|(owner, _)| *owner != member)
                .flat_map(|(_, ids)| ids.iter().cloned())
                .collect();
            let client = clients.get_mut(member).unwrap().as_mut().unwrap();
            let listed: HashSet<_> = client
                .get_producers(&room)
                .await
                .unwrap()
                .into_iter()
                .map(|p| p.producer_id)
                .collect();
            assert_eq!(listed, expected, "listing for {}", names.get(member).unwrap());
            client.drain_events();
        }
    }
}
