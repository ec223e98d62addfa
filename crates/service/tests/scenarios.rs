//! End-to-end scenarios against a running pair (or more) of
//! `MeshNetworkService`s, wired with the `memory` module's loopback-TCP
//! transport and shared `Directory`. Each test favours a deterministic
//! construction over a timing-dependent one: known endpoints are dialled
//! directly rather than discovered, and every wait is a bounded poll
//! rather than a fixed sleep.

use mesh_crypto::NetworkIdentity;
use mesh_io::{EventBus, WorkerPool};
use mesh_message_store::MessageStore;
use mesh_network::collaborators::{ConnectionManager, Node, SecureChannel};
use mesh_network::packet::{read_frame, write_frame, ControlPacket, CONTROL_PORT};
use mesh_network::{Network, NetworkEvent, NetworkOptions};
use mesh_service::memory::{AcceptedConnection, Directory, InMemoryConnectionManager, InMemorySecureChannel};
use mesh_service::MeshNetworkService;
use mesh_types::{ConnectivityStatus, Endpoint, MessageType, NetworkKind, UserId};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn uid(n: u64) -> UserId {
    UserId::from_low_u64_be(n)
}

fn service(user_id: UserId, folder: &std::path::Path, directory: &Arc<Directory>) -> Arc<MeshNetworkService> {
    let cm = InMemoryConnectionManager::bind(user_id, directory.clone()).unwrap();
    MeshNetworkService::new(user_id, vec!["mesh-test-cipher".into()], folder.to_path_buf(), cm)
}

/// Polls `f` until it returns `Some`, panicking if `timeout` elapses first.
fn poll_until<T>(mut f: impl FnMut() -> Option<T>, timeout: Duration) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for condition");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// S1: Alice invites Bob. Bob's log ends up with one entry
/// (sender Alice, TextMessage, delivered=false at first observation);
/// Alice receives a delivery notification for messageNumber 0.
#[test]
fn s1_invitation_is_delivered_and_acked() {
    let directory = Directory::new();
    let alice_id = uid(0xa11ce);
    let bob_id = uid(0xb0b);

    let alice_folder = tempdir::TempDir::new("mesh-s1-alice").unwrap();
    let bob_folder = tempdir::TempDir::new("mesh-s1-bob").unwrap();
    let alice = service(alice_id, alice_folder.path(), &directory);
    let bob = service(bob_id, bob_folder.path(), &directory);

    let bob_endpoint = bob.connection_manager().local_endpoint();
    bob.start_listening().unwrap();

    let alice_network = alice.invite(bob_id, b"hi".to_vec()).unwrap();
    alice_network.go_online();
    let network_id = alice_network.network_id();

    // Bypass discovery: dial Bob's known endpoint directly.
    alice_network.begin_make_connection(bob_endpoint, None);

    let received = poll_until(
        || {
            bob.network(network_id)?;
            let events = bob.drain_events(network_id);
            events.into_iter().find_map(|e| match e {
                NetworkEvent::MessageReceived { sender, message_number, payload } => Some((sender, message_number, payload)),
                _ => None,
            })
        },
        Duration::from_secs(5),
    );
    assert_eq!(received.0, alice_id);
    assert_eq!(received.1, 0);
    assert_eq!(received.2, b"hi".to_vec());

    let bob_network = bob.network(network_id).unwrap();
    let stored = bob_network.message_store().read(0).unwrap();
    assert_eq!(stored.sender, alice_id);
    assert_eq!(stored.message_type, MessageType::TextMessage);
    assert_eq!(stored.payload, b"hi".to_vec());
    assert_eq!(stored.recipients.len(), 1);
    assert_eq!(stored.recipients[0].user_id, bob_id);
    assert_eq!(stored.recipients[0].status, mesh_types::DeliveryStatus::Pending);

    let delivered = poll_until(
        || {
            alice
                .drain_events(network_id)
                .into_iter()
                .find_map(|e| match e {
                    NetworkEvent::MessageDelivered { message_number, recipient } => Some((message_number, recipient)),
                    _ => None,
                })
        },
        Duration::from_secs(5),
    );
    assert_eq!(delivered, (0, bob_id));
}

/// An `InlineImage` message carries both the full image and its thumbnail
/// end to end, unlike a plain `TextMessage` which has neither.
#[test]
fn inline_image_carries_payload_and_thumbnail_to_the_recipient() {
    let directory = Directory::new();
    let alice_id = uid(0xa11ce2);
    let bob_id = uid(0xb0b2);

    let alice_folder = tempdir::TempDir::new("mesh-inline-alice").unwrap();
    let bob_folder = tempdir::TempDir::new("mesh-inline-bob").unwrap();
    let alice = service(alice_id, alice_folder.path(), &directory);
    let bob = service(bob_id, bob_folder.path(), &directory);
    bob.start_listening().unwrap();

    let alice_network = alice.create_private(bob_id, "inline-secret").unwrap();
    let bob_network = bob.create_private(alice_id, "inline-secret").unwrap();
    let network_id = alice_network.network_id();
    alice_network.go_online();
    bob_network.go_online();

    alice_network.begin_make_connection(bob.connection_manager().local_endpoint(), None);
    poll_until(
        || alice_network.peer(bob_id).filter(|p| p.is_online()).map(|_| ()),
        Duration::from_secs(5),
    );

    let image = vec![0xff, 0xd8, 0xff, 0xe0];
    let thumbnail = vec![1, 2, 3];
    let message_number = alice_network.send_inline_image(image.clone(), Some(thumbnail.clone())).unwrap();

    poll_until(
        || {
            bob.drain_events(network_id).into_iter().find_map(|e| match e {
                NetworkEvent::MessageReceived { message_number: n, .. } if n == message_number => Some(()),
                _ => None,
            })
        },
        Duration::from_secs(5),
    );

    let stored = bob_network.message_store().read(message_number).unwrap();
    assert_eq!(stored.message_type, MessageType::InlineImage);
    assert_eq!(stored.payload, image);
    assert_eq!(stored.thumbnail, Some(thumbnail));
}

/// S2: rotating a network's shared secret onto one that
/// collides with an already-hosted network is rejected, and the network's
/// own identity is left unchanged.
#[test]
fn s2_shared_secret_collision_is_rejected() {
    let directory = Directory::new();
    let alice_id = uid(1);
    let folder = tempdir::TempDir::new("mesh-s2").unwrap();
    let alice = service(alice_id, folder.path(), &directory);

    let network_a = alice.create_group("book-club".into(), "secret-a").unwrap();
    let network_b = alice.create_group("book-club".into(), "secret-b").unwrap();
    let original_id = network_b.network_id();

    let err = network_b.change_shared_secret("secret-a".into()).unwrap_err();
    assert!(err.to_string().contains("same network id already exists"));
    assert_eq!(network_b.network_id(), original_id);
    assert_ne!(network_b.network_id(), network_a.network_id());
}

/// Property 3: persisting a Group network's state and restoring it on a
/// fresh `MeshNetworkService` reproduces every observable field, including
/// the known-peer roster built up purely from a completed handshake (no
/// `Profile` packet exchanged).
#[test]
fn snapshot_round_trip_restores_options_and_known_peers() {
    let directory = Directory::new();
    let alice_id = uid(50);
    let bob_id = uid(51);
    let folder = tempdir::TempDir::new("mesh-snapshot").unwrap();

    let alice = service(alice_id, folder.path(), &directory);
    let network = alice.create_group("archivists".into(), "snap-secret").unwrap();
    network.set_local_network_only(true);
    network.set_group_locked(true);
    network.set_group_image(b"logo-bytes".to_vec());

    // Join Bob in without ever exchanging a `Profile` packet, so the
    // restored peer's display name is expected to come back empty.
    let (client, server) = tcp_pair();
    let channel: Box<dyn SecureChannel> = Box::new(InMemorySecureChannel::new(server, bob_id, false, "mesh-test-cipher".into()));
    let connection = AcceptedConnection::new(Endpoint::new(client.local_addr().unwrap()), false);
    network.join(channel, &connection).unwrap();

    let network_id = network.network_id();
    alice.persist_network(network_id).unwrap();

    let directory2 = Directory::new();
    let alice2 = service(alice_id, folder.path(), &directory2);
    let restored = alice2.restore_networks().unwrap();
    assert_eq!(restored.len(), 1);
    let restored = &restored[0];

    assert_eq!(restored.network_id(), network_id);
    assert_eq!(restored.shared_secret(), "snap-secret");
    assert_eq!(restored.status(), mesh_types::NetworkStatus::Offline);
    let options = restored.options();
    assert!(options.local_network_only);
    assert!(options.group_locked);
    assert_eq!(options.group_image, b"logo-bytes".to_vec());

    let restored_bob = restored.peer(bob_id).expect("bob should be a known peer after restore");
    assert!(!restored_bob.is_online());
    assert_eq!(restored_bob.profile().display_name, "");
}

/// S6: with `localNetworkOnly` enabled, a dial to a loopback
/// endpoint (not RFC 1918, not link-local) never leaves the gate -- no
/// worker is even spawned, so the remote side never sees a connection.
#[test]
fn s6_local_network_only_blocks_non_lan_dial() {
    let directory = Directory::new();
    let alice_id = uid(10);
    let bob_id = uid(11);

    let alice_folder = tempdir::TempDir::new("mesh-s6-alice").unwrap();
    let bob_folder = tempdir::TempDir::new("mesh-s6-bob").unwrap();
    let alice = service(alice_id, alice_folder.path(), &directory);
    let bob = service(bob_id, bob_folder.path(), &directory);
    let bob_endpoint = bob.connection_manager().local_endpoint();
    bob.start_listening().unwrap();

    let kind = NetworkKind::Private { other_user_id: bob_id };
    let identity = NetworkIdentity::derive("", &kind, alice_id);
    let store_id = format!("{:x}", identity.network_id);
    let message_store = Arc::new(MessageStore::open(alice_folder.path(), &store_id, identity.network_secret.as_fixed_bytes()).unwrap());
    let events: Arc<EventBus<NetworkEvent>> = Arc::new(EventBus::new());
    let peer_events: Arc<EventBus<mesh_network::PeerEvent>> = Arc::new(EventBus::new());
    let node: Arc<dyn Node> = alice.clone();
    let connection_manager = alice.connection_manager() as Arc<dyn ConnectionManager>;
    let workers = Arc::new(WorkerPool::new("mesh-s6-dial", 2));

    let options = NetworkOptions {
        local_network_only: true,
        ..NetworkOptions::default()
    };
    let alice_network = Network::new(
        identity.network_id,
        identity.network_secret,
        kind,
        alice_id,
        String::new(),
        options,
        message_store,
        connection_manager,
        node,
        workers,
        events.sender(),
        peer_events.sender(),
    );
    alice_network.send_message(MessageType::TextMessage, b"hi".to_vec()).unwrap();
    alice_network.go_online();

    alice_network.begin_make_connection(bob_endpoint, None);

    std::thread::sleep(Duration::from_millis(150));
    assert!(bob.network(alice_network.network_id()).is_none());
}

/// S5: re-delivery on (re)join walks the log newest-to-oldest,
/// resends every contiguous self-authored, still-undelivered `TextMessage`,
/// and stops at the first entry that is already delivered.
#[test]
fn s5_redelivery_resends_oldest_first_and_stops_at_first_delivered() {
    let directory = Directory::new();
    let alice_id = uid(20);
    let bob_id = uid(21);
    let folder = tempdir::TempDir::new("mesh-s5").unwrap();
    let alice = service(alice_id, folder.path(), &directory);

    let alice_network = alice.create_private(bob_id, "s5-secret").unwrap();
    for text in ["one", "two", "three"] {
        alice_network.send_message(MessageType::TextMessage, text.as_bytes().to_vec()).unwrap();
    }

    // First join: every one of the three entries is undelivered, so all
    // three are resent, oldest first.
    let (mut client1, server1) = tcp_pair();
    client1.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let channel1: Box<dyn SecureChannel> = Box::new(InMemorySecureChannel::new(server1, bob_id, false, "mesh-test-cipher".into()));
    let connection1 = AcceptedConnection::new(Endpoint::new(client1.local_addr().unwrap()), false);
    let _session1 = alice_network.join(channel1, &connection1).unwrap();

    let mut messages = Vec::new();
    loop {
        let (port, payload) = read_frame(&mut client1).unwrap();
        assert_eq!(port, CONTROL_PORT);
        if let ControlPacket::Message { message_number, payload, .. } = ControlPacket::decode(&payload).unwrap() {
            messages.push((message_number, payload));
            if messages.len() == 3 {
                break;
            }
        }
    }
    assert_eq!(
        messages,
        vec![(0, b"one".to_vec()), (1, b"two".to_vec()), (2, b"three".to_vec())]
    );

    // Bob acks message 1 out of band; Alice marks it delivered. Wait for
    // the delivered event so the store rewrite is guaranteed to have
    // landed before the second join reads it back.
    write_frame(&mut client1, CONTROL_PORT, &ControlPacket::MessageDeliveryNotification { message_number: 1 }.encode()).unwrap();
    let network_id = alice_network.network_id();
    poll_until(
        || {
            alice.drain_events(network_id).into_iter().find_map(|e| match e {
                NetworkEvent::MessageDelivered { message_number: 1, .. } => Some(()),
                _ => None,
            })
        },
        Duration::from_secs(5),
    );

    // Second join (a fresh session, as on reconnect): messages 0 and 1 must
    // not be resent (1 is delivered, and the contiguous walk stops there
    // before ever reaching 0); only message 2 is resent.
    let (mut client2, server2) = tcp_pair();
    client2.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let channel2: Box<dyn SecureChannel> = Box::new(InMemorySecureChannel::new(server2, bob_id, false, "mesh-test-cipher".into()));
    let connection2 = AcceptedConnection::new(Endpoint::new(client2.local_addr().unwrap()), false);
    let _session2 = alice_network.join(channel2, &connection2).unwrap();

    let resent = poll_until(
        || loop {
            let (port, payload) = read_frame(&mut client2).ok()?;
            if port != CONTROL_PORT {
                continue;
            }
            if let ControlPacket::Message { message_number, payload, .. } = ControlPacket::decode(&payload).ok()? {
                return Some((message_number, payload));
            }
        },
        Duration::from_secs(5),
    );
    assert_eq!(resent, (2, b"three".to_vec()));
}

/// S3: a partially connected group converges to a full mesh
/// through peer exchange alone, without any discovery service. Alice dials
/// Bob directly; Bob separately dials Carol directly. Because Bob is the
/// one who dialled Carol, his very next peer-exchange broadcast to Alice
/// carries Carol's real listening endpoint, so Alice auto-connects to her
/// too -- all three end up reporting `FullMeshNetwork` for both their
/// peers.
#[test]
fn s3_peer_exchange_converges_to_full_mesh() {
    let directory = Directory::new();
    let alice_id = uid(30);
    let bob_id = uid(31);
    let carol_id = uid(32);

    let alice_folder = tempdir::TempDir::new("mesh-s3-alice").unwrap();
    let bob_folder = tempdir::TempDir::new("mesh-s3-bob").unwrap();
    let carol_folder = tempdir::TempDir::new("mesh-s3-carol").unwrap();
    let alice = service(alice_id, alice_folder.path(), &directory);
    let bob = service(bob_id, bob_folder.path(), &directory);
    let carol = service(carol_id, carol_folder.path(), &directory);
    bob.start_listening().unwrap();
    carol.start_listening().unwrap();

    let alice_network = alice.create_group("trio".into(), "s3-secret").unwrap();
    let bob_network = bob.create_group("trio".into(), "s3-secret").unwrap();
    let carol_network = carol.create_group("trio".into(), "s3-secret").unwrap();
    let network_id = alice_network.network_id();
    assert_eq!(network_id, bob_network.network_id());
    assert_eq!(network_id, carol_network.network_id());
    alice_network.go_online();
    bob_network.go_online();
    carol_network.go_online();

    // Alice dials Bob directly.
    alice_network.begin_make_connection(bob.connection_manager().local_endpoint(), None);
    poll_until(
        || alice_network.peer(bob_id).filter(|p| p.is_online()).map(|_| ()),
        Duration::from_secs(5),
    );

    // Bob dials Carol directly; Bob is the client here, so his record of
    // Carol's endpoint really is where she listens.
    bob_network.begin_make_connection(carol.connection_manager().local_endpoint(), None);
    poll_until(
        || bob_network.peer(carol_id).filter(|p| p.is_online()).map(|_| ()),
        Duration::from_secs(5),
    );

    // Bob's broadcast carries Carol's endpoint to Alice; she auto-dials
    // without being told to.
    poll_until(
        || alice_network.peer(carol_id).filter(|p| p.is_online()).map(|_| ()),
        Duration::from_secs(5),
    );

    let is_full_mesh = |network: &Arc<Network>, peer_id: UserId| {
        network.peer(peer_id).map(|p| p.connectivity_status()) == Some(ConnectivityStatus::FullMeshNetwork)
    };
    poll_until(
        || {
            let converged = is_full_mesh(&alice_network, bob_id)
                && is_full_mesh(&alice_network, carol_id)
                && is_full_mesh(&bob_network, alice_id)
                && is_full_mesh(&bob_network, carol_id)
                && is_full_mesh(&carol_network, alice_id)
                && is_full_mesh(&carol_network, bob_id);
            if converged {
                Some(())
            } else {
                None
            }
        },
        Duration::from_secs(5),
    );
}

/// S4: sender holds a 10 MiB file; receiver already has 4 MiB
/// of it on disk. `ReceiveFileAttachment` must ask for bytes starting at
/// the receiver's current file length and copy exactly the remaining 6
/// MiB, landing a byte-identical file.
#[test]
fn s4_file_attachment_resumes_from_receivers_current_length() {
    let directory = Directory::new();
    let alice_id = uid(40);
    let bob_id = uid(41);

    let alice_folder = tempdir::TempDir::new("mesh-s4-alice").unwrap();
    let bob_folder = tempdir::TempDir::new("mesh-s4-bob").unwrap();
    let alice = service(alice_id, alice_folder.path(), &directory);
    let bob = service(bob_id, bob_folder.path(), &directory);
    bob.start_listening().unwrap();

    let alice_network = alice.create_private(bob_id, "s4-secret").unwrap();
    let bob_network = bob.create_private(alice_id, "s4-secret").unwrap();
    let network_id = alice_network.network_id();
    assert_eq!(network_id, bob_network.network_id());
    alice_network.go_online();
    bob_network.go_online();

    let full_content: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let source_path = alice_folder.path().join("source.bin");
    std::fs::write(&source_path, &full_content).unwrap();

    let dest_path = bob_folder.path().join("dest.bin");
    std::fs::write(&dest_path, &full_content[..4 * 1024 * 1024]).unwrap();

    alice_network.begin_make_connection(bob.connection_manager().local_endpoint(), None);
    poll_until(
        || alice_network.peer(bob_id).filter(|p| p.is_online()).map(|_| ()),
        Duration::from_secs(5),
    );

    let message_number = alice_network.send_file_attachment(&source_path).unwrap();
    poll_until(
        || {
            bob.drain_events(network_id).into_iter().find_map(|e| match e {
                NetworkEvent::MessageReceived { message_number: n, .. } if n == message_number => Some(()),
                _ => None,
            })
        },
        Duration::from_secs(5),
    );

    let copied = bob_network.receive_file_attachment(alice_id, message_number, &dest_path).unwrap();
    assert_eq!(copied, 6 * 1024 * 1024);
    assert_eq!(std::fs::read(&dest_path).unwrap(), full_content);
}
