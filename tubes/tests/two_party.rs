use std::rc::Rc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::oneshot,
    task::LocalSet,
};
use tubes::{
    bus_name_for, Blob, BusMessage, CloseReason, Error, LocalAddress, LocalStream, Parameters, SocketAccess, SocketFamily,
    TubeError, TubeEvent, TubeKind, TubeState,
};
use tubes_proto::{
    messages::{RejectReason, TubeOffer, TubeReply, TubeRequest},
    serialize::{from_bytes, to_bytes, ByteRead, ByteWrite},
};

mod common;

use common::*;

fn parameters() -> Parameters {
    Parameters::from([(String::from("greeting"), String::from("hello"))])
}

#[tokio::test]
async fn test_stream_tube_round_trip() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (mut alice, mut bob) = two_party(config(dir.path()));
            let echo = spawn_echo(dir.path());

            let id = alice.conversation.offer_stream_tube("x-echo", parameters(), echo).unwrap();
            assert_eq!(alice.conversation.tube(id).unwrap().state, TubeState::RemotePending);

            let TubeEvent::NewTube(info) = next_event(&mut bob.events).await else {
                panic!("expected a new tube");
            };
            assert_eq!(info.id, id);
            assert_eq!(info.kind, TubeKind::Stream);
            assert_eq!(info.state, TubeState::LocalPending);
            assert_eq!(info.initiator, common::alice());
            assert_eq!(info.service, "x-echo");
            assert_eq!(info.parameters, parameters());

            let address = bob
                .conversation
                .accept_tube(id, SocketFamily::Unix, SocketAccess::Localhost)
                .unwrap();
            assert_eq!(bob.conversation.local_address(id), Some(address.clone()));
            assert_eq!(next_event(&mut bob.events).await, TubeEvent::Opened(id));
            assert_eq!(next_event(&mut alice.events).await, TubeEvent::Opened(id));

            let (mut reader, mut writer) = LocalStream::connect(&address).await.unwrap().into_split();
            writer.write_all(b"through the tube").await.unwrap();
            let mut buf = [0u8; 16];
            reader.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"through the tube");

            assert!(matches!(next_event(&mut bob.events).await, TubeEvent::NewConnection { id: i, .. } if i == id));
            assert!(matches!(next_event(&mut alice.events).await, TubeEvent::NewConnection { id: i, .. } if i == id));

            settle().await;
            assert!(drain(&mut alice.events).is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_malformed_offer_is_rejected_without_events() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (_alice, mut bob) = two_party(config(dir.path()));

            let offer = TubeRequest::Offer(TubeOffer {
                tube_id: tubes::TubeId(7),
                kind: TubeKind::Bus,
                service: String::from("x-test"),
                parameters: Parameters::new(),
                bytestream_address: "127.0.0.1:1".parse().unwrap(),
            });

            // Type byte, then the tube id, then the kind.
            let mut payload = to_bytes(&offer).unwrap();
            payload[5] = 9;

            let (sender, receiver) = oneshot::channel();
            bob.conversation.handle_request(&common::alice(), &payload, sender);
            let reply: TubeReply = from_bytes(&receiver.await.unwrap()).unwrap();
            assert_eq!(reply.result.unwrap_err().reason, RejectReason::Malformed);

            let (sender, receiver) = oneshot::channel();
            bob.conversation.handle_request(&common::alice(), &[0, 1, 2], sender);
            let reply: TubeReply = from_bytes(&receiver.await.unwrap()).unwrap();
            assert_eq!(reply.result.unwrap_err().reason, RejectReason::Malformed);

            settle().await;
            assert!(bob.conversation.list_tubes().is_empty());
            assert!(drain(&mut bob.events).is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_declined_offer() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (mut alice, mut bob) = two_party(config(dir.path()));

            let id = alice.conversation.offer_bus_tube("x-chat", Parameters::new()).unwrap();
            next_event(&mut bob.events).await;
            bob.conversation.close_tube(id).unwrap();

            assert_eq!(
                next_event(&mut bob.events).await,
                TubeEvent::Closed {
                    id,
                    reason: CloseReason::Local
                }
            );
            assert!(matches!(
                next_event(&mut alice.events).await,
                TubeEvent::Closed { id: i, reason: CloseReason::NegotiationFailed(_) } if i == id
            ));
            assert!(alice.conversation.list_tubes().is_empty());
            assert!(bob.conversation.list_tubes().is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_send_failure_closes_tube_once() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (mut alice, mut bob) = two_party(config(dir.path()));
            alice.session.failing.set(true);

            let id = alice.conversation.offer_bus_tube("x-chat", Parameters::new()).unwrap();
            assert!(matches!(
                next_event(&mut alice.events).await,
                TubeEvent::Closed { id: i, reason: CloseReason::NegotiationFailed(_) } if i == id
            ));

            settle().await;
            assert!(drain(&mut alice.events).is_empty());
            assert!(drain(&mut bob.events).is_empty());
            assert!(alice.conversation.tube(id).is_none());
        })
        .await;
}

#[tokio::test]
async fn test_invalid_accepts_change_nothing() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (alice, mut bob) = two_party(config(dir.path()));

            let id = alice
                .conversation
                .offer_stream_tube("x-echo", Parameters::new(), LocalAddress::Tcp("127.0.0.1:7".parse().unwrap()))
                .unwrap();

            let remote = alice
                .conversation
                .offer_stream_tube("x-echo", Parameters::new(), LocalAddress::Tcp("192.0.2.1:7".parse().unwrap()));
            assert!(matches!(remote, Err(Error::NotLocal(_))));

            assert!(matches!(
                alice.conversation.accept_tube(id, SocketFamily::Ipv4, SocketAccess::Localhost),
                Err(Error::Tube(TubeError::InvalidState { .. }))
            ));

            next_event(&mut bob.events).await;
            assert!(matches!(
                bob.conversation.accept_tube(id, SocketFamily::Unix, SocketAccess::Port(4000)),
                Err(Error::UnsupportedSocket { .. })
            ));
            assert_eq!(bob.conversation.tube(id).unwrap().state, TubeState::LocalPending);

            let unknown = tubes::TubeId(id.0.wrapping_add(1));
            assert!(matches!(
                bob.conversation.accept_tube(unknown, SocketFamily::Ipv4, SocketAccess::Localhost),
                Err(Error::Tube(TubeError::UnknownTube(_)))
            ));

            let address = bob
                .conversation
                .accept_tube(id, SocketFamily::Ipv4, SocketAccess::Localhost)
                .unwrap();
            assert!(matches!(address, LocalAddress::Tcp(address) if address.ip().is_loopback()));
        })
        .await;
}

#[tokio::test]
async fn test_close_terminates_connections() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (mut alice, mut bob) = two_party(config(dir.path()));
            let echo = spawn_echo(dir.path());

            let id = alice.conversation.offer_stream_tube("x-echo", Parameters::new(), echo).unwrap();
            next_event(&mut bob.events).await;
            let address = bob
                .conversation
                .accept_tube(id, SocketFamily::Unix, SocketAccess::Localhost)
                .unwrap();

            let (mut reader, mut writer) = LocalStream::connect(&address).await.unwrap().into_split();
            writer.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).await.unwrap();

            alice.conversation.close_tube(id).unwrap();
            wait_for(&mut alice.events, |event| matches!(event, TubeEvent::Closed { .. })).await;

            let closed = wait_for(&mut bob.events, |event| matches!(event, TubeEvent::Closed { .. })).await;
            assert_eq!(
                closed,
                TubeEvent::Closed {
                    id,
                    reason: CloseReason::Remote
                }
            );

            let mut rest = Vec::new();
            let read = tokio::time::timeout(std::time::Duration::from_secs(5), reader.read_to_end(&mut rest)).await;
            assert!(read.is_ok());

            settle().await;
            let LocalAddress::Unix(path) = address else {
                panic!("expected a unix socket");
            };
            assert!(!path.exists());
        })
        .await;
}

#[tokio::test]
async fn test_dropping_the_conversation_closes_everything() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (alice, mut bob) = two_party(config(dir.path()));

            let first = alice.conversation.offer_bus_tube("x-chat", Parameters::new()).unwrap();
            let second = alice.conversation.offer_bus_tube("x-chat", Parameters::new()).unwrap();
            wait_for(&mut bob.events, |event| matches!(event, TubeEvent::NewTube(info) if info.id == second)).await;

            let mut events = bob.events;
            drop(bob.conversation);

            let mut closed = Vec::new();
            for _ in 0..2 {
                match next_event(&mut events).await {
                    TubeEvent::Closed {
                        id,
                        reason: CloseReason::ContextClosed,
                    } => closed.push(id),
                    other => panic!("unexpected event {other:?}"),
                }
            }

            closed.sort();
            let mut expected = vec![first, second];
            expected.sort();
            assert_eq!(closed, expected);

            // The pending offers die with the replies they were waiting for.
            let mut alice_events = alice.events;
            for _ in 0..2 {
                assert!(matches!(
                    next_event(&mut alice_events).await,
                    TubeEvent::Closed {
                        reason: CloseReason::NegotiationFailed(_),
                        ..
                    }
                ));
            }
        })
        .await;
}

#[tokio::test]
async fn test_bus_tube_messages() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (mut alice, mut bob) = two_party(config(dir.path()));

            let id = alice.conversation.offer_bus_tube("x-chat", Parameters::new()).unwrap();
            next_event(&mut bob.events).await;
            let bob_address = bob
                .conversation
                .accept_tube(id, SocketFamily::Unix, SocketAccess::Localhost)
                .unwrap();

            assert_eq!(next_event(&mut alice.events).await, TubeEvent::Opened(id));
            let alice_address = alice.conversation.local_address(id).unwrap();

            let participants = bob.conversation.bus_participants(id).unwrap();
            assert_eq!(participants.get(&common::alice()), Some(&bus_name_for(&common::alice())));
            assert_eq!(participants.get(&common::bob()), Some(&bus_name_for(&common::bob())));

            let (mut alice_reader, mut alice_writer) = LocalStream::connect(&alice_address).await.unwrap().into_split();
            let (mut bob_reader, mut bob_writer) = LocalStream::connect(&bob_address).await.unwrap().into_split();
            settle().await;

            BusMessage {
                sender: String::from("whoever"),
                destination: None,
                body: Blob(b"hello alice".to_vec()),
            }
            .write(&mut bob_writer)
            .await
            .unwrap();

            let received = BusMessage::read(&mut alice_reader).await.unwrap();
            assert_eq!(received.sender, bus_name_for(&common::bob()));
            assert_eq!(received.body, Blob(b"hello alice".to_vec()));

            BusMessage {
                sender: String::new(),
                destination: Some(received.sender),
                body: Blob(b"hello bob".to_vec()),
            }
            .write(&mut alice_writer)
            .await
            .unwrap();

            let received = BusMessage::read(&mut bob_reader).await.unwrap();
            assert_eq!(received.sender, bus_name_for(&common::alice()));
            assert_eq!(received.destination, Some(bus_name_for(&common::bob())));
            assert_eq!(received.body, Blob(b"hello bob".to_vec()));
        })
        .await;
}

#[tokio::test]
async fn test_quic_stream_tube() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let echo = spawn_echo(dir.path());

            let alice_quic = Rc::new(tubes::QuicBytestreams::bind("127.0.0.1:0".parse().unwrap()).unwrap());
            let bob_quic = Rc::new(tubes::QuicBytestreams::bind("127.0.0.1:0".parse().unwrap()).unwrap());

            let alice_session = PeerSession::new(common::alice());
            let bob_session = PeerSession::new(common::bob());

            let (alice, mut alice_events) = tubes::Conversation::two_party(
                config(dir.path()),
                common::alice(),
                common::bob(),
                &alice_session,
                alice_quic.clone(),
            );
            let (bob, mut bob_events) = tubes::Conversation::two_party(
                config(dir.path()),
                common::bob(),
                common::alice(),
                &bob_session,
                bob_quic.clone(),
            );

            let (alice, bob) = (Rc::new(alice), Rc::new(bob));
            alice_session.connect(&bob);
            bob_session.connect(&alice);
            alice_quic.serve(alice.bytestream_sink());
            bob_quic.serve(bob.bytestream_sink());

            let id = alice.offer_stream_tube("x-echo", Parameters::new(), echo).unwrap();
            next_event(&mut bob_events).await;
            let address = bob.accept_tube(id, SocketFamily::Ipv4, SocketAccess::Localhost).unwrap();
            assert_eq!(next_event(&mut alice_events).await, TubeEvent::Opened(id));

            let (mut reader, mut writer) = LocalStream::connect(&address).await.unwrap().into_split();
            writer.write_all(b"over quic").await.unwrap();
            let mut buf = [0u8; 9];
            reader.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"over quic");

            alice_quic.close();
            bob_quic.close();
        })
        .await;
}

#[tokio::test]
async fn test_unbindable_bus_relay_fails_the_offer() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (mut alice, mut bob) = two_party(config(&dir.path().join("missing")));

            let offered = alice.conversation.offer_bus_tube("x-chat", Parameters::new());
            assert!(matches!(offered, Err(Error::Io(_))));
            assert!(alice.conversation.list_tubes().is_empty());

            settle().await;
            assert!(drain(&mut alice.events).is_empty());
            assert!(drain(&mut bob.events).is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_closed_conversation_refuses_new_tubes() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (_alice, mut bob) = two_party(config(dir.path()));
            bob.conversation.close();

            let offer = TubeRequest::Offer(TubeOffer {
                tube_id: tubes::TubeId(7),
                kind: TubeKind::Stream,
                service: String::from("x-echo"),
                parameters: Parameters::new(),
                bytestream_address: "127.0.0.1:1".parse().unwrap(),
            });

            let (sender, receiver) = oneshot::channel();
            bob.conversation.handle_request(&common::alice(), &to_bytes(&offer).unwrap(), sender);
            let reply: TubeReply = from_bytes(&receiver.await.unwrap()).unwrap();
            assert_eq!(reply.result.unwrap_err().reason, RejectReason::Declined);

            assert!(matches!(
                bob.conversation.accept_tube(tubes::TubeId(7), SocketFamily::Unix, SocketAccess::Localhost),
                Err(Error::Closed)
            ));
            assert!(matches!(
                bob.conversation.offer_stream_tube("x-echo", Parameters::new(), spawn_echo(dir.path())),
                Err(Error::Closed)
            ));

            settle().await;
            assert!(bob.conversation.list_tubes().is_empty());
            assert!(drain(&mut bob.events).is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_refused_bytestream_is_not_a_connection() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let (mut alice, mut bob) = two_party(config(dir.path()));
            let echo = spawn_echo(dir.path());

            let id = alice.conversation.offer_stream_tube("x-echo", Parameters::new(), echo).unwrap();
            next_event(&mut bob.events).await;
            let address = bob
                .conversation
                .accept_tube(id, SocketFamily::Unix, SocketAccess::Localhost)
                .unwrap();
            assert_eq!(next_event(&mut bob.events).await, TubeEvent::Opened(id));
            assert_eq!(next_event(&mut alice.events).await, TubeEvent::Opened(id));

            // Bob never hears about the close, so his side stays open.
            alice.session.failing.set(true);
            alice.conversation.close_tube(id).unwrap();
            assert!(matches!(next_event(&mut alice.events).await, TubeEvent::Closed { id: i, .. } if i == id));

            let (mut reader, _writer) = LocalStream::connect(&address).await.unwrap().into_split();
            let mut rest = Vec::new();
            let read = tokio::time::timeout(std::time::Duration::from_secs(5), reader.read_to_end(&mut rest)).await;
            assert!(matches!(read, Ok(Ok(0))));

            settle().await;
            assert!(drain(&mut bob.events).is_empty());
            assert_eq!(bob.conversation.tube(id).unwrap().state, TubeState::Open);
        })
        .await;
}
