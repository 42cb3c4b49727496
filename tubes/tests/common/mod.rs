#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    io::{self, Error, ErrorKind},
    path::Path,
    rc::{Rc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixListener,
    sync::oneshot,
};
use tubes::{
    Conversation, GroupMembership, LocalAddress, MemoryNetwork, MessagingSession, Participant, TubeEvent, TubeEvents,
    TubesConfig,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

pub fn config(dir: &Path) -> TubesConfig {
    TubesConfig {
        socket_dir: Some(dir.to_path_buf()),
        ..TubesConfig::new()
    }
}

pub fn alice() -> Participant {
    Participant::new("alice@example.org")
}

pub fn bob() -> Participant {
    Participant::new("bob@example.org")
}

pub fn carol() -> Participant {
    Participant::new("carol@example.org")
}

/// Waits for the next event, failing the test if none comes.
pub async fn next_event(events: &mut TubeEvents) -> TubeEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skips events until one matches.
pub async fn wait_for<F: Fn(&TubeEvent) -> bool>(events: &mut TubeEvents, matches: F) -> TubeEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Gives spawned tasks time to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Returns the events queued so far.
pub fn drain(events: &mut TubeEvents) -> Vec<TubeEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

/// Starts a Unix socket service that echoes back everything it reads.
pub fn spawn_echo(dir: &Path) -> LocalAddress {
    let path = dir.join("echo.sock");
    let listener = UnixListener::bind(&path).unwrap();

    tokio::task::spawn_local(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            tokio::task::spawn_local(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    LocalAddress::Unix(path)
}

/// A two-party messaging session that hands requests straight to the other conversation.
pub struct PeerSession {
    me: Participant,
    peer: RefCell<Weak<Conversation>>,
    pub failing: Cell<bool>,
}

impl PeerSession {
    pub fn new(me: Participant) -> Rc<Self> {
        Rc::new(Self {
            me,
            peer: RefCell::new(Weak::new()),
            failing: Cell::new(false),
        })
    }

    pub fn connect(&self, peer: &Rc<Conversation>) {
        *self.peer.borrow_mut() = Rc::downgrade(peer);
    }
}

#[async_trait(?Send)]
impl MessagingSession for PeerSession {
    async fn send_request(&self, payload: Vec<u8>) -> io::Result<Vec<u8>> {
        if self.failing.get() {
            return Err(Error::new(ErrorKind::BrokenPipe, "session is down"));
        }

        let peer = self.peer.borrow().upgrade().ok_or_else(|| Error::new(ErrorKind::NotConnected, "no peer"))?;
        let (sender, receiver) = oneshot::channel();
        peer.handle_request(&self.me, &payload, sender);
        drop(peer);

        receiver.await.map_err(|_| Error::new(ErrorKind::ConnectionAborted, "request dropped"))
    }

    async fn send_broadcast(&self, _payload: Vec<u8>) -> io::Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "not a group"))
    }
}

/// One side of a two-party conversation.
pub struct Side {
    pub conversation: Rc<Conversation>,
    pub events: TubeEvents,
    pub session: Rc<PeerSession>,
}

/// Creates alice's and bob's sides of a two-party conversation over an in-memory network.
pub fn two_party(config: TubesConfig) -> (Side, Side) {
    let network = MemoryNetwork::new();
    let make = |me: Participant, peer: Participant| {
        let session = PeerSession::new(me.clone());
        let connector = Rc::new(network.connector(&me));
        let (conversation, events) = Conversation::two_party(config.clone(), me.clone(), peer, &session, connector);
        let conversation = Rc::new(conversation);
        network.serve(&me, conversation.bytestream_sink());
        Side {
            conversation,
            events,
            session,
        }
    };

    let a = make(alice(), bob());
    let b = make(bob(), alice());
    a.session.connect(&b.conversation);
    b.session.connect(&a.conversation);
    (a, b)
}

/// A group: delivers broadcasts to every other member and tracks who's in.
#[derive(Default)]
pub struct GroupHub {
    members: RefCell<BTreeMap<Participant, Weak<Conversation>>>,
    pub failing: Cell<bool>,
}

impl GroupHub {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn others(&self, me: &Participant) -> Vec<Rc<Conversation>> {
        self.members
            .borrow()
            .iter()
            .filter(|(participant, _)| *participant != me)
            .filter_map(|(_, conversation)| conversation.upgrade())
            .collect()
    }

    /// Adds a member, telling the others about it.
    pub fn join(&self, participant: &Participant, conversation: &Rc<Conversation>) {
        self.members.borrow_mut().insert(participant.clone(), Rc::downgrade(conversation));
        for other in self.others(participant) {
            other.member_joined(participant);
        }
    }

    /// Removes a member, telling the others about it.
    pub fn leave(&self, participant: &Participant) {
        self.members.borrow_mut().remove(participant);
        for other in self.others(participant) {
            other.member_left(participant);
        }
    }
}

impl GroupMembership for GroupHub {
    fn current_members(&self) -> Vec<Participant> {
        self.members.borrow().keys().cloned().collect()
    }
}

pub struct GroupSession {
    me: Participant,
    hub: Rc<GroupHub>,
}

#[async_trait(?Send)]
impl MessagingSession for GroupSession {
    async fn send_request(&self, _payload: Vec<u8>) -> io::Result<Vec<u8>> {
        Err(Error::new(ErrorKind::Unsupported, "not a two-party conversation"))
    }

    async fn send_broadcast(&self, payload: Vec<u8>) -> io::Result<()> {
        if self.hub.failing.get() {
            return Err(Error::new(ErrorKind::BrokenPipe, "session is down"));
        }

        for other in self.hub.others(&self.me) {
            other.handle_broadcast(&self.me, &payload);
        }

        Ok(())
    }
}

/// A member of a group conversation.
pub struct Member {
    pub participant: Participant,
    pub conversation: Rc<Conversation>,
    pub events: TubeEvents,
    session: Rc<GroupSession>,
}

pub fn group_member(hub: &Rc<GroupHub>, network: &MemoryNetwork, config: TubesConfig, me: Participant) -> Member {
    let session = Rc::new(GroupSession {
        me: me.clone(),
        hub: Rc::clone(hub),
    });

    let connector = Rc::new(network.connector(&me));
    let (conversation, events) = Conversation::group(config, me.clone(), &session, hub, connector);
    let conversation = Rc::new(conversation);
    network.serve(&me, conversation.bytestream_sink());
    hub.join(&me, &conversation);

    Member {
        participant: me,
        conversation,
        events,
        session,
    }
}
