//! The local relay of a bus tube.
//!
//! Applications connect to the relay's local socket and exchange [`BusMessage`]s with it. The
//! relay stamps outgoing messages with our bus name and routes them by destination: to another
//! local client, to the participant owning that bus name, or to everybody. Each remote
//! participant is reached through one bytestream (a "link"), opened the first time it's
//! needed or accepted when the participant opens it first.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, ErrorKind},
    net::SocketAddr,
    rc::{Rc, Weak},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::AbortHandle,
};
use tracing::{debug, info, warn};
use tubes_proto::{
    messages::{BusMessage, Participant, StreamInitiation, TubeId},
    serialize::{ByteRead, ByteWrite},
};
use tubes_sm::{bus_name_for, TubeSet};

use crate::{
    bytestream::{Bytestream, BytestreamTarget},
    conversation::Shared,
};

use super::{initiate, spawn_connection, LocalListener, LocalStream};

/// How a relay reaches participants it has no link to yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialing {
    /// Group members are reached through the transport's knowledge of the group.
    Participant,

    /// The peer that offered us the tube listens at this address.
    Address(SocketAddr),

    /// The peer opens the link; messages for it are queued until it does.
    Wait,
}

/// A running bus relay. Dropping it stops the relay and all of its links.
pub(crate) struct BusRelay {
    handle: RelayHandle,
}

#[derive(Clone)]
pub(crate) struct RelayHandle(Rc<RefCell<RelayState>>);

struct RelayState {
    tube_id: TubeId,
    own_name: String,
    dialing: Dialing,
    clients: HashMap<u64, mpsc::UnboundedSender<BusMessage>>,
    links: HashMap<Participant, Link>,
    next_key: u64,
    tasks: Vec<AbortHandle>,
}

struct Link {
    key: u64,
    sender: mpsc::UnboundedSender<BusMessage>,

    /// Messages queued for a link nobody opened yet.
    pending: Option<mpsc::UnboundedReceiver<BusMessage>>,
    tasks: Vec<AbortHandle>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl BusRelay {
    /// Starts serving local clients on `listener`.
    pub(crate) fn start(shared: Weak<Shared>, tube_id: TubeId, own_name: String, listener: LocalListener, dialing: Dialing) -> Self {
        let state = RelayState {
            tube_id,
            own_name,
            dialing,
            clients: HashMap::new(),
            links: HashMap::new(),
            next_key: 0,
            tasks: Vec::new(),
        };

        let handle = RelayHandle(Rc::new(RefCell::new(state)));
        let task = tokio::task::spawn_local(serve_clients(handle.clone(), shared, listener));
        handle.0.borrow_mut().tasks.push(task.abort_handle());

        Self { handle }
    }

    pub(crate) fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Opens the link to `participant` now rather than when the first message for it comes.
    pub(crate) fn open_link(&self, shared: &Weak<Shared>, participant: &Participant) {
        self.handle.link_sender(shared, participant);
    }

    /// Drops the link to a participant that left the tube.
    pub(crate) fn forget(&self, participant: &Participant) {
        if self.handle.0.borrow_mut().links.remove(participant).is_some() {
            debug!(%participant, "Dropped bus link");
        }
    }
}

impl Drop for BusRelay {
    fn drop(&mut self) {
        let mut state = self.handle.0.borrow_mut();
        for task in state.tasks.drain(..) {
            task.abort();
        }

        state.links.clear();
        state.clients.clear();
    }
}

impl RelayHandle {
    fn tube_id(&self) -> TubeId {
        self.0.borrow().tube_id
    }

    fn own_name(&self) -> String {
        self.0.borrow().own_name.clone()
    }

    fn next_key(&self) -> u64 {
        let mut state = self.0.borrow_mut();
        let key = state.next_key;
        state.next_key += 1;
        key
    }

    fn add_client(&self) -> (u64, mpsc::UnboundedReceiver<BusMessage>) {
        let key = self.next_key();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.0.borrow_mut().clients.insert(key, sender);
        (key, receiver)
    }

    fn remove_client(&self, key: u64) {
        self.0.borrow_mut().clients.remove(&key);
    }

    /// Hands a message to every local client but `except`.
    fn deliver_local(&self, message: &BusMessage, except: Option<u64>) {
        let state = self.0.borrow();
        for (key, client) in &state.clients {
            if Some(*key) != except {
                let _ = client.send(message.clone());
            }
        }
    }

    /// Routes a message written by a local client.
    fn route_local(&self, shared: &Weak<Shared>, from: u64, mut message: BusMessage) {
        let own_name = self.own_name();
        message.sender = own_name.clone();

        let destination = match message.destination.as_deref() {
            Some(name) if name == own_name => {
                self.deliver_local(&message, Some(from));
                return;
            }
            destination => destination,
        };

        let participants = remote_participants(shared, self.tube_id());
        match destination {
            Some(name) => match participants.into_iter().find(|(_, bus_name)| bus_name == name) {
                Some((participant, _)) => self.send_to(shared, &participant, message),
                None => debug!(tube_id = %self.tube_id(), destination = name, "Dropping message for unknown bus name"),
            },
            None => {
                for (participant, _) in participants {
                    self.send_to(shared, &participant, message.clone());
                }

                self.deliver_local(&message, Some(from));
            }
        }
    }

    fn send_to(&self, shared: &Weak<Shared>, participant: &Participant, message: BusMessage) {
        let Some(sender) = self.link_sender(shared, participant) else {
            return;
        };

        if sender.send(message).is_err() {
            warn!(tube_id = %self.tube_id(), %participant, "Bus link is gone, dropping message");
            self.0.borrow_mut().links.remove(participant);
        }
    }

    /// Returns the channel to the link to `participant`, setting the link up if there's none.
    fn link_sender(&self, shared: &Weak<Shared>, participant: &Participant) -> Option<mpsc::UnboundedSender<BusMessage>> {
        if let Some(link) = self.0.borrow().links.get(participant) {
            return Some(link.sender.clone());
        }

        let key = self.next_key();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (tube_id, dialing) = {
            let state = self.0.borrow();
            (state.tube_id, state.dialing)
        };

        let target = match dialing {
            Dialing::Participant => BytestreamTarget::Participant(participant.clone()),
            Dialing::Address(address) => BytestreamTarget::Address(address),
            Dialing::Wait => {
                let link = Link {
                    key,
                    sender: sender.clone(),
                    pending: Some(receiver),
                    tasks: Vec::new(),
                };

                self.0.borrow_mut().links.insert(participant.clone(), link);
                return Some(sender);
            }
        };

        let conversation = shared.upgrade()?;
        let initiation = StreamInitiation {
            tube_id,
            initiator: conversation.self_handle.clone(),
            stream_id: conversation.with_tubes(TubeSet::new_stream_id),
        };

        debug!(%tube_id, %participant, %target, "Opening bus link");
        let connector = conversation.connector.clone();
        let handle = self.clone();
        let weak = shared.clone();
        let remote = participant.clone();
        let task = tokio::task::spawn_local(async move {
            match initiate(connector.as_ref(), &target, &initiation).await {
                Ok(bytestream) => handle.run_link(&weak, key, &remote, bytestream, Some(receiver)).await,
                Err(error) => {
                    warn!(%tube_id, participant = %remote, "Couldn't open bus link: {error}");
                    handle.drop_link(&remote, key);
                }
            }
        });

        let link = Link {
            key,
            sender: sender.clone(),
            pending: None,
            tasks: vec![task.abort_handle()],
        };

        self.0.borrow_mut().links.insert(participant.clone(), link);
        Some(sender)
    }

    /// Takes a link opened by a remote participant.
    pub(crate) fn attach_link(&self, shared: Weak<Shared>, participant: Participant, bytestream: Bytestream) {
        let mut state = self.0.borrow_mut();
        let key = state.next_key;
        state.next_key += 1;

        // Messages for the participant go through this bytestream unless we have a working
        // link of our own; either way, everything it sends is read.
        let outgoing = match state.links.get_mut(&participant) {
            Some(link) => link.pending.take().map(|receiver| (link.key, receiver)),
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                let link = Link {
                    key,
                    sender,
                    pending: None,
                    tasks: Vec::new(),
                };

                state.links.insert(participant.clone(), link);
                Some((key, receiver))
            }
        };

        debug!(tube_id = %state.tube_id, %participant, "Accepted bus link");
        let handle = self.clone();
        let remote = participant.clone();
        let link_key = outgoing.as_ref().map_or(key, |(key, _)| *key);
        let task = tokio::task::spawn_local(async move {
            handle
                .run_link(&shared, link_key, &remote, bytestream, outgoing.map(|(_, receiver)| receiver))
                .await;
        });

        match state.links.get_mut(&participant) {
            Some(link) if link.key == link_key => link.tasks.push(task.abort_handle()),
            _ => state.tasks.push(task.abort_handle()),
        }
    }

    fn drop_link(&self, participant: &Participant, key: u64) {
        let mut state = self.0.borrow_mut();
        if state.links.get(participant).is_some_and(|link| link.key == key) {
            // The link's own task is the one running this; it's done anyway.
            if let Some(mut link) = state.links.remove(participant) {
                link.tasks.clear();
            }
        }
    }

    /// Moves messages between a link and the relay until either side is done.
    async fn run_link(
        &self,
        shared: &Weak<Shared>,
        key: u64,
        participant: &Participant,
        bytestream: Bytestream,
        outgoing: Option<mpsc::UnboundedReceiver<BusMessage>>,
    ) {
        let Bytestream { mut reader, mut writer } = bytestream;
        let tube_id = self.tube_id();

        let result = match outgoing {
            Some(outgoing) => tokio::select! {
                result = self.read_link(shared, participant, &mut reader) => result,
                result = write_messages(outgoing, &mut writer) => result,
            },
            None => self.read_link(shared, participant, &mut reader).await,
        };

        match result {
            Ok(()) => debug!(%tube_id, %participant, "Bus link closed"),
            Err(error) => debug!(%tube_id, %participant, "Bus link failed: {error}"),
        }

        self.drop_link(participant, key);
    }

    /// Delivers the messages a participant sends us to our local clients.
    async fn read_link<R: AsyncRead + Unpin + ?Sized>(&self, shared: &Weak<Shared>, participant: &Participant, reader: &mut R) -> io::Result<()> {
        let tube_id = self.tube_id();
        let own_name = self.own_name();
        let sender_name = remote_participants(shared, tube_id)
            .into_iter()
            .find(|(p, _)| p == participant)
            .map_or_else(|| bus_name_for(participant), |(_, name)| name);

        loop {
            let mut message = match BusMessage::read(reader).await {
                Ok(message) => message,
                Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(error) => return Err(error),
            };

            match message.destination.as_deref() {
                None => {}
                Some(name) if name == own_name => {}
                Some(name) => {
                    debug!(%tube_id, %participant, destination = name, "Dropping message not addressed to us");
                    continue;
                }
            }

            message.sender = sender_name.clone();
            self.deliver_local(&message, None);
        }
    }
}

async fn write_messages<W: AsyncWrite + Unpin + ?Sized>(mut outgoing: mpsc::UnboundedReceiver<BusMessage>, writer: &mut W) -> io::Result<()> {
    while let Some(message) = outgoing.recv().await {
        message.write(writer).await?;
        writer.flush().await?;
    }

    writer.shutdown().await
}

/// The other participants of a bus tube and their bus names.
fn remote_participants(shared: &Weak<Shared>, tube_id: TubeId) -> Vec<(Participant, String)> {
    let Some(shared) = shared.upgrade() else {
        return Vec::new();
    };

    let participants = shared.with_tubes(|tubes| tubes.bus_participants(tube_id).unwrap_or_default());
    participants
        .into_iter()
        .filter(|(participant, _)| *participant != shared.self_handle)
        .collect()
}

async fn serve_clients(handle: RelayHandle, shared: Weak<Shared>, listener: LocalListener) {
    let tube_id = handle.tube_id();
    info!(%tube_id, address = ?listener.local_address().ok(), "Serving bus tube");

    loop {
        let local = match listener.accept().await {
            Ok(local) => local,
            Err(error) => {
                warn!(%tube_id, "Stopped accepting bus clients: {error}");
                return;
            }
        };

        let Some(conversation) = shared.upgrade() else {
            return;
        };

        let stream_id = conversation.with_tubes(TubeSet::new_stream_id);
        let (key, receiver) = handle.add_client();
        let client = {
            let handle = handle.clone();
            let shared = shared.clone();
            async move {
                if let Err(error) = handle.run_client(&shared, key, local, receiver).await {
                    debug!(%tube_id, "Bus client failed: {error}");
                }

                handle.remove_client(key);
            }
        };

        if let Err(error) = spawn_connection(&conversation, tube_id, stream_id, client) {
            warn!(%tube_id, "Stopped accepting bus clients: {error}");
            handle.remove_client(key);
            return;
        }
    }
}

impl RelayHandle {
    async fn run_client(
        &self,
        shared: &Weak<Shared>,
        key: u64,
        local: LocalStream,
        receiver: mpsc::UnboundedReceiver<BusMessage>,
    ) -> io::Result<()> {
        let (mut read_half, mut write_half) = local.into_split();

        let incoming = async {
            loop {
                let message = match BusMessage::read(&mut read_half).await {
                    Ok(message) => message,
                    Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                    Err(error) => return Err(error),
                };

                self.route_local(shared, key, message);
            }
        };

        tokio::select! {
            result = incoming => result,
            result = write_messages(receiver, &mut write_half) => result,
        }
    }
}
