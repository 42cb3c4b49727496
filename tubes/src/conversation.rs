//! Drives the [`TubeSet`] of one conversation: runs the negotiation protocol over the messaging
//! session, wires open tubes to local sockets, and reports [`TubeEvent`]s.
//!
//! A conversation must be used from within a [`LocalSet`](tokio::task::LocalSet), since it
//! spawns its tasks with `spawn_local`.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    io::{self, Error as IoError, ErrorKind},
    rc::{Rc, Weak},
};

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};
use tubes_proto::{
    messages::{
        Parameters, Participant, RejectReason, Rejection, StreamInitiation, TubeId, TubeKind, TubeOffer, TubeReply,
        TubeRequest, TubeSnapshot,
    },
    serialize::{from_bytes, to_bytes, ByteRead, ByteWrite},
};
use tubes_sm::{bus_name_for, Context, RosterChange, TubeError, TubeEvent, TubeInfo, TubeSet, TubeState};

use crate::{
    bridge::{
        end_deferred_connections, pump, serve_stream_listener, spawn_connection, track_task, BusRelay, Dialing,
        LocalAddress, LocalListener, LocalStream, SocketAccess, SocketFamily, TubeBridge,
    },
    bytestream::{Bytestream, BytestreamConnector, BytestreamSink, BytestreamTarget},
    session::{GroupMembership, MessagingSession},
    Error, TubesConfig,
};

/// The receiving end of a conversation's events.
pub type TubeEvents = mpsc::UnboundedReceiver<TubeEvent>;

/// The tubes of one conversation, and the handle the application operates them through.
///
/// Dropping the conversation closes all of its tubes without notifying anybody.
pub struct Conversation {
    shared: Rc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) self_handle: Participant,
    pub(crate) connector: Rc<dyn BytestreamConnector>,
    pub(crate) tubes: RefCell<TubeSet<TubeBridge>>,
    config: TubesConfig,
    is_group: bool,
    session: Weak<dyn MessagingSession>,
    membership: Option<Weak<dyn GroupMembership>>,
    events: mpsc::UnboundedSender<TubeEvent>,
    broadcast_scheduled: Cell<bool>,
    closed: Cell<bool>,

    /// Connections that ended while the tube set was borrowed.
    pub(crate) deferred_ends: RefCell<Vec<(TubeId, u64)>>,
}

impl Conversation {
    /// Creates the conversation with the single remote peer `peer`.
    pub fn two_party<S: MessagingSession + 'static>(
        config: TubesConfig,
        self_handle: Participant,
        peer: Participant,
        session: &Rc<S>,
        connector: Rc<dyn BytestreamConnector>,
    ) -> (Self, TubeEvents) {
        let session: Rc<dyn MessagingSession> = session.clone();
        Self::new(config, Context::Peer(peer), self_handle, Rc::downgrade(&session), None, connector)
    }

    /// Creates a group conversation.
    pub fn group<S, M>(
        config: TubesConfig,
        self_handle: Participant,
        session: &Rc<S>,
        membership: &Rc<M>,
        connector: Rc<dyn BytestreamConnector>,
    ) -> (Self, TubeEvents)
    where
        S: MessagingSession + 'static,
        M: GroupMembership + 'static,
    {
        let session: Rc<dyn MessagingSession> = session.clone();
        let membership: Rc<dyn GroupMembership> = membership.clone();
        Self::new(
            config,
            Context::Group,
            self_handle,
            Rc::downgrade(&session),
            Some(Rc::downgrade(&membership)),
            connector,
        )
    }

    fn new(
        config: TubesConfig,
        context: Context,
        self_handle: Participant,
        session: Weak<dyn MessagingSession>,
        membership: Option<Weak<dyn GroupMembership>>,
        connector: Rc<dyn BytestreamConnector>,
    ) -> (Self, TubeEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let is_group = context == Context::Group;
        let tubes = TubeSet::new(context, self_handle.clone(), config.id_reuse_window);

        let shared = Shared {
            self_handle,
            connector,
            tubes: RefCell::new(tubes),
            config,
            is_group,
            session,
            membership,
            events,
            broadcast_scheduled: Cell::new(false),
            closed: Cell::new(false),
            deferred_ends: RefCell::new(Vec::new()),
        };

        (Self { shared: Rc::new(shared) }, receiver)
    }

    pub fn self_handle(&self) -> &Participant {
        &self.shared.self_handle
    }

    /// The sink the bytestream transport must deliver incoming bytestreams to.
    pub fn bytestream_sink(&self) -> Rc<dyn BytestreamSink> {
        Rc::new(ConversationSink {
            shared: Rc::downgrade(&self.shared),
        })
    }

    /// Offers a stream tube. Connections remote participants make through the tube are
    /// forwarded to `service_address`, which must be a local socket.
    pub fn offer_stream_tube(&self, service: &str, parameters: Parameters, service_address: LocalAddress) -> Result<TubeId, Error> {
        service_address.check_local()?;
        let bridge = TubeBridge::offering_stream(service_address);
        self.shared.offer(TubeKind::Stream, service, parameters, bridge)
    }

    /// Offers a bus tube. Once it opens, its local relay is reachable at
    /// [`local_address`](Self::local_address).
    pub fn offer_bus_tube(&self, service: &str, parameters: Parameters) -> Result<TubeId, Error> {
        let listener = LocalListener::bind(
            self.shared.config.socket_family,
            SocketAccess::Localhost,
            &self.shared.config.socket_dir(),
            "bus",
        )?;

        self.shared.offer(TubeKind::Bus, service, parameters, TubeBridge::offering_bus(listener)?)
    }

    /// Accepts a tube offered by a remote participant, returning the address of the local
    /// socket the application connects to.
    ///
    /// The socket is bound before the tube opens, so it's ready by the time the remote side
    /// learns the tube was accepted.
    pub fn accept_tube(&self, id: TubeId, family: SocketFamily, access: SocketAccess) -> Result<LocalAddress, Error> {
        self.shared.accept(id, family, access)
    }

    /// Closes a tube, whatever its state, terminating all of its connections.
    pub fn close_tube(&self, id: TubeId) -> Result<(), Error> {
        self.shared.close_tube(id)
    }

    pub fn list_tubes(&self) -> Vec<TubeInfo> {
        self.shared.tubes.borrow().list()
    }

    pub fn tube(&self, id: TubeId) -> Option<TubeInfo> {
        self.shared.tubes.borrow().tube(id).map(|tube| tube.info())
    }

    /// Lists the participants of a bus tube and their bus names.
    pub fn bus_participants(&self, id: TubeId) -> Result<BTreeMap<Participant, String>, Error> {
        Ok(self.shared.tubes.borrow().bus_participants(id)?)
    }

    /// The local socket bound for a tube, if any.
    pub fn local_address(&self, id: TubeId) -> Option<LocalAddress> {
        let tubes = self.shared.tubes.borrow();
        tubes.tube(id)?.resources()?.local_address.clone()
    }

    /// Handles a request the remote peer sent over the messaging session. The reply is sent
    /// through `responder`, possibly much later: an offer is only answered once the
    /// application accepts or closes the tube.
    pub fn handle_request(&self, from: &Participant, payload: &[u8], responder: oneshot::Sender<Vec<u8>>) {
        self.shared.handle_request(from, payload, responder);
    }

    /// Handles a snapshot broadcast by a group member.
    pub fn handle_broadcast(&self, from: &Participant, payload: &[u8]) {
        if self.shared.closed.get() {
            debug!(participant = %from, "Ignoring tube snapshot, the conversation is closed");
            return;
        }

        let snapshot = match from_bytes::<TubeSnapshot>(payload) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(participant = %from, "Ignoring malformed tube snapshot: {error}");
                return;
            }
        };

        let is_member = self.shared.is_member(from);
        self.shared.with_tubes(|tubes| tubes.handle_snapshot(from, &snapshot, is_member));
        self.shared.after_change();
    }

    /// A member joined the group. Our tubes are announced right away so it learns about them.
    pub fn member_joined(&self, participant: &Participant) {
        debug!(%participant, "Member joined");
        if self.shared.is_group {
            self.shared.schedule_broadcast();
        }
    }

    /// A member left the group. It leaves every tube it took part in.
    pub fn member_left(&self, participant: &Participant) {
        debug!(%participant, "Member left");
        if self.shared.closed.get() {
            return;
        }

        self.shared.with_tubes(|tubes| tubes.member_left(participant));
        self.shared.after_change();
    }

    /// Closes every tube. Nobody is notified; the conversation is assumed to be over.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl Shared {
    pub(crate) fn with_tubes<T, F: FnOnce(&mut TubeSet<TubeBridge>) -> T>(&self, f: F) -> T {
        f(&mut self.tubes.borrow_mut())
    }

    fn is_member(&self, participant: &Participant) -> bool {
        self.membership
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|membership| membership.is_member(participant))
    }

    fn offer(self: &Rc<Self>, kind: TubeKind, service: &str, parameters: Parameters, bridge: TubeBridge) -> Result<TubeId, Error> {
        if self.closed.get() {
            return Err(Error::Closed);
        }

        let id = self.with_tubes(|tubes| tubes.offer(kind, service.to_owned(), parameters.clone(), bridge))?;

        if !self.is_group {
            let offer = TubeOffer {
                tube_id: id,
                kind,
                service: service.to_owned(),
                parameters,
                bytestream_address: self.connector.advertised_address(),
            };

            tokio::task::spawn_local(negotiate(Rc::downgrade(self), self.session.clone(), offer));
        }

        self.after_change();
        Ok(id)
    }

    fn accept(self: &Rc<Self>, id: TubeId, family: SocketFamily, access: SocketAccess) -> Result<LocalAddress, Error> {
        if self.closed.get() {
            return Err(Error::Closed);
        }

        let (kind, initiator, remote_address) = {
            let tubes = self.tubes.borrow();
            let tube = tubes.tube(id).ok_or(TubeError::UnknownTube(id))?;
            if tube.state() != TubeState::LocalPending {
                return Err(TubeError::InvalidState {
                    id,
                    state: tube.state(),
                    expected: "local-pending",
                }
                .into());
            }

            let remote_address = tube.resources().and_then(|bridge| bridge.remote_address);
            (tube.kind(), tube.initiator().clone(), remote_address)
        };

        let listener = LocalListener::bind(family, access, &self.config.socket_dir(), &format!("tube-{id}"))?;
        let local_address = listener.local_address()?;

        self.with_tubes(|tubes| tubes.accept(id))?;

        let weak = Rc::downgrade(self);
        let relay = match kind {
            TubeKind::Stream => {
                let target = match remote_address {
                    Some(address) => BytestreamTarget::Address(address),
                    None => BytestreamTarget::Participant(initiator),
                };

                let task = tokio::task::spawn_local(serve_stream_listener(weak, id, listener, target));
                track_task(self, id, task.abort_handle());
                None
            }
            TubeKind::Bus => {
                let own_name = bus_name_for(&self.self_handle);
                match remote_address {
                    Some(address) => {
                        let relay = BusRelay::start(weak.clone(), id, own_name, listener, Dialing::Address(address));
                        relay.open_link(&weak, &initiator);
                        Some(relay)
                    }
                    None => Some(BusRelay::start(weak, id, own_name, listener, Dialing::Participant)),
                }
            }
        };

        let responder = self.with_tubes(|tubes| {
            let tube = tubes.tube_mut(id)?;
            if tube.resources().is_none() {
                tube.set_resources(TubeBridge::default());
            }

            let bridge = tube.resources_mut()?;
            bridge.local_address = Some(local_address.clone());
            bridge.relay = relay;
            bridge.responder.take()
        });

        if let Some(responder) = responder {
            reply(responder, TubeReply::ok());
        }

        info!(tube_id = %id, address = %local_address, "Accepted tube");
        self.after_change();
        Ok(local_address)
    }

    fn close_tube(self: &Rc<Self>, id: TubeId) -> Result<(), Error> {
        let mut closed = self.with_tubes(|tubes| tubes.close(id))?;

        if !self.is_group {
            match closed.previous {
                TubeState::LocalPending => {
                    if let Some(responder) = closed.resources.as_mut().and_then(|bridge| bridge.responder.take()) {
                        reply(responder, TubeReply::rejected(RejectReason::Declined, "closed by the application"));
                    }
                }
                _ => {
                    tokio::task::spawn_local(send_close(self.session.clone(), id));
                }
            }
        }

        drop(closed);
        self.after_change();
        Ok(())
    }

    fn handle_request(self: &Rc<Self>, from: &Participant, payload: &[u8], responder: oneshot::Sender<Vec<u8>>) {
        let request = match from_bytes::<TubeRequest>(payload) {
            Ok(request) => request,
            Err(error) => {
                warn!(participant = %from, "Rejecting malformed tube request: {error}");
                reply(responder, TubeReply::rejected(RejectReason::Malformed, error.to_string()));
                return;
            }
        };

        match request {
            TubeRequest::Offer(offer) if self.closed.get() => {
                debug!(tube_id = %offer.tube_id, participant = %from, "Declining tube offer, the conversation is closed");
                reply(responder, TubeReply::rejected(RejectReason::Declined, "the conversation is closed"));
                return;
            }
            TubeRequest::Offer(offer) => {
                let remote_address = offer.bytestream_address;
                match self.with_tubes(|tubes| tubes.handle_offer(from, offer)) {
                    Ok(id) => self.with_tubes(|tubes| {
                        if let Some(tube) = tubes.tube_mut(id) {
                            tube.set_resources(TubeBridge::incoming(responder, remote_address));
                        }
                    }),
                    Err(rejection) => {
                        warn!(participant = %from, %rejection, "Rejected tube offer");
                        reply(responder, TubeReply { result: Err(rejection) });
                    }
                }
            }
            TubeRequest::Close(id) => {
                if let Err(error) = self.with_tubes(|tubes| tubes.remote_close(from, id)) {
                    debug!(tube_id = %id, participant = %from, "Ignoring close request: {error}");
                }

                reply(responder, TubeReply::ok());
            }
        }

        self.after_change();
    }

    /// Decides whether a bytestream opened by a remote participant may be attached to a tube.
    fn admit_bytestream(&self, initiation: &StreamInitiation) -> Result<TubeKind, Rejection> {
        let initiator = &initiation.initiator;
        if self.closed.get() {
            return Err(Rejection::new(RejectReason::Declined, "the conversation is closed"));
        }

        if self.is_group && !self.is_member(initiator) {
            return Err(Rejection::new(RejectReason::Declined, "not a member of the group"));
        }

        let result = self.with_tubes(|tubes| {
            tubes.bytestream_initiated(initiator, initiation.tube_id)?;
            tubes.tube(initiation.tube_id).map(|tube| tube.kind()).ok_or(TubeError::UnknownTube(initiation.tube_id))
        });

        result.map_err(|error| {
            let reason = match error {
                TubeError::UnknownTube(_) => RejectReason::UnknownTube,
                TubeError::InvalidState { .. } | TubeError::InvalidTransition { .. } => RejectReason::NotOpen,
                _ => RejectReason::Declined,
            };

            Rejection::new(reason, error.to_string())
        })
    }

    /// Reports queued events, and schedules an announcement if the tube set changed.
    pub(crate) fn after_change(self: &Rc<Self>) {
        end_deferred_connections(self);

        while let Some(event) = self.with_tubes(TubeSet::poll_event) {
            self.prepare(&event);
            let _ = self.events.send(event);
        }

        if self.with_tubes(TubeSet::take_broadcast_needed) {
            self.schedule_broadcast();
        }
    }

    /// Sets up whatever an event requires before the application hears about it.
    fn prepare(self: &Rc<Self>, event: &TubeEvent) {
        match event {
            TubeEvent::Opened(id) => self.start_relay(*id),
            TubeEvent::BusRosterChanged {
                id,
                change: RosterChange::Removed(participant),
            } => {
                let tubes = self.tubes.borrow();
                if let Some(relay) = tubes.tube(*id).and_then(|tube| tube.resources()).and_then(|bridge| bridge.relay.as_ref()) {
                    relay.forget(participant);
                }
            }
            _ => {}
        }
    }

    /// Starts the local relay of a bus tube we offered, once the tube is open.
    fn start_relay(self: &Rc<Self>, id: TubeId) {
        let listener = self.with_tubes(|tubes| {
            let bridge = tubes.tube_mut(id)?.resources_mut()?;
            match bridge.relay {
                Some(_) => None,
                None => bridge.relay_listener.take(),
            }
        });

        let Some(listener) = listener else {
            return;
        };

        let dialing = match self.is_group {
            true => Dialing::Participant,
            false => Dialing::Wait,
        };

        let relay = BusRelay::start(Rc::downgrade(self), id, bus_name_for(&self.self_handle), listener, dialing);
        self.with_tubes(|tubes| {
            if let Some(bridge) = tubes.tube_mut(id).and_then(|tube| tube.resources_mut()) {
                bridge.relay = Some(relay);
            }
        });
    }

    fn schedule_broadcast(self: &Rc<Self>) {
        if self.closed.get() || self.broadcast_scheduled.replace(true) {
            return;
        }

        tokio::task::spawn_local(broadcast(Rc::downgrade(self), self.session.clone()));
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }

        info!(participant = %self.self_handle, "Closing conversation");
        let mut tubes = self.tubes.borrow_mut();
        tubes.close_all();
        while let Some(event) = tubes.poll_event() {
            let _ = self.events.send(event);
        }
    }
}

/// Sends an offer to the remote peer and applies its answer.
async fn negotiate(shared: Weak<Shared>, session: Weak<dyn MessagingSession>, offer: TubeOffer) {
    let id = offer.tube_id;
    let result = send_request(&session, &TubeRequest::Offer(offer)).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };

    let outcome = match result {
        Ok(TubeReply { result: Ok(()) }) => shared.with_tubes(|tubes| tubes.offer_succeeded(id)),
        Ok(TubeReply { result: Err(rejection) }) => shared.with_tubes(|tubes| tubes.offer_failed(id, rejection.to_string())),
        Err(error) => shared.with_tubes(|tubes| tubes.offer_failed(id, error.to_string())),
    };

    if let Err(error) = outcome {
        debug!(tube_id = %id, "Offer answered after the tube was closed: {error}");
    }

    shared.after_change();
}

async fn send_close(session: Weak<dyn MessagingSession>, id: TubeId) {
    match send_request(&session, &TubeRequest::Close(id)).await {
        Ok(_) => debug!(tube_id = %id, "Remote peer closed the tube"),
        Err(error) => debug!(tube_id = %id, "Couldn't tell the remote peer to close the tube: {error}"),
    }
}

async fn send_request(session: &Weak<dyn MessagingSession>, request: &TubeRequest) -> io::Result<TubeReply> {
    let session = session
        .upgrade()
        .ok_or_else(|| IoError::new(ErrorKind::NotConnected, "the messaging session is gone"))?;

    let payload = to_bytes(request)?;
    let reply = session.send_request(payload).await?;
    from_bytes(&reply)
}

/// Announces our tubes to the group. Changes made while the broadcast is in flight schedule
/// another one.
async fn broadcast(shared: Weak<Shared>, session: Weak<dyn MessagingSession>) {
    let Some(snapshot) = shared.upgrade().map(|shared| {
        shared.broadcast_scheduled.set(false);
        shared.with_tubes(|tubes| tubes.snapshot())
    }) else {
        return;
    };

    let result = match (session.upgrade(), to_bytes(&snapshot)) {
        (Some(session), Ok(payload)) => session.send_broadcast(payload).await,
        (None, _) => Err(IoError::new(ErrorKind::NotConnected, "the messaging session is gone")),
        (_, Err(error)) => Err(error),
    };

    let Some(shared) = shared.upgrade() else {
        return;
    };

    match result {
        Ok(()) => {
            debug!(entries = snapshot.entries.len(), "Announced tubes");
            shared.with_tubes(|tubes| tubes.broadcast_sent(&snapshot));
        }
        Err(error) => {
            warn!("Couldn't announce tubes: {error}");
            shared.with_tubes(|tubes| tubes.broadcast_failed(&snapshot, &error.to_string()));
        }
    }

    shared.after_change();
}

fn reply(responder: oneshot::Sender<Vec<u8>>, reply: TubeReply) {
    match to_bytes(&reply) {
        Ok(payload) => {
            if responder.send(payload).is_err() {
                debug!("The remote peer stopped waiting for a reply");
            }
        }
        Err(error) => warn!("Couldn't encode reply: {error}"),
    }
}

/// Hands incoming bytestreams to a [`Conversation`].
struct ConversationSink {
    shared: Weak<Shared>,
}

#[async_trait(?Send)]
impl BytestreamSink for ConversationSink {
    async fn incoming_bytestream(&self, bytestream: Bytestream) {
        if let Err(error) = accept_bytestream(&self.shared, bytestream).await {
            debug!("Incoming bytestream ended: {error}");
        }
    }
}

async fn answer(bytestream: &mut Bytestream, reply: TubeReply) -> io::Result<()> {
    reply.write(&mut bytestream.writer).await?;
    bytestream.writer.flush().await
}

async fn accept_bytestream(shared: &Weak<Shared>, mut bytestream: Bytestream) -> Result<(), Error> {
    let initiation = StreamInitiation::read(&mut bytestream.reader).await?;
    let id = initiation.tube_id;
    debug!(tube_id = %id, participant = %initiation.initiator, stream_id = %initiation.stream_id, "Incoming bytestream");

    let conversation = shared.upgrade().ok_or(Error::Closed)?;
    let admitted = conversation.admit_bytestream(&initiation);
    conversation.after_change();

    let kind = match admitted {
        Ok(kind) => kind,
        Err(rejection) => {
            warn!(tube_id = %id, participant = %initiation.initiator, %rejection, "Refused bytestream");
            answer(&mut bytestream, TubeReply { result: Err(rejection.clone()) }).await?;
            return Err(Error::Negotiation(rejection.to_string()));
        }
    };

    match kind {
        TubeKind::Stream => {
            let service = conversation.with_tubes(|tubes| {
                tubes.tube(id).and_then(|tube| tube.resources()).and_then(|bridge| bridge.service.clone())
            });

            let service = service.ok_or(TubeError::UnknownTube(id))?;
            let local = match LocalStream::connect(&service).await {
                Ok(local) => local,
                Err(error) => {
                    warn!(tube_id = %id, %service, "Couldn't reach the tube's service: {error}");
                    let rejection = Rejection::new(RejectReason::NotOpen, format!("service unreachable: {error}"));
                    answer(&mut bytestream, TubeReply { result: Err(rejection) }).await?;
                    return Err(error.into());
                }
            };

            answer(&mut bytestream, TubeReply::ok()).await?;
            spawn_connection(&conversation, id, initiation.stream_id, async move {
                if let Err(error) = pump(local, bytestream).await {
                    debug!(tube_id = %id, "Connection ended with error: {error}");
                }
            })?;
        }
        TubeKind::Bus => {
            let relay = conversation.with_tubes(|tubes| {
                let bridge = tubes.tube(id)?.resources()?;
                bridge.relay.as_ref().map(BusRelay::handle)
            });

            let relay = relay.ok_or_else(|| Error::Negotiation(format!("tube {id} has no bus relay")))?;
            answer(&mut bytestream, TubeReply::ok()).await?;
            relay.attach_link(Rc::downgrade(&conversation), initiation.initiator, bytestream);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Error, ErrorKind},
        rc::Rc,
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::{sync::oneshot, task::LocalSet};
    use tubes_proto::{
        messages::{Parameters, Participant, StreamId, TubeId, TubeKind, TubeOffer, TubeRequest},
        serialize::to_bytes,
    };

    use super::{Conversation, Shared};
    use crate::{bridge::spawn_connection, MemoryNetwork, MessagingSession, SocketAccess, SocketFamily, TubesConfig};

    struct Offline;

    #[async_trait(?Send)]
    impl MessagingSession for Offline {
        async fn send_request(&self, _payload: Vec<u8>) -> io::Result<Vec<u8>> {
            Err(Error::new(ErrorKind::NotConnected, "offline"))
        }

        async fn send_broadcast(&self, _payload: Vec<u8>) -> io::Result<()> {
            Err(Error::new(ErrorKind::NotConnected, "offline"))
        }
    }

    fn live_connections(shared: &Shared, id: TubeId) -> usize {
        shared.tubes.borrow().tube(id).map_or(0, |tube| tube.live_connections())
    }

    #[tokio::test]
    #[allow(clippy::await_holding_refcell_ref)]
    async fn test_connection_ending_while_busy_is_counted_later() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let config = TubesConfig {
                    socket_dir: Some(dir.path().to_path_buf()),
                    ..TubesConfig::new()
                };

                let alice = Participant::new("alice");
                let bob = Participant::new("bob");
                let network = MemoryNetwork::new();
                let session = Rc::new(Offline);
                let connector = Rc::new(network.connector(&bob));
                let (conversation, _events) = Conversation::two_party(config, bob, alice.clone(), &session, connector);

                let id = TubeId(3);
                let offer = TubeRequest::Offer(TubeOffer {
                    tube_id: id,
                    kind: TubeKind::Stream,
                    service: String::from("x-echo"),
                    parameters: Parameters::new(),
                    bytestream_address: "127.0.0.1:1".parse().unwrap(),
                });
                let (responder, _reply) = oneshot::channel();
                conversation.handle_request(&alice, &to_bytes(&offer).unwrap(), responder);
                conversation.accept_tube(id, SocketFamily::Unix, SocketAccess::Localhost).unwrap();

                let shared = Rc::clone(&conversation.shared);
                let (finish, finished) = oneshot::channel::<()>();
                spawn_connection(&shared, id, StreamId(1), async move {
                    let _ = finished.await;
                })
                .unwrap();
                assert_eq!(live_connections(&shared, id), 1);

                let busy = shared.tubes.borrow_mut();
                finish.send(()).unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(busy);

                assert_eq!(live_connections(&shared, id), 1);
                assert_eq!(shared.deferred_ends.borrow().len(), 1);

                shared.after_change();
                assert_eq!(live_connections(&shared, id), 0);
                assert!(shared.deferred_ends.borrow().is_empty());
            })
            .await;
    }
}
