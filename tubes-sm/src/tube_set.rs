use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info};
use tubes_proto::messages::{
    Parameters, Participant, RejectReason, Rejection, SnapshotEntry, StreamId, TubeId, TubeKind, TubeOffer, TubeSnapshot,
};

use crate::{bus_name_for, CloseReason, IdAllocator, Tube, TubeError, TubeEvent, TubeInfo, TubeState, TubeVariant};

/// The conversation a [`TubeSet`] belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Context {
    /// A conversation with exactly one remote peer. Tubes are negotiated with requests.
    Peer(Participant),

    /// A group conversation. Tubes are announced with broadcast snapshots.
    Group,
}

impl Context {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Peer(_) => "two-party",
            Self::Group => "group",
        }
    }
}

/// A tube that was just closed, handed back so its owner can finish tearing it down.
#[derive(Debug)]
pub struct ClosedTube<R> {
    pub info: TubeInfo,

    /// The state the tube was in before being closed.
    pub previous: TubeState,
    pub resources: Option<R>,
}

/// The tubes of one conversation.
///
/// A `TubeSet` does no IO. Its owner tells it what happened (a local request, an incoming
/// offer, a reply, a snapshot) and reads back what to do and what to report through the
/// return values and [`poll_event`](Self::poll_event).
#[derive(Debug)]
pub struct TubeSet<R> {
    pub(crate) context: Context,
    pub(crate) self_handle: Participant,
    pub(crate) tubes: BTreeMap<TubeId, Tube<R>>,
    pub(crate) ids: IdAllocator,
    pub(crate) events: VecDeque<TubeEvent>,
    next_stream_id: u32,
    broadcast_needed: bool,
}

impl<R> TubeSet<R> {
    /// Creates an empty tube set. `id_reuse_window` is how many recently removed ids are kept
    /// out of circulation.
    pub fn new(context: Context, self_handle: Participant, id_reuse_window: usize) -> Self {
        Self {
            context,
            self_handle,
            tubes: BTreeMap::new(),
            ids: IdAllocator::new(id_reuse_window),
            events: VecDeque::new(),
            next_stream_id: 1,
            broadcast_needed: false,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn self_handle(&self) -> &Participant {
        &self.self_handle
    }

    pub fn is_group(&self) -> bool {
        self.context == Context::Group
    }

    pub fn len(&self) -> usize {
        self.tubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.is_empty()
    }

    pub fn tube(&self, id: TubeId) -> Option<&Tube<R>> {
        self.tubes.get(&id)
    }

    pub fn tube_mut(&mut self, id: TubeId) -> Option<&mut Tube<R>> {
        self.tubes.get_mut(&id)
    }

    /// Lists every live tube, ordered by id.
    pub fn list(&self) -> Vec<TubeInfo> {
        self.tubes.values().map(Tube::info).collect()
    }

    /// Returns the next event to report, if any.
    pub fn poll_event(&mut self) -> Option<TubeEvent> {
        self.events.pop_front()
    }

    /// Returns whether the tube set changed since the last call in a way the group should be
    /// told about.
    pub fn take_broadcast_needed(&mut self) -> bool {
        std::mem::take(&mut self.broadcast_needed)
    }

    /// Picks an id for a new bytestream opened from this side.
    pub fn new_stream_id(&mut self) -> StreamId {
        let id = StreamId(self.next_stream_id);
        self.next_stream_id = self.next_stream_id.wrapping_add(1).max(1);
        id
    }

    fn changed(&mut self) {
        if self.is_group() {
            self.broadcast_needed = true;
        }
    }

    fn get_mut(&mut self, id: TubeId) -> Result<&mut Tube<R>, TubeError> {
        self.tubes.get_mut(&id).ok_or(TubeError::UnknownTube(id))
    }

    /// Creates a tube offered by us.
    ///
    /// In a two-party conversation the tube goes straight to `RemotePending`, and the caller
    /// must send the offer and then call either [`offer_succeeded`](Self::offer_succeeded) or
    /// [`offer_failed`](Self::offer_failed). In a group the tube stays `NotOffered` until the
    /// next broadcast carrying it is sent.
    pub fn offer(&mut self, kind: TubeKind, service: String, parameters: Parameters, resources: R) -> Result<TubeId, TubeError> {
        if service.is_empty() {
            return Err(TubeError::MissingService);
        }

        let tubes = &self.tubes;
        let id = self.ids.allocate(|id| tubes.contains_key(&id));

        let mut tube = Tube::new(id, kind, TubeState::NotOffered, self.self_handle.clone(), service, parameters);
        tube.set_resources(resources);

        match self.context {
            Context::Peer(_) => {
                tube.set_state(TubeState::RemotePending)?;
                self.ids.begin_request(id);
            }
            Context::Group => {
                if let Some(bus) = tube.bus_mut() {
                    bus.own = Some((bus_name_for(&self.self_handle), StreamId(self.next_stream_id)));
                    self.next_stream_id = self.next_stream_id.wrapping_add(1).max(1);
                }
            }
        }

        info!(tube_id = %id, %kind, service = tube.service(), context = self.context.name(), "Offering tube");
        self.tubes.insert(id, tube);
        self.changed();
        Ok(id)
    }

    /// The remote peer accepted our offer.
    ///
    /// Does nothing if the tube was already opened by an incoming bytestream.
    pub fn offer_succeeded(&mut self, id: TubeId) -> Result<(), TubeError> {
        self.ids.end_request(id);

        let tube = self.get_mut(id)?;
        match tube.state() {
            TubeState::Open => Ok(()),
            TubeState::RemotePending => {
                tube.set_state(TubeState::Open)?;
                info!(tube_id = %id, "Offer accepted");
                self.events.push_back(TubeEvent::Opened(id));
                Ok(())
            }
            state => Err(TubeError::InvalidState {
                id,
                state,
                expected: "remote-pending",
            }),
        }
    }

    /// The remote peer rejected our offer, or it couldn't be delivered.
    ///
    /// The tube is closed with [`CloseReason::NegotiationFailed`]. If it was already closed,
    /// this only retires the outstanding request and returns [`TubeError::UnknownTube`].
    pub fn offer_failed(&mut self, id: TubeId, message: String) -> Result<(), TubeError> {
        self.ids.end_request(id);

        let state = self.tubes.get(&id).map(Tube::state).ok_or(TubeError::UnknownTube(id))?;
        if state == TubeState::LocalPending {
            return Err(TubeError::InvalidState {
                id,
                state,
                expected: "remote-pending",
            });
        }

        info!(tube_id = %id, message, "Offer failed");
        self.remove(id, CloseReason::NegotiationFailed(message));
        Ok(())
    }

    /// Processes an offer received from the remote peer of a two-party conversation.
    ///
    /// On success the tube exists in `LocalPending` and a [`TubeEvent::NewTube`] is queued. On
    /// failure nothing changes and the returned rejection should be sent back as the reply.
    pub fn handle_offer(&mut self, from: &Participant, offer: TubeOffer) -> Result<TubeId, Rejection> {
        match &self.context {
            Context::Peer(peer) if peer == from => {}
            Context::Peer(_) => {
                return Err(Rejection::new(RejectReason::Malformed, "offer from outside the conversation"));
            }
            Context::Group => {
                return Err(Rejection::new(RejectReason::Malformed, "group tubes are announced, not offered"));
            }
        }

        if offer.service.is_empty() {
            return Err(Rejection::new(RejectReason::Malformed, "missing service"));
        }

        let id = offer.tube_id;
        if self.tubes.contains_key(&id) || self.ids.is_outstanding(id) {
            return Err(Rejection::new(RejectReason::IdCollision, format!("tube {id} already exists")));
        }

        let tube = Tube::new(id, offer.kind, TubeState::LocalPending, from.clone(), offer.service, offer.parameters);
        info!(tube_id = %id, kind = %offer.kind, service = tube.service(), participant = %from, "Received tube offer");

        self.events.push_back(TubeEvent::NewTube(tube.info()));
        self.tubes.insert(id, tube);
        Ok(id)
    }

    /// Accepts a tube offered by a remote participant. In a group, accepting a bus tube joins it.
    pub fn accept(&mut self, id: TubeId) -> Result<(), TubeError> {
        let is_group = self.is_group();
        let own_name = bus_name_for(&self.self_handle);
        let stream_id = StreamId(self.next_stream_id);

        let tube = self.get_mut(id)?;
        if tube.state() != TubeState::LocalPending {
            return Err(TubeError::InvalidState {
                id,
                state: tube.state(),
                expected: "local-pending",
            });
        }

        tube.set_state(TubeState::Open)?;
        let mut used_stream_id = false;
        if let (true, Some(bus)) = (is_group, tube.bus_mut()) {
            bus.own = Some((own_name, stream_id));
            used_stream_id = true;
        }

        info!(tube_id = %id, "Tube accepted");
        if used_stream_id {
            self.new_stream_id();
        }

        self.events.push_back(TubeEvent::Opened(id));
        self.changed();
        Ok(())
    }

    /// Closes a tube at the local application's request, whatever its state.
    ///
    /// The caller uses [`ClosedTube::previous`] to decide what the remote side should be told:
    /// a `LocalPending` two-party tube declines the offer, other two-party tubes send a close
    /// request, and group tubes are withdrawn by the next broadcast.
    pub fn close(&mut self, id: TubeId) -> Result<ClosedTube<R>, TubeError> {
        self.remove(id, CloseReason::Local).ok_or(TubeError::UnknownTube(id))
    }

    /// The remote peer of a two-party conversation closed a tube.
    pub fn remote_close(&mut self, from: &Participant, id: TubeId) -> Result<ClosedTube<R>, TubeError> {
        match &self.context {
            Context::Peer(peer) if peer == from => {}
            Context::Peer(_) => {
                return Err(TubeError::NotAllowed {
                    id,
                    participant: from.to_string(),
                })
            }
            Context::Group => return Err(TubeError::WrongContext("group")),
        }

        self.remove(id, CloseReason::Remote).ok_or(TubeError::UnknownTube(id))
    }

    /// Checks whether `from` may attach a new bytestream to a tube.
    ///
    /// A bytestream can only be opened by a peer that accepted the tube, so one arriving for a
    /// tube we offered and is still waiting for confirmation opens that tube.
    pub fn bytestream_initiated(&mut self, from: &Participant, id: TubeId) -> Result<(), TubeError> {
        let self_handle = self.self_handle.clone();
        let peer = match &self.context {
            Context::Peer(peer) => Some(peer.clone()),
            Context::Group => None,
        };

        let tube = self.get_mut(id)?;
        let not_allowed = || TubeError::NotAllowed {
            id,
            participant: from.to_string(),
        };

        if peer.as_ref().is_some_and(|peer| peer != from) || *from == self_handle {
            return Err(not_allowed());
        }

        if tube.kind() == TubeKind::Stream && *tube.initiator() != self_handle {
            return Err(not_allowed());
        }

        match tube.state() {
            TubeState::Open => Ok(()),
            TubeState::RemotePending | TubeState::NotOffered if *tube.initiator() == self_handle => {
                tube.set_state(TubeState::Open)?;
                info!(tube_id = %id, participant = %from, "Tube confirmed by incoming bytestream");
                self.events.push_back(TubeEvent::Opened(id));
                Ok(())
            }
            state => Err(TubeError::InvalidState {
                id,
                state,
                expected: "open",
            }),
        }
    }

    /// A local connection was attached to an open tube.
    pub fn connection_opened(&mut self, id: TubeId, connection: StreamId) -> Result<(), TubeError> {
        let tube = self.get_mut(id)?;
        if !tube.state().is_open() {
            return Err(TubeError::InvalidState {
                id,
                state: tube.state(),
                expected: "open",
            });
        }

        tube.connection_opened();
        debug!(tube_id = %id, %connection, live = tube.live_connections(), "New connection");
        self.events.push_back(TubeEvent::NewConnection { id, connection });
        Ok(())
    }

    /// A local connection ended. If the tube was only waiting for its connections to end, it
    /// is closed now and handed back.
    pub fn connection_closed(&mut self, id: TubeId) -> Option<ClosedTube<R>> {
        let tube = self.tubes.get_mut(&id)?;
        match tube.connection_closed() {
            true => self.remove(id, CloseReason::Remote),
            false => None,
        }
    }

    /// Builds the snapshot we announce to the group: our stream tubes and the bus tubes we
    /// take part in, whether already open or waiting for this broadcast.
    pub fn snapshot(&self) -> TubeSnapshot {
        let announceable = |state: TubeState| matches!(state, TubeState::NotOffered | TubeState::Open);

        let entries = self
            .tubes
            .values()
            .filter(|tube| announceable(tube.state()))
            .filter_map(|tube| {
                let (bus_name, stream_id) = match tube.variant() {
                    TubeVariant::Stream if *tube.initiator() == self.self_handle && !tube.is_closing() => (None, None),
                    TubeVariant::Bus(bus) => {
                        let (name, stream_id) = bus.own.as_ref()?;
                        (Some(name.clone()), Some(*stream_id))
                    }
                    TubeVariant::Stream => return None,
                };

                Some(SnapshotEntry {
                    tube_id: tube.id(),
                    kind: tube.kind(),
                    service: tube.service().to_owned(),
                    initiator: tube.initiator().clone(),
                    parameters: tube.parameters().clone(),
                    bus_name,
                    stream_id,
                })
            })
            .collect();

        TubeSnapshot { entries }
    }

    /// A snapshot built with [`snapshot`](Self::snapshot) was broadcast. The tubes it offered
    /// are now open.
    pub fn broadcast_sent(&mut self, snapshot: &TubeSnapshot) {
        for entry in &snapshot.entries {
            let Some(tube) = self.tubes.get_mut(&entry.tube_id) else {
                continue;
            };

            if tube.state() == TubeState::NotOffered && tube.set_state(TubeState::Open).is_ok() {
                info!(tube_id = %entry.tube_id, "Tube announced to the group");
                self.events.push_back(TubeEvent::Opened(entry.tube_id));
            }
        }
    }

    /// A snapshot built with [`snapshot`](Self::snapshot) couldn't be broadcast. The tubes it
    /// offered are closed.
    pub fn broadcast_failed(&mut self, snapshot: &TubeSnapshot, message: &str) {
        for entry in &snapshot.entries {
            if self.tubes.get(&entry.tube_id).map(Tube::state) == Some(TubeState::NotOffered) {
                self.remove(entry.tube_id, CloseReason::NegotiationFailed(message.to_owned()));
            }
        }
    }

    /// Lists the bus names of the participants of a bus tube, including ours once we joined.
    pub fn bus_participants(&self, id: TubeId) -> Result<BTreeMap<Participant, String>, TubeError> {
        let tube = self.tubes.get(&id).ok_or(TubeError::UnknownTube(id))?;
        let bus = tube.bus().ok_or(TubeError::NotABus(id))?;

        let mut participants = BTreeMap::new();
        match &self.context {
            Context::Peer(peer) => {
                if tube.state().is_open() {
                    participants.insert(self.self_handle.clone(), bus_name_for(&self.self_handle));
                    participants.insert(peer.clone(), bus_name_for(peer));
                }
            }
            Context::Group => {
                participants.extend(bus.bus_names.iter().map(|(p, name)| (p.clone(), name.clone())));
                if let (true, Some((name, _))) = (tube.state().is_open(), &bus.own) {
                    participants.insert(self.self_handle.clone(), name.clone());
                }
            }
        }

        Ok(participants)
    }

    /// Closes every tube because the conversation is going away. Nobody is notified.
    pub fn close_all(&mut self) {
        let ids: Vec<TubeId> = self.tubes.keys().copied().collect();
        for id in ids {
            self.remove(id, CloseReason::ContextClosed);
        }

        self.broadcast_needed = false;
    }

    pub(crate) fn remove(&mut self, id: TubeId, reason: CloseReason) -> Option<ClosedTube<R>> {
        let mut tube = self.tubes.remove(&id)?;
        let previous = tube.state();
        tube.mark_closed();
        self.ids.retire(id);

        info!(tube_id = %id, ?reason, "Tube closed");
        self.events.push_back(TubeEvent::Closed { id, reason });
        self.changed();

        Some(ClosedTube {
            info: tube.info(),
            previous,
            resources: tube.take_resources(),
        })
    }
}
