//! Tracking what the other members of a group announce.
//!
//! Every member broadcasts a [`TubeSnapshot`] with the tubes it takes part in. Each snapshot is
//! compared against what we last knew about its sender: new tubes are discovered, the sender
//! joins or leaves the rosters of bus tubes, and stream tubes it stopped announcing go away.

use tracing::{debug, info, warn};
use tubes_proto::messages::{Participant, SnapshotEntry, TubeId, TubeKind, TubeSnapshot};

use crate::{CloseReason, RosterChange, Tube, TubeEvent, TubeSet, TubeState};

impl<R> TubeSet<R> {
    /// Processes a snapshot broadcast by `from`.
    ///
    /// `is_member` is whether the group membership currently lists `from`; snapshots from
    /// non-members and our own echoed snapshots are ignored. Processing the same snapshot
    /// twice queues no events the second time.
    pub fn handle_snapshot(&mut self, from: &Participant, snapshot: &TubeSnapshot, is_member: bool) {
        if !self.is_group() {
            warn!(participant = %from, "Ignoring tube snapshot outside of a group");
            return;
        }

        if *from == self.self_handle {
            return;
        }

        if !is_member {
            debug!(participant = %from, "Ignoring tube snapshot from a non-member");
            return;
        }

        for entry in &snapshot.entries {
            self.discover(from, entry);
        }

        let ids: Vec<TubeId> = self.tubes.keys().copied().collect();
        for id in ids {
            self.diff_tube(from, id, snapshot.entry(id));
        }
    }

    /// A member left the group. Same as that member announcing an empty snapshot.
    pub fn member_left(&mut self, participant: &Participant) {
        self.handle_snapshot(participant, &TubeSnapshot::default(), true);
    }

    fn discover(&mut self, from: &Participant, entry: &SnapshotEntry) {
        if let Some(tube) = self.tubes.get(&entry.tube_id) {
            if tube.kind() != entry.kind {
                warn!(tube_id = %entry.tube_id, participant = %from, announced = %entry.kind, known = %tube.kind(), "Announced tube kind doesn't match");
            }

            return;
        }

        if self.ids.is_outstanding(entry.tube_id) {
            debug!(tube_id = %entry.tube_id, participant = %from, "Ignoring announcement of a tube with a request in flight");
            return;
        }

        // Others keep announcing a bus we offered after we close it; it's gone for us.
        if entry.kind == TubeKind::Bus && entry.initiator == self.self_handle && self.ids.was_retired(entry.tube_id) {
            debug!(tube_id = %entry.tube_id, participant = %from, "Ignoring announcement of a bus tube we closed");
            return;
        }

        if entry.service.is_empty() {
            warn!(tube_id = %entry.tube_id, participant = %from, "Ignoring announced tube without a service");
            return;
        }

        let initiator = match entry.kind {
            TubeKind::Stream => from.clone(),
            TubeKind::Bus if entry.bus_name.is_some() => entry.initiator.clone(),
            TubeKind::Bus => {
                warn!(tube_id = %entry.tube_id, participant = %from, "Ignoring announced bus tube without a bus name");
                return;
            }
        };

        let tube = Tube::new(
            entry.tube_id,
            entry.kind,
            TubeState::LocalPending,
            initiator,
            entry.service.clone(),
            entry.parameters.clone(),
        );

        info!(tube_id = %entry.tube_id, kind = %entry.kind, service = entry.service, participant = %from, "Discovered group tube");
        self.events.push_back(TubeEvent::NewTube(tube.info()));
        self.tubes.insert(entry.tube_id, tube);
    }

    fn diff_tube(&mut self, from: &Participant, id: TubeId, announced: Option<&SnapshotEntry>) {
        let Some(tube) = self.tubes.get_mut(&id) else {
            return;
        };

        let announced = announced.filter(|entry| entry.kind == tube.kind());
        let state = tube.state();
        let is_initiator = tube.initiator() == from;

        let close = if let Some(bus) = tube.bus_mut() {
            let new_name = announced.and_then(|entry| entry.bus_name.clone());
            let old_name = bus.bus_names.get(from).cloned();

            match (old_name, new_name) {
                (None, Some(name)) => {
                    bus.bus_names.insert(from.clone(), name.clone());
                    let change = RosterChange::Added(from.clone(), name);
                    self.events.push_back(TubeEvent::BusRosterChanged { id, change });
                }
                (Some(old), Some(name)) if old != name => {
                    bus.bus_names.insert(from.clone(), name.clone());
                    let removed = RosterChange::Removed(from.clone());
                    let added = RosterChange::Added(from.clone(), name);
                    self.events.push_back(TubeEvent::BusRosterChanged { id, change: removed });
                    self.events.push_back(TubeEvent::BusRosterChanged { id, change: added });
                }
                (Some(_), None) => {
                    bus.bus_names.remove(from);
                    let change = RosterChange::Removed(from.clone());
                    self.events.push_back(TubeEvent::BusRosterChanged { id, change });
                }
                _ => {}
            }

            state == TubeState::LocalPending && bus.bus_names.is_empty()
        } else if is_initiator && announced.is_none() {
            let close = tube.close_when_idle();
            if !close {
                debug!(tube_id = %id, live = tube.live_connections(), "Tube withdrawn, closing after its last connection");
            }

            close
        } else {
            false
        };

        if close {
            self.remove(id, CloseReason::Remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use tubes_proto::messages::{Parameters, Participant, SnapshotEntry, StreamId, TubeId, TubeKind, TubeSnapshot};

    use crate::{bus_name_for, CloseReason, Context, RosterChange, TubeEvent, TubeSet, TubeState};

    fn me() -> Participant {
        Participant::new("me")
    }

    fn group() -> TubeSet<()> {
        TubeSet::new(Context::Group, me(), 16)
    }

    fn events<R>(set: &mut TubeSet<R>) -> Vec<TubeEvent> {
        std::iter::from_fn(|| set.poll_event()).collect()
    }

    fn bus_entry(id: u32, initiator: &str, member: &str) -> SnapshotEntry {
        SnapshotEntry {
            tube_id: TubeId(id),
            kind: TubeKind::Bus,
            service: String::from("org.example.Chat"),
            initiator: Participant::new(initiator),
            parameters: Parameters::new(),
            bus_name: Some(bus_name_for(&Participant::new(member))),
            stream_id: Some(StreamId(1)),
        }
    }

    fn stream_entry(id: u32, initiator: &str) -> SnapshotEntry {
        SnapshotEntry {
            tube_id: TubeId(id),
            kind: TubeKind::Stream,
            service: String::from("x-vnc"),
            initiator: Participant::new(initiator),
            parameters: Parameters::new(),
            bus_name: None,
            stream_id: None,
        }
    }

    fn snapshot(entries: Vec<SnapshotEntry>) -> TubeSnapshot {
        TubeSnapshot { entries }
    }

    fn added(id: u32, who: &str) -> TubeEvent {
        let who = Participant::new(who);
        let name = bus_name_for(&who);
        TubeEvent::BusRosterChanged {
            id: TubeId(id),
            change: RosterChange::Added(who, name),
        }
    }

    fn removed(id: u32, who: &str) -> TubeEvent {
        TubeEvent::BusRosterChanged {
            id: TubeId(id),
            change: RosterChange::Removed(Participant::new(who)),
        }
    }

    #[test]
    fn test_discover_bus_tube() {
        let mut set = group();
        let bob = Participant::new("bob");
        set.handle_snapshot(&bob, &snapshot(vec![bus_entry(4, "bob", "bob")]), true);

        let events = events(&mut set);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TubeEvent::NewTube(info) if info.id == TubeId(4) && info.state == TubeState::LocalPending));
        assert_eq!(events[1], added(4, "bob"));
    }

    #[test]
    fn test_same_snapshot_twice_is_silent() {
        let mut set = group();
        let bob = Participant::new("bob");
        let announced = snapshot(vec![bus_entry(4, "bob", "bob"), stream_entry(5, "bob")]);

        set.handle_snapshot(&bob, &announced, true);
        assert_eq!(events(&mut set).len(), 3);

        set.handle_snapshot(&bob, &announced, true);
        assert!(events(&mut set).is_empty());
    }

    #[test]
    fn test_roster_join_and_leave() {
        let mut set = group();
        let bob = Participant::new("bob");
        let carol = Participant::new("carol");

        set.handle_snapshot(&bob, &snapshot(vec![bus_entry(4, "bob", "bob")]), true);
        set.accept(TubeId(4)).unwrap();
        events(&mut set);

        set.handle_snapshot(&carol, &snapshot(vec![bus_entry(4, "bob", "carol")]), true);
        assert_eq!(events(&mut set), [added(4, "carol")]);

        set.member_left(&bob);
        assert_eq!(events(&mut set), [removed(4, "bob")]);

        let participants = set.bus_participants(TubeId(4)).unwrap();
        assert_eq!(participants.keys().cloned().collect::<Vec<_>>(), [carol.clone(), me()]);

        set.member_left(&carol);
        assert_eq!(events(&mut set), [removed(4, "carol")]);
        assert_eq!(set.tube(TubeId(4)).unwrap().state(), TubeState::Open);
    }

    #[test]
    fn test_bus_name_change() {
        let mut set = group();
        let bob = Participant::new("bob");
        set.handle_snapshot(&bob, &snapshot(vec![bus_entry(4, "bob", "bob")]), true);
        events(&mut set);

        set.handle_snapshot(&bob, &snapshot(vec![bus_entry(4, "bob", "robert")]), true);
        assert_eq!(
            events(&mut set),
            [
                removed(4, "bob"),
                TubeEvent::BusRosterChanged {
                    id: TubeId(4),
                    change: RosterChange::Added(bob.clone(), bus_name_for(&Participant::new("robert"))),
                }
            ]
        );
    }

    #[test]
    fn test_pending_bus_tube_closes_when_empty() {
        let mut set = group();
        let bob = Participant::new("bob");
        set.handle_snapshot(&bob, &snapshot(vec![bus_entry(4, "bob", "bob")]), true);
        events(&mut set);

        set.handle_snapshot(&bob, &TubeSnapshot::default(), true);
        assert_eq!(
            events(&mut set),
            [
                removed(4, "bob"),
                TubeEvent::Closed {
                    id: TubeId(4),
                    reason: CloseReason::Remote
                }
            ]
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_closed_tube_is_rediscovered() {
        let mut set = group();
        let bob = Participant::new("bob");
        let announced = snapshot(vec![bus_entry(4, "bob", "bob")]);
        set.handle_snapshot(&bob, &announced, true);
        set.accept(TubeId(4)).unwrap();
        set.close(TubeId(4)).unwrap();
        events(&mut set);

        set.handle_snapshot(&bob, &announced, true);
        let events = events(&mut set);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TubeEvent::NewTube(info) if info.id == TubeId(4) && info.state == TubeState::LocalPending));
        assert_eq!(events[1], added(4, "bob"));
        assert_eq!(set.tube(TubeId(4)).unwrap().state(), TubeState::LocalPending);
    }

    #[test]
    fn test_own_closed_bus_stays_closed() {
        let mut set = group();
        let id = set.offer(TubeKind::Bus, String::from("org.example.Chat"), Parameters::new(), ()).unwrap();
        let announced = set.snapshot();
        set.broadcast_sent(&announced);
        set.close(id).unwrap();
        events(&mut set);

        let bob = Participant::new("bob");
        set.handle_snapshot(&bob, &snapshot(vec![bus_entry(id.0, "me", "bob")]), true);

        assert!(events(&mut set).is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn test_ignored_senders() {
        let mut set = group();
        let announced = snapshot(vec![bus_entry(4, "eve", "eve")]);

        set.handle_snapshot(&Participant::new("eve"), &announced, false);
        set.handle_snapshot(&me(), &announced, true);

        assert!(events(&mut set).is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn test_withdrawn_stream_tube() {
        let mut set = group();
        let bob = Participant::new("bob");
        set.handle_snapshot(&bob, &snapshot(vec![stream_entry(5, "bob"), stream_entry(6, "bob")]), true);
        set.accept(TubeId(5)).unwrap();
        set.connection_opened(TubeId(5), StreamId(1)).unwrap();
        events(&mut set);

        set.handle_snapshot(&Participant::new("carol"), &TubeSnapshot::default(), true);
        assert!(events(&mut set).is_empty());

        set.handle_snapshot(&bob, &TubeSnapshot::default(), true);
        assert_eq!(
            events(&mut set),
            [TubeEvent::Closed {
                id: TubeId(6),
                reason: CloseReason::Remote
            }]
        );
        assert_eq!(set.tube(TubeId(5)).unwrap().state(), TubeState::Open);

        let closed = set.connection_closed(TubeId(5)).unwrap();
        assert_eq!(closed.previous, TubeState::Open);
        assert!(set.is_empty());
    }

    #[test]
    fn test_stream_initiator_is_the_sender() {
        let mut set = group();
        set.handle_snapshot(&Participant::new("bob"), &snapshot(vec![stream_entry(5, "mallory")]), true);
        assert_eq!(set.tube(TubeId(5)).unwrap().initiator(), &Participant::new("bob"));
    }

    #[test]
    fn test_kind_mismatch_is_skipped() {
        let mut set = group();
        let bob = Participant::new("bob");
        set.handle_snapshot(&bob, &snapshot(vec![bus_entry(4, "bob", "bob")]), true);
        events(&mut set);

        let mut wrong = bus_entry(4, "bob", "bob");
        wrong.kind = TubeKind::Stream;
        set.handle_snapshot(&Participant::new("carol"), &snapshot(vec![wrong]), true);

        assert!(events(&mut set).is_empty());
        assert_eq!(set.tube(TubeId(4)).unwrap().kind(), TubeKind::Bus);
    }

    #[test]
    fn test_group_offer_opens_on_broadcast() {
        let mut set = group();
        let stream = set.offer(TubeKind::Stream, String::from("x-vnc"), Parameters::new(), ()).unwrap();
        let bus = set.offer(TubeKind::Bus, String::from("org.example.Chat"), Parameters::new(), ()).unwrap();
        assert!(set.take_broadcast_needed());
        assert_eq!(set.tube(stream).unwrap().state(), TubeState::NotOffered);

        let announced = set.snapshot();
        assert_eq!(announced.entries.len(), 2);
        assert_eq!(announced.entry(bus).unwrap().bus_name, Some(bus_name_for(&me())));
        assert_eq!(announced.entry(stream).unwrap().bus_name, None);

        set.broadcast_sent(&announced);
        let mut expected = vec![TubeEvent::Opened(stream), TubeEvent::Opened(bus)];
        if bus < stream {
            expected.reverse();
        }
        assert_eq!(events(&mut set), expected);
        assert_eq!(set.tube(bus).unwrap().state(), TubeState::Open);

        let participants = set.bus_participants(bus).unwrap();
        assert_eq!(participants.get(&me()), Some(&bus_name_for(&me())));
    }

    #[test]
    fn test_group_offer_broadcast_failure() {
        let mut set = group();
        let id = set.offer(TubeKind::Stream, String::from("x-vnc"), Parameters::new(), ()).unwrap();

        let announced = set.snapshot();
        set.broadcast_failed(&announced, "session gone");
        assert_eq!(
            events(&mut set),
            [TubeEvent::Closed {
                id,
                reason: CloseReason::NegotiationFailed(String::from("session gone"))
            }]
        );
    }

    #[test]
    fn test_snapshot_leaves_out_others_stream_tubes() {
        let mut set = group();
        set.handle_snapshot(&Participant::new("bob"), &snapshot(vec![stream_entry(5, "bob"), bus_entry(4, "bob", "bob")]), true);
        set.accept(TubeId(5)).unwrap();
        assert!(set.snapshot().entries.is_empty());

        set.accept(TubeId(4)).unwrap();
        let announced = set.snapshot();
        assert_eq!(announced.entries.len(), 1);
        assert_eq!(announced.entries[0].initiator, Participant::new("bob"));
    }
}
