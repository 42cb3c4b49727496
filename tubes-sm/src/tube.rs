use std::collections::BTreeMap;

use tracing::debug;
use tubes_proto::messages::{Parameters, Participant, StreamId, TubeId, TubeKind};

use crate::{TubeError, TubeInfo, TubeState};

/// Per-kind state of a tube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TubeVariant {
    Stream,
    Bus(BusState),
}

/// The bus side of a tube: our own name on it and, in a group, the other participants' names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusState {
    /// Our bus name and the stream id we announce along with it, once we joined.
    pub own: Option<(String, StreamId)>,

    /// Remote participants and their bus names. Only used in groups.
    pub bus_names: BTreeMap<Participant, String>,
}

/// A single tube and the IO resources `R` it owns.
///
/// The tube doesn't know what `R` is; whoever drives the [`TubeSet`](crate::TubeSet) attaches
/// its sockets and tasks there, and they are dropped when the tube is closed.
#[derive(Debug)]
pub struct Tube<R> {
    id: TubeId,
    variant: TubeVariant,
    state: TubeState,
    initiator: Participant,
    service: String,
    parameters: Parameters,
    resources: Option<R>,
    live_connections: usize,
    close_when_idle: bool,
}

impl<R> Tube<R> {
    pub(crate) fn new(
        id: TubeId,
        kind: TubeKind,
        state: TubeState,
        initiator: Participant,
        service: String,
        parameters: Parameters,
    ) -> Self {
        let variant = match kind {
            TubeKind::Stream => TubeVariant::Stream,
            TubeKind::Bus => TubeVariant::Bus(BusState::default()),
        };

        Self {
            id,
            variant,
            state,
            initiator,
            service,
            parameters,
            resources: None,
            live_connections: 0,
            close_when_idle: false,
        }
    }

    pub fn id(&self) -> TubeId {
        self.id
    }

    pub fn kind(&self) -> TubeKind {
        match self.variant {
            TubeVariant::Stream => TubeKind::Stream,
            TubeVariant::Bus(_) => TubeKind::Bus,
        }
    }

    pub fn variant(&self) -> &TubeVariant {
        &self.variant
    }

    pub fn state(&self) -> TubeState {
        self.state
    }

    pub fn initiator(&self) -> &Participant {
        &self.initiator
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections
    }

    pub fn info(&self) -> TubeInfo {
        TubeInfo {
            id: self.id,
            kind: self.kind(),
            state: self.state,
            initiator: self.initiator.clone(),
            service: self.service.clone(),
            parameters: self.parameters.clone(),
        }
    }

    pub fn resources(&self) -> Option<&R> {
        self.resources.as_ref()
    }

    pub fn resources_mut(&mut self) -> Option<&mut R> {
        self.resources.as_mut()
    }

    /// Attaches resources to this tube, returning the ones it had before.
    pub fn set_resources(&mut self, resources: R) -> Option<R> {
        self.resources.replace(resources)
    }

    pub fn take_resources(&mut self) -> Option<R> {
        self.resources.take()
    }

    pub(crate) fn bus(&self) -> Option<&BusState> {
        match &self.variant {
            TubeVariant::Bus(bus) => Some(bus),
            TubeVariant::Stream => None,
        }
    }

    pub(crate) fn bus_mut(&mut self) -> Option<&mut BusState> {
        match &mut self.variant {
            TubeVariant::Bus(bus) => Some(bus),
            TubeVariant::Stream => None,
        }
    }

    /// Moves this tube to another state, failing if the state graph has no such edge.
    pub(crate) fn set_state(&mut self, to: TubeState) -> Result<(), TubeError> {
        if !self.state.can_transition_to(to) {
            return Err(TubeError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }

        debug!(tube_id = %self.id, from = %self.state, %to, "Tube state changed");
        self.state = to;
        Ok(())
    }

    /// Closes the tube. Every live state has an edge to `Closed`.
    pub(crate) fn mark_closed(&mut self) {
        debug!(tube_id = %self.id, from = %self.state, "Tube state changed to closed");
        self.state = TubeState::Closed;
    }

    pub(crate) fn connection_opened(&mut self) {
        self.live_connections += 1;
    }

    /// Returns whether the tube should now be closed.
    pub(crate) fn connection_closed(&mut self) -> bool {
        self.live_connections = self.live_connections.saturating_sub(1);
        self.close_when_idle && self.live_connections == 0
    }

    /// Returns whether the tube can be closed right away, or otherwise remembers to close it
    /// once its last connection ends.
    pub(crate) fn close_when_idle(&mut self) -> bool {
        self.close_when_idle = true;
        self.live_connections == 0
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.close_when_idle
    }
}
