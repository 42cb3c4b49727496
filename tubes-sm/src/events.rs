use tubes_proto::messages::{Parameters, Participant, StreamId, TubeId, TubeKind};

use crate::TubeState;

/// A snapshot of a tube's public information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TubeInfo {
    pub id: TubeId,
    pub kind: TubeKind,
    pub state: TubeState,
    pub initiator: Participant,
    pub service: String,
    pub parameters: Parameters,
}

/// Something the application should be told about, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TubeEvent {
    /// A remote participant offered a tube. It's `LocalPending` until accepted or closed.
    NewTube(TubeInfo),

    Opened(TubeId),

    Closed { id: TubeId, reason: CloseReason },

    /// A bytestream was attached to an open tube.
    NewConnection { id: TubeId, connection: StreamId },

    /// A remote participant joined or left a group bus tube.
    BusRosterChanged { id: TubeId, change: RosterChange },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local application.
    Local,

    /// Closed by a remote participant, or no longer announced by its initiator.
    Remote,

    /// The conversation the tube belonged to was closed.
    ContextClosed,

    /// The offer was rejected or couldn't be delivered.
    NegotiationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Added(Participant, String),
    Removed(Participant),
}
