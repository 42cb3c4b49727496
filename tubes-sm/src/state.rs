use std::fmt;

/// The negotiation state of a tube.
///
/// A tube only moves forward through these states: `NotOffered` goes to either of the pending
/// states, those go to `Open`, and anything goes to `Closed`. There is no way out of `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TubeState {
    /// Created locally and not yet confirmed by the negotiation protocol. In a group, a tube in
    /// this state is eligible for the next broadcast.
    NotOffered,

    /// Offered by a remote participant, waiting for the local application to accept it.
    LocalPending,

    /// Offered to the remote peer, waiting for its reply.
    RemotePending,

    /// Negotiated and carrying traffic.
    Open,

    /// Terminal.
    Closed,
}

impl TubeState {
    /// Whether the state graph has an edge from this state to `to`.
    pub const fn can_transition_to(self, to: TubeState) -> bool {
        use TubeState::*;

        matches!(
            (self, to),
            (NotOffered, LocalPending)
                | (NotOffered, RemotePending)
                | (NotOffered, Open)
                | (LocalPending, Open)
                | (RemotePending, Open)
                | (NotOffered | LocalPending | RemotePending | Open, Closed)
        )
    }

    pub const fn is_pending(self) -> bool {
        matches!(self, Self::LocalPending | Self::RemotePending)
    }

    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for TubeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOffered => write!(f, "not-offered"),
            Self::LocalPending => write!(f, "local-pending"),
            Self::RemotePending => write!(f, "remote-pending"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
