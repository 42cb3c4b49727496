use tubes_proto::messages::TubeId;

use crate::TubeState;

/// Errors returned by [`TubeSet`](crate::TubeSet) operations. None of them change any state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TubeError {
    #[error("no tube with id {0}")]
    UnknownTube(TubeId),

    #[error("tube {id} is {state}, expected {expected}")]
    InvalidState {
        id: TubeId,
        state: TubeState,
        expected: &'static str,
    },

    #[error("tube {id} cannot go from {from} to {to}")]
    InvalidTransition { id: TubeId, from: TubeState, to: TubeState },

    #[error("tube {0} is not a bus tube")]
    NotABus(TubeId),

    #[error("not available in a {0} conversation")]
    WrongContext(&'static str),

    #[error("a tube needs a service name")]
    MissingService,

    #[error("{participant} may not open bytestreams on tube {id}")]
    NotAllowed { id: TubeId, participant: String },
}
