//! A sans-IO state machine for tubes: the lifecycle of each tube, the set of tubes of a
//! conversation, tube id allocation and the tracking of group rosters.
//!
//! Nothing in here touches a socket or a clock. The owner of a [`TubeSet`] feeds it local
//! requests and decoded protocol messages, performs whatever IO the return values call for,
//! and drains [`TubeEvent`]s with [`TubeSet::poll_event`].

mod bus_name;
mod error;
mod events;
mod ids;
mod roster;
mod state;
mod tube;
mod tube_set;

pub use crate::bus_name::*;
pub use crate::error::*;
pub use crate::events::*;
pub use crate::ids::*;
pub use crate::state::*;
pub use crate::tube::*;
pub use crate::tube_set::*;
