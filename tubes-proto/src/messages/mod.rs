//! The messages exchanged to negotiate tubes and to set up their bytestreams.

mod bus;
mod ids;
mod initiation;
mod kind;
mod reply;
mod request;
mod snapshot;

use std::collections::BTreeMap;

pub use bus::*;
pub use ids::*;
pub use initiation::*;
pub use kind::*;
pub use reply::*;
pub use request::*;
pub use snapshot::*;

/// Tube-specific negotiation data, supplied when a tube is offered and immutable afterwards.
pub type Parameters = BTreeMap<String, String>;
