//! The wire protocol used to negotiate tubes over a peer messaging session.
//!
//! Tubes are never negotiated over their own data path. Every negotiation message travels as an
//! opaque payload of the messaging session that already connects the peers, encoded with the
//! [`ByteRead`](serialize::ByteRead) and [`ByteWrite`](serialize::ByteWrite) traits. The data
//! itself travels over bytestreams, which are opened separately.
//!
//! # Two-party negotiation
//! The offering peer sends a [`TubeRequest::Offer`](messages::TubeRequest) as a request of the
//! messaging session. The offer carries the tube's id, kind, service name and parameters, as well
//! as the address at which the offering peer accepts bytestreams. The receiving peer does not
//! answer until its local application accepts or rejects the tube, at which point it replies
//! with a [`TubeReply`](messages::TubeReply). Either peer may later send a
//! [`TubeRequest::Close`](messages::TubeRequest) for a tube, which is always answered with an
//! empty success reply.
//!
//! # Group announcements
//! Group conversations have no single peer to negotiate with. Instead, every member broadcasts a
//! [`TubeSnapshot`](messages::TubeSnapshot) listing the tubes it takes part in whenever that set
//! changes. Receivers compare each sender's snapshot with what that sender announced before.
//!
//! # Bytestreams
//! Whoever opens a bytestream is the first to talk, and starts by sending a
//! [`StreamInitiation`](messages::StreamInitiation) naming the tube the bytestream belongs to.
//! The other side answers with a [`TubeReply`](messages::TubeReply). If the reply is an error,
//! both sides close the bytestream. Otherwise the bytestream carries raw bytes for stream tubes
//! or a sequence of [`BusMessage`](messages::BusMessage)s for bus tubes, until either side
//! closes it.

/// The version of the tube negotiation protocol.
///
/// Note: This is currently the only version of the protocol.
pub const PROTOCOL_VERSION: u16 = 1;

pub mod messages;
pub mod serialize;
