//! Tubes: stream and bus tunnels between the participants of a conversation.
//!
//! A [`Conversation`] negotiates tubes over a [`MessagingSession`], either with one remote peer
//! (offers answered with a reply) or with a group (snapshots broadcast to every member), and
//! exposes every open tube as a local socket. Tube traffic flows over bytestreams opened with
//! a [`BytestreamConnector`], such as [`QuicBytestreams`].
//!
//! Everything here is single-threaded: conversations and transports must run inside a
//! [`LocalSet`](tokio::task::LocalSet) on a current-thread runtime.

pub mod bridge;
pub mod bytestream;
pub mod config;
pub mod conversation;
pub mod endpoint;
pub mod error;
pub mod session;

pub use bridge::{LocalAddress, LocalListener, LocalStream, SocketAccess, SocketFamily};
pub use bytestream::{Bytestream, BytestreamConnector, BytestreamSink, BytestreamTarget, MemoryNetwork, QuicBytestreams};
pub use config::TubesConfig;
pub use conversation::{Conversation, TubeEvents};
pub use error::Error;
pub use session::{GroupMembership, MessagingSession};

pub use tubes_proto::messages::{BusMessage, Parameters, Participant, StreamId, TubeId, TubeKind};
pub use tubes_proto::serialize::Blob;
pub use tubes_sm::{bus_name_for, CloseReason, RosterChange, TubeError, TubeEvent, TubeInfo, TubeState};
