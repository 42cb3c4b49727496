//! Duplex byte channels to remote peers, over which tube traffic flows.
//!
//! Whoever opens a bytestream writes a [`StreamInitiation`](tubes_proto::messages::StreamInitiation)
//! first, and the receiving side answers with a [`TubeReply`](tubes_proto::messages::TubeReply)
//! before any tube traffic. Transports only move bytes; the initiation is handled by the
//! [`BytestreamSink`] they deliver incoming bytestreams to.

use std::{fmt, io, net::SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tubes_proto::messages::Participant;

pub mod memory;
pub mod quic;

pub use memory::*;
pub use quic::*;

/// The two halves of a bytestream.
pub struct Bytestream {
    pub reader: Box<dyn AsyncRead + Unpin>,
    pub writer: Box<dyn AsyncWrite + Unpin>,
}

impl Bytestream {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for Bytestream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bytestream").finish_non_exhaustive()
    }
}

/// Where to open a bytestream to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BytestreamTarget {
    /// An address advertised in a two-party offer.
    Address(SocketAddr),

    /// A member of a group, reached however the transport knows to reach it.
    Participant(Participant),
}

impl fmt::Display for BytestreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => address.fmt(f),
            Self::Participant(participant) => participant.fmt(f),
        }
    }
}

/// Opens bytestreams to remote peers.
#[async_trait(?Send)]
pub trait BytestreamConnector {
    async fn connect(&self, target: &BytestreamTarget) -> io::Result<Bytestream>;

    /// The address remote peers can open bytestreams to us at.
    fn advertised_address(&self) -> SocketAddr;
}

/// Takes the bytestreams remote peers open to us.
#[async_trait(?Send)]
pub trait BytestreamSink {
    /// Handles a bytestream opened by a remote peer, from its initiation to its end.
    async fn incoming_bytestream(&self, bytestream: Bytestream);
}
