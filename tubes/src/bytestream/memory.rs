//! An in-process bytestream transport, for embedding several participants in one process.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Error, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
};

use async_trait::async_trait;
use tracing::debug;
use tubes_proto::messages::Participant;

use super::{Bytestream, BytestreamConnector, BytestreamSink, BytestreamTarget};

/// The buffer size of each direction of an in-memory bytestream.
pub const PIPE_CAPACITY: usize = 64 * 1024;

const FIRST_PORT: u16 = 20000;

/// A set of participants that reach each other through in-memory pipes.
///
/// Each participant gets a made-up loopback address, so two-party offers can advertise it like
/// any other transport would.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Rc<RefCell<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    addresses: HashMap<Participant, SocketAddr>,
    sinks: HashMap<SocketAddr, Rc<dyn BytestreamSink>>,
    next_port: u16,
}

impl NetworkInner {
    fn address_of(&mut self, participant: &Participant) -> SocketAddr {
        if let Some(address) = self.addresses.get(participant) {
            return *address;
        }

        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), FIRST_PORT.wrapping_add(self.next_port));
        self.next_port = self.next_port.wrapping_add(1);
        self.addresses.insert(participant.clone(), address);
        address
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the connector `participant` opens bytestreams with.
    pub fn connector(&self, participant: &Participant) -> MemoryConnector {
        let address = self.inner.borrow_mut().address_of(participant);
        MemoryConnector {
            network: self.clone(),
            address,
        }
    }

    /// Routes the bytestreams opened to `participant` to `sink`.
    pub fn serve(&self, participant: &Participant, sink: Rc<dyn BytestreamSink>) {
        let mut inner = self.inner.borrow_mut();
        let address = inner.address_of(participant);
        inner.sinks.insert(address, sink);
    }

    /// Makes `participant` unreachable. Bytestreams already open stay open.
    pub fn disconnect(&self, participant: &Participant) {
        let mut inner = self.inner.borrow_mut();
        if let Some(address) = inner.addresses.get(participant).copied() {
            inner.sinks.remove(&address);
        }
    }
}

/// Opens bytestreams within a [`MemoryNetwork`].
pub struct MemoryConnector {
    network: MemoryNetwork,
    address: SocketAddr,
}

#[async_trait(?Send)]
impl BytestreamConnector for MemoryConnector {
    async fn connect(&self, target: &BytestreamTarget) -> io::Result<Bytestream> {
        let sink = {
            let inner = self.network.inner.borrow();
            let address = match target {
                BytestreamTarget::Address(address) => Some(*address),
                BytestreamTarget::Participant(participant) => inner.addresses.get(participant).copied(),
            };

            address.and_then(|address| inner.sinks.get(&address).cloned())
        };

        let sink = sink.ok_or_else(|| Error::new(ErrorKind::ConnectionRefused, format!("nobody listening at {target}")))?;
        debug!(from = %self.address, to = %target, "Opening in-memory bytestream");

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let (far_reader, far_writer) = tokio::io::split(far);
        tokio::task::spawn_local(async move {
            sink.incoming_bytestream(Bytestream::new(far_reader, far_writer)).await;
        });

        let (reader, writer) = tokio::io::split(near);
        Ok(Bytestream::new(reader, writer))
    }

    fn advertised_address(&self) -> SocketAddr {
        self.address
    }
}
