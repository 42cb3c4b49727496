//! A bytestream transport over QUIC: one connection per remote address, one bidirectional
//! stream per bytestream.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Error, ErrorKind},
    net::SocketAddr,
    rc::Rc,
};

use async_trait::async_trait;
use quinn::{Connecting, Connection, Endpoint, VarInt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tubes_proto::messages::Participant;

use crate::endpoint::{make_endpoint, SERVER_NAME};

use super::{Bytestream, BytestreamConnector, BytestreamSink, BytestreamTarget};

pub struct QuicBytestreams {
    endpoint: Endpoint,
    advertised_address: SocketAddr,
    connections: RefCell<HashMap<SocketAddr, Connection>>,
    peers: RefCell<HashMap<Participant, SocketAddr>>,
}

impl QuicBytestreams {
    /// Binds a QUIC endpoint at `address`. The address actually bound is the one advertised.
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(address)?;
        let advertised_address = socket.local_addr()?;
        let endpoint = make_endpoint(socket)?;

        Ok(Self {
            endpoint,
            advertised_address,
            connections: RefCell::new(HashMap::new()),
            peers: RefCell::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Records where a group member can be reached.
    pub fn add_peer(&self, participant: Participant, address: SocketAddr) {
        self.peers.borrow_mut().insert(participant, address);
    }

    /// Starts accepting connections, handing every bytestream opened on them to `sink`.
    pub fn serve(&self, sink: Rc<dyn BytestreamSink>) -> JoinHandle<()> {
        tokio::task::spawn_local(accept_bytestreams(self.endpoint.clone(), sink))
    }

    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"Closing");
    }

    async fn connection(&self, address: SocketAddr) -> io::Result<Connection> {
        let cached = self.connections.borrow().get(&address).cloned();
        if let Some(connection) = cached {
            if connection.close_reason().is_none() {
                return Ok(connection);
            }
        }

        let connecting = self
            .endpoint
            .connect(address, SERVER_NAME)
            .map_err(|error| Error::new(ErrorKind::Other, error))?;

        let connection = connecting.await?;
        debug!(%address, "Connected bytestream transport");
        self.connections.borrow_mut().insert(address, connection.clone());
        Ok(connection)
    }
}

#[async_trait(?Send)]
impl BytestreamConnector for QuicBytestreams {
    async fn connect(&self, target: &BytestreamTarget) -> io::Result<Bytestream> {
        let address = match target {
            BytestreamTarget::Address(address) => *address,
            BytestreamTarget::Participant(participant) => self
                .peers
                .borrow()
                .get(participant)
                .copied()
                .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no known address for {participant}")))?,
        };

        let connection = self.connection(address).await?;
        let (send_stream, recv_stream) = connection.open_bi().await?;
        Ok(Bytestream::new(recv_stream, send_stream))
    }

    fn advertised_address(&self) -> SocketAddr {
        self.advertised_address
    }
}

/// Accepts connections on `endpoint` until it's closed.
pub async fn accept_bytestreams(endpoint: Endpoint, sink: Rc<dyn BytestreamSink>) {
    info!(address = ?endpoint.local_addr().ok(), "Accepting bytestreams");

    while let Some(incoming_connection) = endpoint.accept().await {
        debug!(from = %incoming_connection.remote_address(), "Incoming bytestream connection");
        let sink = Rc::clone(&sink);
        tokio::task::spawn_local(async move {
            handle_connection(incoming_connection, sink).await;
        });
    }

    info!("Bytestream endpoint closed");
}

async fn handle_connection(incoming_connection: Connecting, sink: Rc<dyn BytestreamSink>) {
    let connection = match incoming_connection.await {
        Ok(c) => c,
        Err(connection_error) => {
            warn!("Failed to accept incoming connection: {connection_error}");
            return;
        }
    };

    loop {
        let (send_stream, recv_stream) = match connection.accept_bi().await {
            Ok(v) => v,
            Err(error) => {
                debug!(from = %connection.remote_address(), "Stopped accepting bytestreams: {error}");
                break;
            }
        };

        let sink = Rc::clone(&sink);
        tokio::task::spawn_local(async move {
            sink.incoming_bytestream(Bytestream::new(recv_stream, send_stream)).await;
        });
    }
}
