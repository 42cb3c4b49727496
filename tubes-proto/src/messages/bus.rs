use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{Blob, ByteRead, ByteWrite};

/// A message on a bus tube.
///
/// The same framing is used between an application and its local bus relay and between the
/// relays of two peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The bus name of the sender. Filled in by the relay, whatever the application wrote.
    pub sender: String,

    /// The bus name of the recipient, or `None` for a message to every participant.
    pub destination: Option<String>,
    pub body: Blob,
}

impl ByteWrite for BusMessage {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.sender.as_str(), &self.destination, &self.body).write(writer).await
    }
}

impl ByteRead for BusMessage {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (sender, destination, body) = <(String, Option<String>, Blob)>::read(reader).await?;
        Ok(Self {
            sender,
            destination,
            body,
        })
    }
}
