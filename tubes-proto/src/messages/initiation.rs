use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite};

use super::{Participant, StreamId, TubeId};

/// The first thing written on every new bytestream, binding it to a tube.
///
/// The receiving side answers with a [`TubeReply`](super::TubeReply), after which the
/// bytestream carries the tube's traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInitiation {
    pub tube_id: TubeId,

    /// Who is opening the bytestream.
    pub initiator: Participant,
    pub stream_id: StreamId,
}

impl ByteWrite for StreamInitiation {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.tube_id, &self.initiator, self.stream_id).write(writer).await
    }
}

impl ByteRead for StreamInitiation {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (tube_id, initiator, stream_id) = <(TubeId, Participant, StreamId)>::read(reader).await?;

        Ok(Self {
            tube_id,
            initiator,
            stream_id,
        })
    }
}
