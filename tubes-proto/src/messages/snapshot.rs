use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite};

use super::{Parameters, Participant, StreamId, TubeId, TubeKind};

/// The set of tubes a group member announces, broadcast whenever its tube set changes.
///
/// A snapshot always describes everything its sender takes part in; a tube missing from it
/// means the sender no longer takes part in that tube.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TubeSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl TubeSnapshot {
    pub fn entry(&self, tube_id: TubeId) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.tube_id == tube_id)
    }
}

impl ByteWrite for TubeSnapshot {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.entries.write(writer).await
    }
}

impl ByteRead for TubeSnapshot {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            entries: Vec::read(reader).await?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub tube_id: TubeId,
    pub kind: TubeKind,
    pub service: String,
    pub initiator: Participant,
    pub parameters: Parameters,

    /// The sender's own name on a bus tube. `None` for stream tubes.
    pub bus_name: Option<String>,

    /// The stream on which the sender takes bus traffic. `None` for stream tubes.
    pub stream_id: Option<StreamId>,
}

impl ByteWrite for SnapshotEntry {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.tube_id, self.kind, self.service.as_str(), &self.initiator).write(writer).await?;
        (&self.parameters, &self.bus_name, &self.stream_id).write(writer).await
    }
}

impl ByteRead for SnapshotEntry {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (tube_id, kind, service, initiator) = <(TubeId, TubeKind, String, Participant)>::read(reader).await?;
        let (parameters, bus_name, stream_id) = <(Parameters, Option<String>, Option<StreamId>)>::read(reader).await?;

        Ok(Self {
            tube_id,
            kind,
            service,
            initiator,
            parameters,
            bus_name,
            stream_id,
        })
    }
}
