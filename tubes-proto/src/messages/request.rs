use std::{io, net::SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{read_u8_repr, ByteRead, ByteWrite, U8ReprEnum};

use super::{Parameters, TubeId, TubeKind};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TubeRequestType {
    Offer = 0,
    Close = 1,
}

impl U8ReprEnum for TubeRequestType {
    const NAME: &'static str = "TubeRequest";

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Offer),
            1 => Some(Self::Close),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

/// A request sent to the remote peer of a two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TubeRequest {
    /// Offers a new tube. Answered once the remote application accepts or rejects it.
    Offer(TubeOffer),

    /// Closes a tube, whatever its state. Always answered with success.
    Close(TubeId),
}

impl ByteWrite for TubeRequest {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Offer(offer) => (TubeRequestType::Offer.into_u8(), offer).write(writer).await,
            Self::Close(tube_id) => (TubeRequestType::Close.into_u8(), tube_id).write(writer).await,
        }
    }
}

impl ByteRead for TubeRequest {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        match read_u8_repr::<TubeRequestType, R>(reader).await? {
            TubeRequestType::Offer => Ok(Self::Offer(TubeOffer::read(reader).await?)),
            TubeRequestType::Close => Ok(Self::Close(TubeId::read(reader).await?)),
        }
    }
}

/// Offers a tube to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TubeOffer {
    pub tube_id: TubeId,
    pub kind: TubeKind,
    pub service: String,
    pub parameters: Parameters,

    /// The address at which the offering peer accepts bytestreams for this tube.
    pub bytestream_address: SocketAddr,
}

impl ByteWrite for TubeOffer {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.tube_id, self.kind, self.service.as_str()).write(writer).await?;
        (&self.parameters, self.bytestream_address).write(writer).await
    }
}

impl ByteRead for TubeOffer {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let tube_id = TubeId::read(reader).await?;
        let kind = TubeKind::read(reader).await?;
        let service = String::read(reader).await?;
        let parameters = Parameters::read(reader).await?;
        let bytestream_address = SocketAddr::read(reader).await?;

        Ok(Self {
            tube_id,
            kind,
            service,
            parameters,
            bytestream_address,
        })
    }
}
