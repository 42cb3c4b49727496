use std::{fmt, io};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{read_u8_repr, ByteRead, ByteWrite, U8ReprEnum};

/// The kind of traffic a tube carries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TubeKind {
    /// Raw, unframed bytes, bridged to a local listening socket.
    Stream = 0,

    /// Addressable bus messages, bridged through a local relay.
    Bus = 1,
}

impl fmt::Display for TubeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Bus => write!(f, "bus"),
        }
    }
}

impl U8ReprEnum for TubeKind {
    const NAME: &'static str = "TubeKind";

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Stream),
            1 => Some(Self::Bus),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for TubeKind {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.into_u8().write(writer).await
    }
}

impl ByteRead for TubeKind {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        read_u8_repr(reader).await
    }
}
