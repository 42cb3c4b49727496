use std::{fmt, io};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{read_u8_repr, ByteRead, ByteWrite, U8ReprEnum};

/// The answer to a [`TubeRequest`](super::TubeRequest) or to a
/// [`StreamInitiation`](super::StreamInitiation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TubeReply {
    pub result: Result<(), Rejection>,
}

impl TubeReply {
    pub const fn ok() -> Self {
        Self { result: Ok(()) }
    }

    pub fn rejected<M: Into<String>>(reason: RejectReason, message: M) -> Self {
        Self {
            result: Err(Rejection::new(reason, message)),
        }
    }
}

impl ByteWrite for TubeReply {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.result.write(writer).await
    }
}

impl ByteRead for TubeReply {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            result: <Result<(), Rejection>>::read(reader).await?,
        })
    }
}

/// Why a request was refused.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The request couldn't be parsed or is missing a required field.
    Malformed = 0,

    /// The offered tube id is already in use in this conversation.
    IdCollision = 1,

    /// The application declined the offered tube.
    Declined = 2,

    /// The request names a tube this peer doesn't know about.
    UnknownTube = 3,

    /// The tube exists but isn't in a state that allows the request.
    NotOpen = 4,
}

impl U8ReprEnum for RejectReason {
    const NAME: &'static str = "RejectReason";

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Malformed),
            1 => Some(Self::IdCollision),
            2 => Some(Self::Declined),
            3 => Some(Self::UnknownTube),
            4 => Some(Self::NotOpen),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed request"),
            Self::IdCollision => write!(f, "tube id collision"),
            Self::Declined => write!(f, "declined"),
            Self::UnknownTube => write!(f, "unknown tube"),
            Self::NotOpen => write!(f, "tube not open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
}

impl Rejection {
    pub fn new<M: Into<String>>(reason: RejectReason, message: M) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            self.reason.fmt(f)
        } else {
            write!(f, "{}: {}", self.reason, self.message)
        }
    }
}

impl ByteWrite for Rejection {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.reason.into_u8(), self.message.as_str()).write(writer).await
    }
}

impl ByteRead for Rejection {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let reason = read_u8_repr(reader).await?;
        let message = String::read(reader).await?;
        Ok(Self { reason, message })
    }
}
