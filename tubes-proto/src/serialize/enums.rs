//! `Option` and `Result` on the wire: a presence byte followed by the value, if any.
//!
//! The presence byte must be `0` or `1`. Anything else means the message is corrupt, since no
//! field of a tube message is ever encoded differently.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

async fn read_presence<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<bool> {
    match reader.read_u8().await? {
        ABSENT => Ok(false),
        PRESENT => Ok(true),
        other => Err(Error::new(ErrorKind::InvalidData, format!("Invalid presence byte {other}"))),
    }
}

impl<T: ByteWrite> ByteWrite for Option<T> {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let Some(value) = self else {
            return writer.write_u8(ABSENT).await;
        };

        writer.write_u8(PRESENT).await?;
        value.write(writer).await
    }
}

impl<T: ByteRead> ByteRead for Option<T> {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        if !read_presence(reader).await? {
            return Ok(None);
        }

        T::read(reader).await.map(Some)
    }
}

/// `Ok` is written as present, `Err` as absent, each followed by its payload.
impl<T: ByteWrite, E: ByteWrite> ByteWrite for Result<T, E> {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Ok(value) => {
                writer.write_u8(PRESENT).await?;
                value.write(writer).await
            }
            Err(error) => {
                writer.write_u8(ABSENT).await?;
                error.write(writer).await
            }
        }
    }
}

impl<T: ByteRead, E: ByteRead> ByteRead for Result<T, E> {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        match read_presence(reader).await? {
            true => T::read(reader).await.map(Ok),
            false => E::read(reader).await.map(Err),
        }
    }
}
