use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

/// The maximum length of a [`Blob`], in bytes.
pub const MAX_BLOB_LENGTH: usize = 16 * 1024 * 1024;

/// An opaque binary payload, serialized with an [`u32`] length prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl ByteWrite for Blob {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        if self.0.len() > MAX_BLOB_LENGTH {
            return Err(Error::new(ErrorKind::InvalidData, "Blob is too long (> 16MB)"));
        }

        writer.write_u32(self.0.len() as u32).await?;
        writer.write_all(&self.0).await
    }
}

impl ByteRead for Blob {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let len = reader.read_u32().await? as usize;
        if len > MAX_BLOB_LENGTH {
            return Err(Error::new(ErrorKind::InvalidData, "Blob is too long (> 16MB)"));
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Blob(buf))
    }
}
