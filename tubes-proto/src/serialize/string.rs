use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

impl ByteWrite for str {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let bytes = self.as_bytes();
        let len = match u16::try_from(bytes.len()) {
            Ok(len) => len,
            Err(_) => return Err(Error::new(ErrorKind::InvalidData, "String is too long (>= 64KB)")),
        };

        writer.write_u16(len).await?;
        writer.write_all(bytes).await
    }
}

impl ByteWrite for String {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.as_str().write(writer).await
    }
}

impl ByteRead for String {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let len = reader.read_u16().await? as usize;

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        String::from_utf8(buf).map_err(|_| Error::new(ErrorKind::InvalidData, "String is not valid UTF-8"))
    }
}
