use std::{
    collections::BTreeMap,
    io::{self, Error, ErrorKind},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

impl ByteWrite for BTreeMap<String, String> {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let len = match u16::try_from(self.len()) {
            Ok(len) => len,
            Err(_) => return Err(Error::new(ErrorKind::InvalidData, "Map is too long (>= 64K)")),
        };

        writer.write_u16(len).await?;
        for (key, value) in self.iter() {
            (key, value).write(writer).await?;
        }

        Ok(())
    }
}

impl ByteRead for BTreeMap<String, String> {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let len = reader.read_u16().await? as usize;

        let mut map = BTreeMap::new();
        for _ in 0..len {
            let (key, value) = <(String, String)>::read(reader).await?;
            if map.insert(key, value).is_some() {
                return Err(Error::new(ErrorKind::InvalidData, "Map has a duplicate key"));
            }
        }

        Ok(map)
    }
}
