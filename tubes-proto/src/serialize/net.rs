use std::{
    io::{self, Error, ErrorKind},
    net::{SocketAddr, SocketAddrV4, SocketAddrV6},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

/// A [`SocketAddr`] is written as a family byte (4 or 6), the address octets and the port.
/// IPv6 addresses are followed by their flowinfo and scope_id.
impl ByteWrite for SocketAddr {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            SocketAddr::V4(v4) => {
                writer.write_u8(4).await?;
                writer.write_all(&v4.ip().octets()).await?;
                writer.write_u16(v4.port()).await
            }
            SocketAddr::V6(v6) => {
                writer.write_u8(6).await?;
                writer.write_all(&v6.ip().octets()).await?;
                writer.write_u16(v6.port()).await?;
                writer.write_u32(v6.flowinfo()).await?;
                writer.write_u32(v6.scope_id()).await
            }
        }
    }
}

impl ByteRead for SocketAddr {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(SocketAddr::V4(SocketAddrV4::new(octets.into(), port)))
            }
            6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                let flowinfo = reader.read_u32().await?;
                let scope_id = reader.read_u32().await?;
                Ok(SocketAddr::V6(SocketAddrV6::new(octets.into(), port, flowinfo, scope_id)))
            }
            v => Err(Error::new(ErrorKind::InvalidData, format!("Invalid socket address type, {v}"))),
        }
    }
}
