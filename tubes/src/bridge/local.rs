//! Local sockets: where applications connect to reach an open tube, and where offered stream
//! tubes deliver their connections.

use std::{
    fmt,
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
};
use tracing::{debug, warn};

use crate::Error;

/// The address of a local socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(address) => write!(f, "tcp:{address}"),
        }
    }
}

impl LocalAddress {
    /// Checks that this address only reaches this machine.
    pub fn check_local(&self) -> Result<(), Error> {
        match self {
            Self::Unix(_) => Ok(()),
            Self::Tcp(address) if address.ip().is_loopback() => Ok(()),
            Self::Tcp(address) => Err(Error::NotLocal(address.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketFamily {
    Unix,
    Ipv4,
    Ipv6,
}

impl fmt::Display for SocketFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix => write!(f, "unix"),
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Who may connect to a local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketAccess {
    /// Anyone on this machine.
    Localhost,

    /// Only TCP connections coming from this source port.
    Port(u16),
}

impl fmt::Display for SocketAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Localhost => write!(f, "localhost"),
            Self::Port(port) => write!(f, "port {port}"),
        }
    }
}

/// Fails if a family can't enforce an access control.
pub fn check_supported(family: SocketFamily, access: SocketAccess) -> Result<(), Error> {
    match (family, access) {
        (SocketFamily::Unix, SocketAccess::Port(_)) => Err(Error::UnsupportedSocket { family, access }),
        _ => Ok(()),
    }
}

/// A listening local socket. A Unix socket's file is removed when the listener is dropped.
#[derive(Debug)]
pub enum LocalListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp { listener: TcpListener, access: SocketAccess },
}

impl LocalListener {
    /// Binds a new local socket. Unix sockets are created in `dir`, with a name starting with
    /// `name`.
    pub fn bind(family: SocketFamily, access: SocketAccess, dir: &Path, name: &str) -> Result<Self, Error> {
        check_supported(family, access)?;

        let listener = match family {
            SocketFamily::Unix => {
                let path = dir.join(format!("{name}-{:08x}", rand::random::<u32>()));
                remove_stale_socket(&path)?;
                let listener = UnixListener::bind(&path)?;
                Self::Unix { listener, path }
            }
            SocketFamily::Ipv4 => Self::bind_tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), access)?,
            SocketFamily::Ipv6 => Self::bind_tcp(IpAddr::V6(Ipv6Addr::LOCALHOST), access)?,
        };

        debug!(address = %listener.local_address()?, "Bound local socket");
        Ok(listener)
    }

    fn bind_tcp(ip: IpAddr, access: SocketAccess) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(SocketAddr::new(ip, 0))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        Ok(Self::Tcp { listener, access })
    }

    pub fn local_address(&self) -> io::Result<LocalAddress> {
        match self {
            Self::Unix { path, .. } => Ok(LocalAddress::Unix(path.clone())),
            Self::Tcp { listener, .. } => Ok(LocalAddress::Tcp(listener.local_addr()?)),
        }
    }

    /// Waits for the next connection allowed by the access control.
    pub async fn accept(&self) -> io::Result<LocalStream> {
        match self {
            Self::Unix { listener, .. } => Ok(LocalStream::Unix(listener.accept().await?.0)),
            Self::Tcp { listener, access } => loop {
                let (stream, from) = listener.accept().await?;
                match access {
                    SocketAccess::Port(port) if from.port() != *port => {
                        warn!(%from, expected_port = port, "Refusing local connection from an unexpected port");
                    }
                    _ => return Ok(LocalStream::Tcp(stream)),
                }
            },
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            if let Err(error) = std::fs::remove_file(path.as_path()) {
                if error.kind() != ErrorKind::NotFound {
                    debug!(path = %path.display(), "Couldn't remove local socket: {error}");
                }
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(error) if error.kind() != ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

/// A connected local socket.
#[derive(Debug)]
pub enum LocalStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl LocalStream {
    pub async fn connect(address: &LocalAddress) -> io::Result<Self> {
        match address {
            LocalAddress::Unix(path) => Ok(Self::Unix(UnixStream::connect(path).await?)),
            LocalAddress::Tcp(address) => Ok(Self::Tcp(TcpStream::connect(address).await?)),
        }
    }

    pub fn into_split(self) -> (Box<dyn AsyncRead + Unpin>, Box<dyn AsyncWrite + Unpin>) {
        match self {
            Self::Unix(stream) => {
                let (read_half, write_half) = stream.into_split();
                (Box::new(read_half), Box::new(write_half))
            }
            Self::Tcp(stream) => {
                let (read_half, write_half) = stream.into_split();
                (Box::new(read_half), Box::new(write_half))
            }
        }
    }
}
