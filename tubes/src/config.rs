use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
};

use crate::bridge::SocketFamily;

/// The address bytestream transports bind to by default: any port on the IPv4 loopback.
pub const DEFAULT_BYTESTREAM_BIND: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));

/// How many removed tube ids are kept out of circulation by default.
pub const DEFAULT_ID_REUSE_WINDOW: usize = 256;

/// Settings shared by the conversations of an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TubesConfig {
    /// The socket family of the local relays created for bus tubes we offer.
    pub socket_family: SocketFamily,

    /// Where Unix sockets are created. `None` means the system's temporary directory.
    pub socket_dir: Option<PathBuf>,

    /// How many recently removed tube ids may not be handed out again.
    pub id_reuse_window: usize,

    /// Where bytestream transports built from this configuration listen.
    pub bytestream_bind: SocketAddr,
}

impl TubesConfig {
    pub const fn new() -> Self {
        Self {
            socket_family: SocketFamily::Unix,
            socket_dir: None,
            id_reuse_window: DEFAULT_ID_REUSE_WINDOW,
            bytestream_bind: DEFAULT_BYTESTREAM_BIND,
        }
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for TubesConfig {
    fn default() -> Self {
        Self::new()
    }
}
