use std::io;

use tubes_sm::TubeError;

use crate::bridge::{SocketAccess, SocketFamily};

/// Errors returned by [`Conversation`](crate::Conversation) operations and the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Tube(#[from] TubeError),

    #[error("{family} sockets don't support {access} access control")]
    UnsupportedSocket { family: SocketFamily, access: SocketAccess },

    #[error("{0} is not a local socket address")]
    NotLocal(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("the conversation is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
