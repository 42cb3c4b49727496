//! Exposes open tubes as local sockets.
//!
//! Every tube owns a [`TubeBridge`] holding its listening socket, the tasks serving it and the
//! tasks of its live connections. Dropping the bridge (which happens when the tube is closed)
//! aborts all of them.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use tokio::{sync::oneshot, task::AbortHandle};
use tracing::{debug, warn};
use tubes_proto::messages::{StreamId, TubeId};
use tubes_sm::{Tube, TubeError};

use crate::{conversation::Shared, Error};

mod bus;
mod local;
mod stream;

pub(crate) use bus::*;
pub use local::*;
pub(crate) use stream::*;

/// The IO resources of one tube.
#[derive(Default)]
pub(crate) struct TubeBridge {
    /// Where connections to a stream tube we offered are forwarded.
    pub(crate) service: Option<LocalAddress>,

    /// Where the peer that offered us a tube accepts bytestreams.
    pub(crate) remote_address: Option<SocketAddr>,

    /// Answers the offer of a tube still waiting for the application to accept it.
    pub(crate) responder: Option<oneshot::Sender<Vec<u8>>>,

    /// The local socket bound for this tube.
    pub(crate) local_address: Option<LocalAddress>,

    /// The relay socket of a bus tube we offered, bound up front and served once it opens.
    pub(crate) relay_listener: Option<LocalListener>,
    pub(crate) relay: Option<BusRelay>,
    tasks: Vec<AbortHandle>,
    connections: HashMap<u64, AbortHandle>,
    next_key: u64,
}

impl TubeBridge {
    pub(crate) fn offering_stream(service: LocalAddress) -> Self {
        let mut bridge = Self::default();
        bridge.service = Some(service);
        bridge
    }

    pub(crate) fn offering_bus(listener: LocalListener) -> Result<Self, Error> {
        let mut bridge = Self::default();
        bridge.local_address = Some(listener.local_address()?);
        bridge.relay_listener = Some(listener);
        Ok(bridge)
    }

    pub(crate) fn incoming(responder: oneshot::Sender<Vec<u8>>, remote_address: SocketAddr) -> Self {
        let mut bridge = Self::default();
        bridge.responder = Some(responder);
        bridge.remote_address = Some(remote_address);
        bridge
    }

    pub(crate) fn track_task(&mut self, task: AbortHandle) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(task);
    }

    fn next_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }
}

impl fmt::Debug for TubeBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TubeBridge")
            .field("service", &self.service)
            .field("local_address", &self.local_address)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl Drop for TubeBridge {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        for (_, connection) in self.connections.drain() {
            connection.abort();
        }

        if let Some(LocalAddress::Unix(path)) = &self.local_address {
            if std::fs::remove_file(path).is_ok() {
                debug!(path = %path.display(), "Removed local socket");
            }
        }
    }
}

fn bridge_mut<R>(tube: &mut Tube<R>) -> Option<&mut R>
where
    R: Default,
{
    if tube.resources().is_none() {
        tube.set_resources(R::default());
    }

    tube.resources_mut()
}

/// Counts a live connection for as long as it's alive.
struct ConnectionGuard {
    shared: Weak<Shared>,
    tube_id: TubeId,
    key: u64,
}

impl ConnectionGuard {
    fn register(shared: &Rc<Shared>, tube_id: TubeId, stream_id: StreamId) -> Result<Self, Error> {
        let key = shared.with_tubes(|tubes| {
            tubes.connection_opened(tube_id, stream_id)?;
            let tube = tubes.tube_mut(tube_id).ok_or(TubeError::UnknownTube(tube_id))?;
            Ok::<_, TubeError>(bridge_mut(tube).map_or(0, TubeBridge::next_key))
        })?;

        shared.after_change();
        Ok(Self {
            shared: Rc::downgrade(shared),
            tube_id,
            key,
        })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        if end_connection(&shared, self.tube_id, self.key) {
            shared.after_change();
        } else {
            warn!(tube_id = %self.tube_id, "Tube set busy when a connection ended, deferring its cleanup");
            shared.deferred_ends.borrow_mut().push((self.tube_id, self.key));
        }
    }
}

/// Stops counting a connection. Returns false, changing nothing, if the tube set is borrowed.
fn end_connection(shared: &Shared, tube_id: TubeId, key: u64) -> bool {
    let Ok(mut tubes) = shared.tubes.try_borrow_mut() else {
        return false;
    };

    if let Some(bridge) = tubes.tube_mut(tube_id).and_then(Tube::resources_mut) {
        bridge.connections.remove(&key);
    }

    let closed = tubes.connection_closed(tube_id);
    drop(tubes);
    drop(closed);

    debug!(%tube_id, "Connection closed");
    true
}

/// Applies the connection ends that couldn't be applied when they happened.
pub(crate) fn end_deferred_connections(shared: &Shared) {
    let deferred = shared.deferred_ends.take();
    for (tube_id, key) in deferred {
        if !end_connection(shared, tube_id, key) {
            shared.deferred_ends.borrow_mut().push((tube_id, key));
        }
    }
}

/// Runs `connection` as a live connection of a tube. It's aborted if the tube is closed first.
pub(crate) fn spawn_connection<F>(shared: &Rc<Shared>, tube_id: TubeId, stream_id: StreamId, connection: F) -> Result<(), Error>
where
    F: Future<Output = ()> + 'static,
{
    let guard = ConnectionGuard::register(shared, tube_id, stream_id)?;
    let key = guard.key;

    let task = tokio::task::spawn_local(async move {
        let _guard = guard;
        connection.await;
    });

    shared.with_tubes(|tubes| {
        match tubes.tube_mut(tube_id).and_then(Tube::resources_mut) {
            Some(bridge) => {
                bridge.connections.insert(key, task.abort_handle());
            }
            None => task.abort(),
        }
    });

    Ok(())
}

/// Attaches a task serving a tube, such as its listener, so it's aborted with the tube.
pub(crate) fn track_task(shared: &Shared, tube_id: TubeId, task: AbortHandle) {
    shared.with_tubes(|tubes| match tubes.tube_mut(tube_id).and_then(bridge_mut) {
        Some(bridge) => bridge.track_task(task),
        None => task.abort(),
    });
}
