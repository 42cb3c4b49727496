use std::{io, rc::Weak};

use tokio::{io::AsyncWriteExt, try_join};
use tracing::{debug, info, warn};
use tubes_proto::{
    messages::{StreamInitiation, TubeId, TubeReply},
    serialize::{ByteRead, ByteWrite},
};
use tubes_sm::TubeSet;

use crate::{
    bytestream::{Bytestream, BytestreamConnector, BytestreamTarget},
    conversation::Shared,
    Error,
};

use super::{spawn_connection, track_task, LocalListener, LocalStream};

/// Opens a bytestream for a tube and waits for the remote side to take it.
pub(crate) async fn initiate(
    connector: &dyn BytestreamConnector,
    target: &BytestreamTarget,
    initiation: &StreamInitiation,
) -> Result<Bytestream, Error> {
    let mut bytestream = connector.connect(target).await?;
    initiation.write(&mut bytestream.writer).await?;
    bytestream.writer.flush().await?;

    let reply = TubeReply::read(&mut bytestream.reader).await?;
    match reply.result {
        Ok(()) => Ok(bytestream),
        Err(rejection) => Err(Error::Negotiation(rejection.to_string())),
    }
}

/// Copies bytes both ways between a local connection and a bytestream until both directions
/// are done.
pub(crate) async fn pump(local: LocalStream, bytestream: Bytestream) -> io::Result<()> {
    let (mut read_half, mut write_half) = local.into_split();
    let Bytestream { mut reader, mut writer } = bytestream;

    let (sent, received) = try_join!(
        async {
            let sent = tokio::io::copy(&mut read_half, &mut writer).await?;
            writer.shutdown().await?;
            Ok::<_, io::Error>(sent)
        },
        async {
            let received = tokio::io::copy(&mut reader, &mut write_half).await?;
            write_half.shutdown().await?;
            Ok::<_, io::Error>(received)
        },
    )?;

    debug!(sent, received, "Connection finished");
    Ok(())
}

/// Serves the local socket of a stream tube we accepted: every local connection gets its own
/// bytestream to the participant that offered the tube. A connection only counts as live once
/// its bytestream was taken.
pub(crate) async fn serve_stream_listener(shared: Weak<Shared>, tube_id: TubeId, listener: LocalListener, target: BytestreamTarget) {
    info!(%tube_id, address = ?listener.local_address().ok(), "Serving stream tube");

    loop {
        let local = match listener.accept().await {
            Ok(local) => local,
            Err(error) => {
                warn!(%tube_id, "Stopped accepting local connections: {error}");
                return;
            }
        };

        let Some(conversation) = shared.upgrade() else {
            return;
        };

        let stream_id = conversation.with_tubes(TubeSet::new_stream_id);
        let initiation = StreamInitiation {
            tube_id,
            initiator: conversation.self_handle.clone(),
            stream_id,
        };

        let connector = conversation.connector.clone();
        let target = target.clone();
        let weak = shared.clone();
        let task = tokio::task::spawn_local(async move {
            let bytestream = match initiate(connector.as_ref(), &target, &initiation).await {
                Ok(bytestream) => bytestream,
                Err(error) => {
                    warn!(%tube_id, %target, "Couldn't open bytestream: {error}");
                    return;
                }
            };

            let Some(conversation) = weak.upgrade() else {
                return;
            };

            let connection = async move {
                if let Err(error) = pump(local, bytestream).await {
                    debug!(%tube_id, "Connection ended with error: {error}");
                }
            };

            if let Err(error) = spawn_connection(&conversation, tube_id, stream_id, connection) {
                debug!(%tube_id, "Dropping connection: {error}");
            }
        });

        track_task(&conversation, tube_id, task.abort_handle());
    }
}
