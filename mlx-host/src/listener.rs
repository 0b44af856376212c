//! Host listener (§4.5): bind the local socket, accept connections, wire
//! each into a fresh connection + dispatcher pair. Accept is serialized;
//! handling each connection is not.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::Instrument;

use crate::config::HostConfig;
use crate::connection;
use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::error::Error;

pub async fn run<E: Engine + 'static>(config: HostConfig, engine: Arc<E>) -> Result<(), Error> {
    let path = config.socket_path.clone();
    remove_stale_socket(&path)?;

    let listener = UnixListener::bind(&path).map_err(|source| Error::Bind { path: path.display().to_string(), source })?;
    restrict_permissions(&path)?;

    tracing::info!(socket = %path.display(), "mlx-host listening");

    let next_id = AtomicU64::new(1);

    loop {
        let (stream, _addr) = listener.accept().await?;
        let id = next_id.fetch_add(1, Ordering::SeqCst);

        let engine = engine.clone();
        let auth_token = config.auth_token.clone();
        let max_frame_bytes = config.max_frame_bytes;
        let max_queued_bytes = config.max_queued_bytes;

        tokio::spawn(
            async move {
                tracing::debug!("accepted connection");
                let accepted = connection::spawn(stream, id, max_frame_bytes, max_queued_bytes);
                let dispatcher = Dispatcher::new(engine, accepted.handle, auth_token);

                let mut inbound = accepted.inbound;
                while let Some(env) = inbound.recv().await {
                    dispatcher.dispatch(env);
                }
                dispatcher.shutdown().await;
                tracing::debug!("connection closed");
            }
            .instrument(tracing::info_span!("conn", id)),
        );
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Restrict the socket file to the local user (§9 Security).
fn restrict_permissions(path: &Path) -> Result<(), Error> {
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}
