use std::io;
use std::path::Path;

use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use wave_rpc::split_stream;

use super::{run_connection, ConnectionLimit};
use crate::server::WaveServer;

/// Bind the domain socket, replacing a stale socket file left behind by a
/// previous run.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Accept domain socket peers until shutdown. Peers start unauthenticated.
pub async fn accept_loop(listener: UnixListener, server: WaveServer) {
    let limit = ConnectionLimit::new(server.config().max_connections);
    let mut shutdown = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("domain socket listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let Some(guard) = limit.try_acquire() else {
                        warn!(max = limit.max(), "rejecting domain socket connection: at capacity");
                        continue;
                    };
                    let name = server.peer_name("unix");
                    debug!(peer = %name, "domain socket connection");
                    let (source, sink) = split_stream(stream);
                    let endpoint = server.attach_peer(source, sink, name);
                    tokio::spawn(run_connection(endpoint, server.shutdown_signal(), guard));
                }
                Err(e) => error!(error = %e, "domain socket accept failed"),
            }
        }
    }
}
