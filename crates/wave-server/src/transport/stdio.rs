use wave_rpc::{RpcEndpoint, StreamSink, StreamSource};

use crate::error::ServerResult;
use crate::server::WaveServer;

/// Route id of the peer on the other end of stdin/stdout.
pub const STDIO_ROUTE: &str = "stdio";

/// Serve the parent process over stdin/stdout. The parent launched us, so
/// it is trusted without a token.
pub fn attach(server: &WaveServer) -> ServerResult<RpcEndpoint> {
    let source = StreamSource::new(tokio::io::stdin());
    let sink = StreamSink::new(tokio::io::stdout());
    server.attach_trusted_peer(source, sink, STDIO_ROUTE)
}
