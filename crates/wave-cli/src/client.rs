use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::debug;

use wave_protocol::methods::{self, AuthenticateRequest, AuthenticateResponse};
use wave_pubsub::WaveEvent;
use wave_rpc::{split_stream, CallContext, EndpointConfig, MethodTable, RpcEndpoint, RpcOpts};

/// Events buffered between the connection and the printer.
const EVENT_BUFFER: usize = 64;

/// An authenticated connection to a running backend.
pub struct WaveClient {
    endpoint: RpcEndpoint,
    events: mpsc::Receiver<WaveEvent>,
    route_id: String,
}

impl WaveClient {
    pub async fn connect(socket: &Path, token: &str) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("connecting to {}", socket.display()))?;
        let (source, sink) = split_stream(stream);

        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let table = MethodTable::new().unary(methods::EVENT_RECV, move |_ctx: CallContext, event: WaveEvent| {
            let tx = tx.clone();
            async move {
                // the receiver is gone once the command stops listening
                let _ = tx.send(event).await;
                Ok(())
            }
        });
        // the backend is the one side we trust unconditionally
        let endpoint = RpcEndpoint::spawn(
            source,
            sink,
            Arc::new(table),
            EndpointConfig::named("wavesrv").trusted(),
        );

        let resp: AuthenticateResponse = endpoint
            .call(
                methods::AUTHENTICATE,
                &AuthenticateRequest {
                    token: token.to_string(),
                },
                RpcOpts::default(),
            )
            .await
            .context("authenticating")?;
        debug!(route = %resp.route_id, "authenticated");
        Ok(Self {
            endpoint,
            events,
            route_id: resp.route_id,
        })
    }

    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Next pushed event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<WaveEvent> {
        tokio::select! {
            event = self.events.recv() => event,
            _ = self.endpoint.closed() => None,
        }
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}
