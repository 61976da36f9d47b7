use std::io;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use wave_protocol::{ProtocolError, ProtocolResult, RpcMessage, WaveCodec, MAX_MESSAGE_SIZE};
use wave_rpc::{FrameSink, FrameSource};

use super::{run_connection, ConnectionGuard};
use crate::server::WaveServer;

/// Websocket frames in, one JSON message per text frame.
pub struct WsSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> ProtocolResult<Option<RpcMessage>> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(|e| ProtocolError::Io(io::Error::other(e)))? {
                Message::Text(text) => return WaveCodec::decode_text(&text).map(Some),
                Message::Binary(data) => return WaveCodec::decode_payload(&data).map(Some),
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok(None)
    }
}

pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, msg: &RpcMessage) -> ProtocolResult<()> {
        let text = WaveCodec::encode_text(msg)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ProtocolError::Io(io::Error::other(e)))
    }

    async fn close(&mut self) -> ProtocolResult<()> {
        self.sink
            .close()
            .await
            .map_err(|e| ProtocolError::Io(io::Error::other(e)))
    }
}

/// Upgrade handler for the websocket endpoint.
pub async fn ws_handler(State(server): State<WaveServer>, upgrade: WebSocketUpgrade) -> Response {
    let Some(guard) = server.ws_limit().try_acquire() else {
        warn!(max = server.ws_limit().max(), "rejecting websocket connection: at capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    upgrade
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_socket(server, socket, guard))
}

async fn serve_socket(server: WaveServer, socket: WebSocket, guard: ConnectionGuard) {
    let name = server.peer_name("ws");
    debug!(peer = %name, "websocket connection");
    let (sink, stream) = socket.split();
    let endpoint = server.attach_peer(WsSource { stream }, WsSink { sink }, name);
    run_connection(endpoint, server.shutdown_signal(), guard).await;
}
