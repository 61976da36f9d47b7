//! Frame transports an endpoint can run over.
//!
//! An endpoint only needs something that yields frames and something that
//! accepts them. Byte streams (domain sockets, stdio) go through the
//! length-prefixed codec; in-process pairs pass frames over channels.
//! Message-oriented transports such as websockets implement the traits
//! directly where the socket type lives.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use wave_protocol::{read_frame, write_frame, ProtocolError, ProtocolResult, RpcMessage};

/// Inbound half of a transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` once the peer has closed cleanly.
    async fn recv(&mut self) -> ProtocolResult<Option<RpcMessage>>;
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, msg: &RpcMessage) -> ProtocolResult<()>;

    /// Called once when the endpoint stops writing.
    async fn close(&mut self) -> ProtocolResult<()> {
        Ok(())
    }
}

pub struct StreamSource<R> {
    reader: R,
}

impl<R> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> FrameSource for StreamSource<R> {
    async fn recv(&mut self) -> ProtocolResult<Option<RpcMessage>> {
        read_frame(&mut self.reader).await
    }
}

pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> FrameSink for StreamSink<W> {
    async fn send(&mut self, msg: &RpcMessage) -> ProtocolResult<()> {
        write_frame(&mut self.writer, msg).await
    }

    async fn close(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Split a duplex byte stream into a framed source and sink.
pub fn split_stream<S>(stream: S) -> (StreamSource<ReadHalf<S>>, StreamSink<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (StreamSource::new(reader), StreamSink::new(writer))
}

pub struct ChannelSource {
    rx: mpsc::Receiver<RpcMessage>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> ProtocolResult<Option<RpcMessage>> {
        Ok(self.rx.recv().await)
    }
}

pub struct ChannelSink {
    tx: mpsc::Sender<RpcMessage>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, msg: &RpcMessage) -> ProtocolResult<()> {
        self.tx.send(msg.clone()).await.map_err(|_| {
            ProtocolError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "peer channel closed"))
        })
    }
}

/// Both ends of an in-process transport.
pub type ChannelEnd = (ChannelSource, ChannelSink);

/// Two connected in-process transport ends. Frames sent on one end arrive
/// on the other; dropping a sink ends the opposite source.
pub fn channel_pair(capacity: usize) -> (ChannelEnd, ChannelEnd) {
    let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
    (
        (ChannelSource { rx: a_rx }, ChannelSink { tx: b_tx }),
        (ChannelSource { rx: b_rx }, ChannelSink { tx: a_tx }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn channel_pair_carries_frames_both_ways() {
        let ((mut a_src, mut a_sink), (mut b_src, mut b_sink)) = channel_pair(4);
        a_sink
            .send(&RpcMessage::request("c1", "test", json!(1)))
            .await
            .unwrap();
        assert_eq!(b_src.recv().await.unwrap().unwrap().call_id, "c1");
        b_sink.send(&RpcMessage::stream_end("c1")).await.unwrap();
        assert!(a_src.recv().await.unwrap().unwrap().done);

        drop(a_sink);
        assert!(b_src.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_halves_use_the_codec() {
        let (left, right) = tokio::io::duplex(4096);
        let (_, mut sink) = split_stream(left);
        let (mut src, _) = split_stream(right);
        sink.send(&RpcMessage::cancel("c9")).await.unwrap();
        assert!(src.recv().await.unwrap().unwrap().cancel);
    }
}
