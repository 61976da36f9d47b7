use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{RpcMessage, MAX_MESSAGE_SIZE};

/// Version byte written after the length prefix.
pub const FRAME_VERSION: u8 = 1;

/// Codec for encoding/decoding Wave RPC frames.
///
/// Byte-stream transports use `[4 bytes BE len][1 byte version][json]`,
/// where `len` counts the version byte and the payload. Message-oriented
/// transports (websocket) carry the bare JSON payload.
pub struct WaveCodec;

impl WaveCodec {
    /// Encode a message with framing.
    pub fn encode(msg: &RpcMessage) -> ProtocolResult<Vec<u8>> {
        let payload = Self::encode_payload(msg)?;
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(4 + 1 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(FRAME_VERSION);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a framed message. Returns (message, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(RpcMessage, usize)> {
        if data.len() < 5 {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let len = frame_len([data[0], data[1], data[2], data[3]])?;
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        if data[4] != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion(data[4]));
        }
        let msg = Self::decode_payload(&data[5..total])?;
        Ok((msg, total))
    }

    /// Encode payload only (no framing).
    pub fn encode_payload(msg: &RpcMessage) -> ProtocolResult<Vec<u8>> {
        let payload =
            serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(payload)
    }

    /// Decode and validate a bare payload (no framing).
    pub fn decode_payload(data: &[u8]) -> ProtocolResult<RpcMessage> {
        let msg: RpcMessage = serde_json::from_slice(data)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn encode_text(msg: &RpcMessage) -> ProtocolResult<String> {
        let payload = Self::encode_payload(msg)?;
        String::from_utf8(payload).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode_text(text: &str) -> ProtocolResult<RpcMessage> {
        Self::decode_payload(text.as_bytes())
    }
}

fn frame_len(prefix: [u8; 4]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len < 1 {
        return Err(ProtocolError::FramingError("zero-length frame".into()));
    }
    if len - 1 > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len - 1,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len)
}

/// Read one frame from a byte stream.
///
/// Returns `Ok(None)` on a clean end of stream. Payload errors are reported
/// after the whole frame has been consumed, so the stream stays aligned.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Option<RpcMessage>> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    if body[0] != FRAME_VERSION {
        return Err(ProtocolError::UnsupportedVersion(body[0]));
    }
    WaveCodec::decode_payload(&body[1..]).map(Some)
}

/// Write one frame to a byte stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &RpcMessage) -> ProtocolResult<()> {
    let buf = WaveCodec::encode(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RpcMessage {
        RpcMessage::request("c1", "setmeta", json!({"oref": "tab:t1", "meta": {"a": 1}}))
    }

    #[test]
    fn encode_decode_frame() {
        let encoded = WaveCodec::encode(&sample()).unwrap();
        assert_eq!(encoded[4], FRAME_VERSION);
        let (decoded, consumed) = WaveCodec::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, sample());
    }

    #[test]
    fn decode_two_back_to_back() {
        let mut buf = WaveCodec::encode(&sample()).unwrap();
        buf.extend(WaveCodec::encode(&RpcMessage::stream_end("c1")).unwrap());
        let (_, first) = WaveCodec::decode(&buf).unwrap();
        let (second, _) = WaveCodec::decode(&buf[first..]).unwrap();
        assert!(second.done);
    }

    #[test]
    fn decode_truncated() {
        let err = WaveCodec::decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
        let encoded = WaveCodec::encode(&sample()).unwrap();
        let err = WaveCodec::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_zero_length() {
        let data = [0u8, 0, 0, 0, 0];
        let err = WaveCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let len = (MAX_MESSAGE_SIZE as u32 + 2).to_be_bytes();
        let data = [len[0], len[1], len[2], len[3], FRAME_VERSION];
        assert!(matches!(
            WaveCodec::decode(&data),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn invalid_frames_are_recoverable() {
        let err = WaveCodec::decode_text("{not json").unwrap_err();
        assert!(err.is_recoverable());
        let err = WaveCodec::decode_text(r#"{"callid": "c1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn text_form_is_plain_json() {
        let text = WaveCodec::encode_text(&sample()).unwrap();
        assert!(text.starts_with('{'));
        assert_eq!(WaveCodec::decode_text(&text).unwrap(), sample());
    }

    #[tokio::test]
    async fn stream_read_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &sample()).await.unwrap();
        write_frame(&mut a, &RpcMessage::cancel("c1")).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(sample()));
        assert!(read_frame(&mut b).await.unwrap().unwrap().cancel);
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_skips_bad_payload_and_stays_aligned() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let junk = b"{oops";
        let mut raw = ((junk.len() + 1) as u32).to_be_bytes().to_vec();
        raw.push(FRAME_VERSION);
        raw.extend_from_slice(junk);
        tokio::io::AsyncWriteExt::write_all(&mut a, &raw).await.unwrap();
        write_frame(&mut a, &sample()).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(sample()));
    }
}
