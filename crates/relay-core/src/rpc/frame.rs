// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for RPC calls over TCP.
//!
//! ```text
//! +----------------+-------------+----------------------+
//! | length: u32 BE | kind: u16 BE | JSON payload (length) |
//! +----------------+-------------+----------------------+
//! ```
//!
//! A call is one [`MessageType::Request`] frame answered by one
//! [`MessageType::Response`] or [`MessageType::Error`] frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in either direction (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes before the payload.
pub const HEADER_SIZE: usize = 6;

/// Kind carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Call
    Request = 1,
    /// Successful result
    Response = 2,
    /// Failed call, payload is an [`RpcError`](crate::error::RpcError)
    Error = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(raw: u16) -> Result<Self, FrameError> {
        [Self::Request, Self::Response, Self::Error]
            .into_iter()
            .find(|kind| *kind as u16 == raw)
            .ok_or(FrameError::InvalidMessageType(raw))
    }
}

/// Framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload exceeds [`MAX_FRAME_SIZE`].
    #[error("payload of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    /// Unknown type in the header.
    #[error("unknown message type {0}")]
    InvalidMessageType(u16),

    /// Socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload is not the expected JSON.
    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer closed before a header arrived.
    #[error("peer closed the connection")]
    ConnectionClosed,
}

/// Parsed fixed-size header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    length: usize,
    message_type: MessageType,
}

impl FrameHeader {
    fn parse(raw: [u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let [l0, l1, l2, l3, t0, t1] = raw;
        let length = u32::from_be_bytes([l0, l1, l2, l3]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        Ok(Self {
            length,
            message_type: MessageType::try_from(u16::from_be_bytes([t0, t1]))?,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        // Payloads are bounded by MAX_FRAME_SIZE, well inside u32.
        buf.put_u32(self.length as u32);
        buf.put_u16(self.message_type as u16);
    }
}

/// One message on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Header type.
    pub message_type: MessageType,
    /// JSON body.
    pub payload: Bytes,
}

impl Frame {
    /// Call frame.
    pub fn request<M: Serialize>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    /// Successful result frame.
    pub fn response<M: Serialize>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    /// Failure frame.
    pub fn error<M: Serialize>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Error, msg)
    }

    /// Serialise `msg` as the payload of a `message_type` frame.
    pub fn new<M: Serialize>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = Bytes::from(serde_json::to_vec(msg)?);
        match payload.len() {
            len if len > MAX_FRAME_SIZE => Err(FrameError::FrameTooLarge(len)),
            _ => Ok(Self {
                message_type,
                payload,
            }),
        }
    }

    /// Parse the payload as `M`.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        serde_json::from_slice(&self.payload).map_err(FrameError::from)
    }

    /// Header followed by payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        FrameHeader {
            length: self.payload.len(),
            message_type: self.message_type,
        }
        .write(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Write `frame` and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame. A clean close between frames is
/// [`FrameError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut raw = [0u8; HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut raw).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::ConnectionClosed,
            _ => e.into(),
        });
    }
    // Size is validated here, before the payload buffer is allocated.
    let header = FrameHeader::parse(raw)?;

    let mut payload = BytesMut::zeroed(header.length);
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        message_type: header.message_type,
        payload: payload.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::{AsyncWriteExt, duplex};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        id: String,
        count: u32,
    }

    fn ping() -> Ping {
        Ping {
            id: "abc".into(),
            count: 3,
        }
    }

    #[test]
    fn test_header_codes() {
        for (kind, code) in [
            (MessageType::Request, 1u16),
            (MessageType::Response, 2),
            (MessageType::Error, 6),
        ] {
            assert_eq!(kind as u16, code);
            assert_eq!(MessageType::try_from(code).unwrap(), kind);
        }
        assert!(matches!(
            MessageType::try_from(3u16),
            Err(FrameError::InvalidMessageType(3))
        ));
    }

    #[test]
    fn test_encoded_layout() {
        let frame = Frame::request(&ping()).unwrap();
        let wire = frame.encode();

        assert_eq!(wire.len(), HEADER_SIZE + frame.payload.len());
        assert_eq!(&wire[..4], (frame.payload.len() as u32).to_be_bytes());
        assert_eq!(&wire[4..6], [0, 1]);
        assert_eq!(&wire[HEADER_SIZE..], &frame.payload[..]);
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..4].copy_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        raw[5] = 1;
        match FrameHeader::parse(raw) {
            Err(FrameError::FrameTooLarge(size)) => assert_eq!(size, MAX_FRAME_SIZE + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_wrong_payload_shape() {
        let frame = Frame::response(&serde_json::json!({"unexpected": true})).unwrap();
        assert!(matches!(frame.decode::<Ping>(), Err(FrameError::Json(_))));
    }

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut writer, mut reader) = duplex(4096);

        write_frame(&mut writer, &Frame::request(&ping()).unwrap())
            .await
            .unwrap();
        write_frame(&mut writer, &Frame::error(&"boom").unwrap())
            .await
            .unwrap();
        drop(writer);

        let first = read_frame(&mut reader).await.unwrap();
        assert_eq!(first.message_type, MessageType::Request);
        assert_eq!(first.decode::<Ping>().unwrap(), ping());

        let second = read_frame(&mut reader).await.unwrap();
        assert_eq!(second.message_type, MessageType::Error);
        assert_eq!(second.decode::<String>().unwrap(), "boom");

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_io_error() {
        let (mut writer, mut reader) = duplex(64);
        let mut partial = BytesMut::new();
        FrameHeader {
            length: 10,
            message_type: MessageType::Request,
        }
        .write(&mut partial);
        partial.extend_from_slice(b"{}");
        writer.write_all(&partial).await.unwrap();
        drop(writer);

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Io(_))
        ));
    }
}
