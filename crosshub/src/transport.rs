//! Framed messages exchanged between relay nodes.
//!
//! A frame is a 32 byte header, the RLP encoded message code and the payload. The first three bytes of the header
//! hold the big-endian length of everything after the header. The rest of the header is zero.

use std::time::Duration;

use alloy::rlp::{Decodable, Encodable};
use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

pub const HEADER_LEN: usize = 32;

/// Largest frame body which fits in the 24 bit size field.
pub const MAX_FRAME_SIZE: usize = 0xFF_FFFF;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message size overflows uint24")]
    FrameTooLarge,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid message code: {0}")]
    InvalidCode(alloy::rlp::Error),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub code: u64,
    pub size: u32,
    pub payload: Bytes,
}

impl Msg {
    pub fn new(code: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Msg {
            code,
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            payload,
        }
    }

    /// A message carrying `value` as its payload.
    pub fn encode<T: Serialize>(code: u64, value: &T) -> Result<Self, TransportError> {
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
        Ok(Msg::new(code, payload))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
        Ok(value)
    }

    /// Encodes this message as a single frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, TransportError> {
        let mut code = Vec::with_capacity(9);
        self.code.encode(&mut code);
        let fsize = code.len() + self.payload.len();
        if fsize > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge);
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + fsize);
        frame.extend_from_slice(&(fsize as u32).to_be_bytes()[1..]);
        frame.resize(HEADER_LEN, 0);
        frame.extend_from_slice(&code);
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }
}

/// Writes `msg` as one frame. The deadline covers the whole write, including the flush.
pub async fn write_msg<W>(io: &mut W, msg: &Msg, deadline: Duration) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = msg.to_frame()?;
    timeout(deadline, async {
        io.write_all(&frame).await?;
        io.flush().await
    })
    .await
    .map_err(|_| TransportError::Timeout(deadline))??;
    Ok(())
}

/// Reads exactly one frame. A short read is an error.
pub async fn read_msg<R>(io: &mut R, deadline: Option<Duration>) -> Result<Msg, TransportError>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let mut header = [0u8; HEADER_LEN];
        io.read_exact(&mut header).await?;
        let fsize = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;

        let mut body = BytesMut::zeroed(fsize);
        io.read_exact(&mut body).await?;
        Ok::<_, std::io::Error>(body.freeze())
    };
    let body = match deadline {
        Some(deadline) => timeout(deadline, read)
            .await
            .map_err(|_| TransportError::Timeout(deadline))??,
        None => read.await?,
    };

    let mut rest = &body[..];
    let code = u64::decode(&mut rest).map_err(TransportError::InvalidCode)?;
    let payload = body.slice(body.len() - rest.len()..);
    Ok(Msg::new(code, payload))
}

/// A stream of frames with a deadline on every write.
#[derive(Debug)]
pub struct FramedStream<S> {
    io: S,
    send_timeout: Duration,
}

impl<S> FramedStream<S> {
    pub fn new(io: S, send_timeout: Duration) -> Self {
        FramedStream { io, send_timeout }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    pub async fn send(&mut self, msg: &Msg) -> Result<(), TransportError> {
        write_msg(&mut self.io, msg, self.send_timeout).await
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Waits for the next frame with no deadline.
    pub async fn recv(&mut self) -> Result<Msg, TransportError> {
        read_msg(&mut self.io, None).await
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tokio::io::duplex;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        nonce: u64,
        text: String,
    }

    #[tokio::test]
    async fn frame_layout() {
        let msg = Msg::new(7, vec![0xaa, 0xbb]);
        let frame = msg.to_frame().unwrap();
        // rlp(7) is the single byte 0x07.
        assert_eq!(&frame[..3], &[0, 0, 3]);
        assert!(frame[3..HEADER_LEN].iter().all(|b| *b == 0));
        assert_eq!(&frame[HEADER_LEN..], &[0x07, 0xaa, 0xbb]);

        let (mut a, mut b) = duplex(1024);
        write_msg(&mut a, &msg, Duration::from_secs(1)).await.unwrap();
        let read = read_msg(&mut b, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(read, msg);
        assert_eq!(read.size, 2);
    }

    #[tokio::test]
    async fn typed_payloads() {
        let ping = Ping {
            nonce: 1 << 40,
            text: "hello".to_owned(),
        };
        let (a, b) = duplex(1024);
        let mut a = FramedStream::new(a, Duration::from_secs(1));
        let mut b = FramedStream::new(b, Duration::from_secs(1));
        a.send(&Msg::encode(300, &ping).unwrap()).await.unwrap();

        let msg = b.recv().await.unwrap();
        assert_eq!(msg.code, 300);
        assert_eq!(msg.decode::<Ping>().unwrap(), ping);
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_before_writing() {
        let msg = Msg::new(1, vec![0u8; MAX_FRAME_SIZE]);
        let (mut a, mut b) = duplex(64);
        let err = write_msg(&mut a, &msg, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge));
        assert_eq!(err.to_string(), "message size overflows uint24");

        drop(a);
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn truncated_frames_fail() {
        let frame = Msg::new(2, vec![1, 2, 3, 4]).to_frame().unwrap();
        let (mut a, mut b) = duplex(1024);
        a.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_msg(&mut b, Some(Duration::from_secs(1))).await,
            Err(TransportError::Io(_))
        ));
    }
}
