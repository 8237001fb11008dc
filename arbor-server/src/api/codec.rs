use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder};

/// Frames must be accepted up to at least this size.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Maximum number of bytes of the textual length header including the newline.
const MAX_HEADER_LENGTH: usize = 16;

/// Length prefixed frames
pub type Framed<T> = tokio_util::codec::Framed<T, Codec>;

/// Framed wrapper
pub fn framed<T>(inner: T) -> Framed<T>
where
    T: AsyncRead + AsyncWrite,
{
    tokio_util::codec::Framed::new(inner, Codec::default())
}

/// Framed wrapper with a defined maximum frame length
pub fn framed_with_max_length<T>(inner: T, max_length: usize) -> Framed<T>
where
    T: AsyncRead + AsyncWrite,
{
    tokio_util::codec::Framed::new(inner, Codec::new_with_max_length(max_length))
}

/// Length prefixed framing: a decimal length terminated by `\n` followed by
/// that many raw bytes. The empty frame (`0\n`) is valid and used as a chunk
/// stream terminator.
#[derive(Debug)]
pub struct Codec {
    max_length: usize,
}

impl Default for Codec {
    fn default() -> Codec {
        Codec {
            max_length: MAX_FRAME_LENGTH,
        }
    }
}

impl Codec {
    /// Returns a Codec that rejects frames longer than `max_length`.
    ///
    /// A frame that exceeds the limit is a protocol violation. The decoder
    /// returns an error and the connection must be torn down.
    pub fn new_with_max_length(max_length: usize) -> Codec {
        Codec { max_length }
    }
}

impl Decoder for Codec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = src
            .iter()
            .take(MAX_HEADER_LENGTH)
            .position(|b| *b == b'\n');
        let header = match header {
            Some(n) => n,
            None if src.len() >= MAX_HEADER_LENGTH => {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "missing frame length header",
                ));
            }
            None => return Ok(None),
        };

        let length = std::str::from_utf8(&src[..header])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                io::Error::new(ErrorKind::InvalidData, "invalid frame length header")
            })?;

        if length > self.max_length {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds maximum", length),
            ));
        }

        if src.len() < header + 1 + length {
            src.reserve(header + 1 + length - src.len());
            return Ok(None);
        }

        src.advance(header + 1);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for Codec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = item.len().to_string();
        dst.reserve(header.len() + 1 + item.len());
        dst.put(header.as_bytes());
        dst.put_u8(b'\n');
        dst.put(item);
        Ok(())
    }
}

/// Encode `message` as json and send it as one frame.
pub async fn send<S, M>(sink: &mut S, message: &M) -> io::Result<()>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
    M: Serialize,
{
    let body = serde_json::to_vec(message)?;
    sink.send(Bytes::from(body)).await
}

/// Receive one frame and decode it as json. `None` means the peer closed the
/// connection between frames.
pub async fn recv<S, M>(stream: &mut S) -> io::Result<Option<M>>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    M: DeserializeOwned,
{
    match stream.next().await {
        None => Ok(None),
        Some(frame) => serde_json::from_slice(&frame?)
            .map(Some)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e)),
    }
}
