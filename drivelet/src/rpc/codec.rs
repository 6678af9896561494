//! Framed codec for driver communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! [`ConnFrameReader`] and [`ConnFrameWriter`] run the codec over a
//! [`Conn`], which is how sessions talk over pipes and sockets alike.

use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::net::Conn;
use crate::rpc::RpcError;

/// Largest accepted frame body.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Codec that frames messages with a 4-byte length prefix and serializes
/// with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Trace only: stderr of a driver is forwarded into the parent's log,
        // so anything louder here would echo every frame.
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Encodes one frame into its wire form, length prefix included.
///
/// Fails without touching any connection, so an unencodable frame (one over
/// [`MAX_FRAME_LENGTH`], say) only affects its caller.
pub fn encode_frame<T: Serialize>(item: T) -> Result<Bytes, RpcError> {
    let mut buf = BytesMut::new();
    JsonCodec::<T>::new().encode(item, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes frames from the read side of a connection.
pub struct ConnFrameReader<T> {
    conn: Arc<dyn Conn>,
    codec: JsonCodec<T>,
    buf: BytesMut,
    chunk: Box<[u8]>,
}

impl<T: DeserializeOwned> ConnFrameReader<T> {
    pub fn new(conn: Arc<dyn Conn>) -> Self {
        Self {
            conn,
            codec: JsonCodec::new(),
            buf: BytesMut::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Next frame, or `None` on a clean end-of-stream between frames.
    pub async fn next(&mut self) -> Option<Result<T, RpcError>> {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(item)) => return Some(Ok(item)),
                Ok(None) => {}
                Err(e) => return Some(Err(e.into())),
            }

            let n = match self.conn.read(&mut self.chunk).await {
                Ok(n) => n,
                Err(e) => return Some(Err(e.into())),
            };
            if n == 0 {
                if self.buf.is_empty() {
                    return None;
                }
                return Some(Err(RpcError::protocol(format!(
                    "connection ended inside a frame ({} bytes buffered)",
                    self.buf.len()
                ))));
            }
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
    }
}

/// Writes frames onto the write side of a connection.
pub struct ConnFrameWriter<T> {
    conn: Arc<dyn Conn>,
    _phantom: PhantomData<T>,
}

impl<T: Serialize> ConnFrameWriter<T> {
    pub fn new(conn: Arc<dyn Conn>) -> Self {
        Self {
            conn,
            _phantom: PhantomData,
        }
    }

    pub async fn send(&mut self, item: T) -> Result<(), RpcError> {
        let frame = encode_frame(item)?;
        self.send_encoded(&frame).await
    }

    /// Writes a frame produced by [`encode_frame`].
    pub async fn send_encoded(&mut self, frame: &[u8]) -> Result<(), RpcError> {
        self.conn.write_all(frame).await?;
        Ok(())
    }
}
