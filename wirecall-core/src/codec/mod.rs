//! Framing and serialization for the wire protocol.
//!
//! A connection negotiates one [`CodecKind`] in its option prelude; every
//! subsequent message is a (header, body) pair framed by that codec. The
//! codec is split into a read half and a write half because one task owns
//! reads exclusively while writers serialize under the sending lock.

mod bin;
mod json;
mod proto;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub use bin::{BinReader, BinWriter};
pub use json::{JsonReader, JsonWriter};
pub use proto::{ProtoReader, ProtoWriter};

use crate::error::{Result, RpcError};

/// Largest header frame a peer may send. Anything bigger is treated as a
/// malformed stream rather than an allocation request.
pub(crate) const MAX_HEADER_FRAME: usize = 1 << 20;

/// Largest body a peer may declare.
pub(crate) const MAX_BODY_FRAME: usize = 64 << 20;

/// Per-message metadata carried on the wire.
///
/// The proto representation (tags 1-4 in declaration order) is the bit-exact
/// frame contract; the serde names are the self-describing codecs' field
/// names.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// `"ServiceName.MethodName"`.
    #[prost(string, tag = "1")]
    pub service_method: String,

    /// Monotonic per-connection sequence number.
    #[prost(uint64, tag = "2")]
    pub seq: u64,

    /// Empty iff the message reports success.
    #[prost(string, tag = "3")]
    pub error: String,

    /// Byte count of the body frame that follows the header.
    #[prost(int32, tag = "4")]
    pub body_size: i32,
}

impl Header {
    pub(crate) fn request(service_method: &str, seq: u64) -> Header {
        Header {
            service_method: service_method.to_owned(),
            seq,
            error: String::new(),
            body_size: 0,
        }
    }
}

/// The closed set of codecs. The serde renames are the wire tags carried in
/// the option prelude; an unknown tag fails the prelude parse and rejects the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    /// Compact binary codec (bincode), length-prefixed like `Proto`. Fills
    /// the protocol's `application/gob` slot.
    #[serde(rename = "application/gob")]
    Gob,

    /// Newline-delimited JSON values: one line for the header, one for the
    /// body.
    #[serde(rename = "application/json")]
    Json,

    /// `[u32 BE header_len][header][body]` with protobuf serialization. The
    /// only framing that is bit-exact across implementations.
    #[serde(rename = "proto")]
    Proto,
}

/// Read half of a negotiated codec. Exactly one task owns it.
#[async_trait]
pub trait CodecReader: Send {
    async fn read_header(&mut self) -> Result<Header>;

    /// Read the body frame that follows a header. `body_size` comes from the
    /// header; self-delimiting codecs may ignore it. A zero-size body is
    /// legal and yields an empty buffer.
    async fn read_body(&mut self, body_size: i32) -> Result<Bytes>;
}

/// Write half of a negotiated codec. Writes are atomic at header+body
/// granularity: callers serialize access (the sending lock), and the codec
/// flushes after every message.
#[async_trait]
pub trait CodecWriter: Send {
    /// Frame and send one message. Sets `header.body_size` from `body`.
    async fn write(&mut self, header: Header, body: &[u8]) -> Result<()>;

    /// Flush and shut down the underlying write half.
    async fn close(&mut self) -> Result<()>;
}

pub(crate) type ConnReader = BufReader<OwnedReadHalf>;
pub(crate) type ConnWriter = BufWriter<OwnedWriteHalf>;

/// Instantiate the negotiated codec over a buffered connection. The match is
/// exhaustive: adding a codec kind forces a decision here.
pub(crate) fn pair(
    kind: CodecKind,
    reader: ConnReader,
    writer: ConnWriter,
) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>) {
    match kind {
        CodecKind::Gob => (
            Box::new(BinReader::new(reader)),
            Box::new(BinWriter::new(writer)),
        ),
        CodecKind::Json => (
            Box::new(JsonReader::new(reader)),
            Box::new(JsonWriter::new(writer)),
        ),
        CodecKind::Proto => (
            Box::new(ProtoReader::new(reader)),
            Box::new(ProtoWriter::new(writer)),
        ),
    }
}

/// A payload that can travel through any of the codecs.
///
/// Blanket-implemented for any type that derives both `prost::Message` and
/// the serde traits, so one payload type serves all three codecs. An empty
/// wire body decodes to the payload's default value.
pub trait Body: Sized + Send + 'static {
    fn to_wire(&self, kind: CodecKind) -> Result<Vec<u8>>;
    fn from_wire(kind: CodecKind, buf: &[u8]) -> Result<Self>;
}

impl<T> Body for T
where
    T: ::prost::Message + Default + Serialize + DeserializeOwned + Send + 'static,
{
    fn to_wire(&self, kind: CodecKind) -> Result<Vec<u8>> {
        match kind {
            CodecKind::Gob => bincode::serialize(self)
                .map_err(|e| RpcError::Codec(format!("encoding body: {e}"))),
            CodecKind::Json => serde_json::to_vec(self)
                .map_err(|e| RpcError::Codec(format!("encoding body: {e}"))),
            CodecKind::Proto => Ok(self.encode_to_vec()),
        }
    }

    fn from_wire(kind: CodecKind, buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Ok(T::default());
        }
        match kind {
            CodecKind::Gob => bincode::deserialize(buf)
                .map_err(|e| RpcError::Codec(format!("decoding body: {e}"))),
            CodecKind::Json => {
                if buf == b"null" {
                    return Ok(T::default());
                }
                serde_json::from_slice(buf)
                    .map_err(|e| RpcError::Codec(format!("decoding body: {e}")))
            }
            CodecKind::Proto => {
                T::decode(buf).map_err(|e| RpcError::Codec(format!("decoding body: {e}")))
            }
        }
    }
}

/// Read exactly `body_size` bytes, validating the declared size first.
pub(crate) async fn read_sized<R>(reader: &mut R, body_size: i32) -> Result<Bytes>
where
    R: AsyncRead + Unpin + Send,
{
    if body_size < 0 {
        return Err(RpcError::Codec(format!("negative body size {body_size}")));
    }
    let n = body_size as usize;
    if n > MAX_BODY_FRAME {
        return Err(RpcError::Codec(format!(
            "body of {n} bytes exceeds the {MAX_BODY_FRAME}-byte limit"
        )));
    }
    if n == 0 {
        return Ok(Bytes::new());
    }
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read one newline-terminated record, bounded so a peer that never sends a
/// newline cannot grow the buffer without limit. Returns the line without its
/// terminator; end-of-stream surfaces as `UnexpectedEof`.
pub(crate) async fn read_line_capped<R>(reader: &mut R, cap: usize) -> Result<String>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut line = String::new();
    let n = reader
        .take(cap as u64)
        .read_line(&mut line)
        .await
        .map_err(|e| RpcError::Codec(format!("reading record: {e}")))?;
    if n == 0 {
        return Err(RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    if !line.ends_with('\n') && n == cap {
        return Err(RpcError::Codec(format!(
            "record exceeds the {cap}-byte limit"
        )));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}
