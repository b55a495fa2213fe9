use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{read_sized, CodecReader, CodecWriter, Header, MAX_BODY_FRAME, MAX_HEADER_FRAME};
use crate::error::{Result, RpcError};

/// Read half of the length-prefixed protobuf codec.
///
/// Each incoming message is `[4 bytes BE u32: header_len][header_len bytes:
/// Header][body_size bytes: body]`, with `body_size` taken from the decoded
/// header. This layout is the one codec that must be bit-exact across
/// implementations.
pub struct ProtoReader<R> {
    inner: R,
}

impl<R> ProtoReader<R> {
    pub fn new(inner: R) -> Self {
        ProtoReader { inner }
    }
}

#[async_trait]
impl<R> CodecReader for ProtoReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_header(&mut self) -> Result<Header> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let header_len = u32::from_be_bytes(len_buf) as usize;
        if header_len > MAX_HEADER_FRAME {
            return Err(RpcError::Codec(format!(
                "header of {header_len} bytes exceeds the {MAX_HEADER_FRAME}-byte limit"
            )));
        }
        let mut header_buf = vec![0u8; header_len];
        self.inner.read_exact(&mut header_buf).await?;
        Header::decode(header_buf.as_slice())
            .map_err(|e| RpcError::Codec(format!("decoding header: {e}")))
    }

    async fn read_body(&mut self, body_size: i32) -> Result<Bytes> {
        read_sized(&mut self.inner, body_size).await
    }
}

/// Write half of the length-prefixed protobuf codec. Flushes after every
/// message.
pub struct ProtoWriter<W> {
    inner: W,
}

impl<W> ProtoWriter<W> {
    pub fn new(inner: W) -> Self {
        ProtoWriter { inner }
    }
}

#[async_trait]
impl<W> CodecWriter for ProtoWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, mut header: Header, body: &[u8]) -> Result<()> {
        if body.len() > MAX_BODY_FRAME {
            return Err(RpcError::Codec(format!(
                "body of {} bytes exceeds the {MAX_BODY_FRAME}-byte limit",
                body.len()
            )));
        }
        header.body_size = body.len() as i32;
        let header_bytes = header.encode_to_vec();
        self.inner
            .write_all(&(header_bytes.len() as u32).to_be_bytes())
            .await?;
        self.inner.write_all(&header_bytes).await?;
        self.inner.write_all(body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u64) -> Header {
        Header::request("Arith.Sum", seq)
    }

    #[tokio::test]
    async fn frame_layout_is_length_prefixed() {
        let mut writer = ProtoWriter::new(Vec::new());
        let body = b"payload bytes";
        writer.write(header(7), body).await.unwrap();
        let frame = writer.inner;

        let header_len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        let decoded = Header::decode(&frame[4..4 + header_len]).unwrap();
        assert_eq!(decoded.service_method, "Arith.Sum");
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.body_size, body.len() as i32);
        // Exactly body_size bytes follow the header.
        assert_eq!(&frame[4 + header_len..], body);
    }

    #[tokio::test]
    async fn roundtrip() {
        let mut writer = ProtoWriter::new(Vec::new());
        writer.write(header(42), b"abc").await.unwrap();
        writer.write(header(43), b"").await.unwrap();

        let mut reader = ProtoReader::new(writer.inner.as_slice());
        let h1 = reader.read_header().await.unwrap();
        assert_eq!(h1.seq, 42);
        let b1 = reader.read_body(h1.body_size).await.unwrap();
        assert_eq!(&b1[..], b"abc");

        let h2 = reader.read_header().await.unwrap();
        assert_eq!(h2.seq, 43);
        assert_eq!(h2.body_size, 0);
        let b2 = reader.read_body(h2.body_size).await.unwrap();
        assert!(b2.is_empty());
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(MAX_HEADER_FRAME as u32 + 1).to_be_bytes());
        let mut reader = ProtoReader::new(frame.as_slice());
        assert!(matches!(
            reader.read_header().await,
            Err(RpcError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        let mut writer = ProtoWriter::new(Vec::new());
        writer.write(header(1), b"full body").await.unwrap();
        let mut truncated = writer.inner;
        truncated.truncate(truncated.len() - 3);

        let mut reader = ProtoReader::new(truncated.as_slice());
        let h = reader.read_header().await.unwrap();
        assert!(matches!(reader.read_body(h.body_size).await, Err(RpcError::Io(_))));
    }
}
