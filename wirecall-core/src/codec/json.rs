use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use crate::codec::{
    read_line_capped, CodecReader, CodecWriter, Header, MAX_BODY_FRAME, MAX_HEADER_FRAME,
};
use crate::error::{Result, RpcError};

/// Read half of the JSON codec.
///
/// The stream is the encoder's native self-delimiting form: one JSON value
/// per line, header line then body line. `body_size` is carried in the
/// header but ignored on read; an empty body travels as `null`.
pub struct JsonReader<R> {
    inner: R,
}

impl<R> JsonReader<R> {
    pub fn new(inner: R) -> Self {
        JsonReader { inner }
    }
}

#[async_trait]
impl<R> CodecReader for JsonReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn read_header(&mut self) -> Result<Header> {
        let line = read_line_capped(&mut self.inner, MAX_HEADER_FRAME).await?;
        serde_json::from_str(&line).map_err(|e| RpcError::Codec(format!("decoding header: {e}")))
    }

    async fn read_body(&mut self, _body_size: i32) -> Result<Bytes> {
        let line = read_line_capped(&mut self.inner, MAX_BODY_FRAME).await?;
        Ok(Bytes::from(line.into_bytes()))
    }
}

/// Write half of the JSON codec. Flushes after every message.
pub struct JsonWriter<W> {
    inner: W,
}

impl<W> JsonWriter<W> {
    pub fn new(inner: W) -> Self {
        JsonWriter { inner }
    }
}

#[async_trait]
impl<W> CodecWriter for JsonWriter<W>
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
        let mut frame = serde_json::to_vec(&header)
            .map_err(|e| RpcError::Codec(format!("encoding header: {e}")))?;
        frame.push(b'\n');
        if body.is_empty() {
            frame.extend_from_slice(b"null");
        } else {
            frame.extend_from_slice(body);
        }
        frame.push(b'\n');
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
