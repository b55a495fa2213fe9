use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{read_sized, CodecReader, CodecWriter, Header, MAX_BODY_FRAME, MAX_HEADER_FRAME};
use crate::error::{Result, RpcError};

/// Read half of the compact binary codec filling the `application/gob` slot.
///
/// Binary serde streams are not self-delimiting, so this codec borrows the
/// proto codec's frame discipline: `[4 bytes BE u32: header_len][bincode
/// header][body_size bytes: body]`. Only the `proto` codec's layout is a
/// cross-implementation contract.
pub struct BinReader<R> {
    inner: R,
}

impl<R> BinReader<R> {
    pub fn new(inner: R) -> Self {
        BinReader { inner }
    }
}

#[async_trait]
impl<R> CodecReader for BinReader<R>
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
        bincode::deserialize(&header_buf)
            .map_err(|e| RpcError::Codec(format!("decoding header: {e}")))
    }

    async fn read_body(&mut self, body_size: i32) -> Result<Bytes> {
        read_sized(&mut self.inner, body_size).await
    }
}

/// Write half of the compact binary codec. Flushes after every message.
pub struct BinWriter<W> {
    inner: W,
}

impl<W> BinWriter<W> {
    pub fn new(inner: W) -> Self {
        BinWriter { inner }
    }
}

#[async_trait]
impl<W> CodecWriter for BinWriter<W>
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
        let header_bytes = bincode::serialize(&header)
            .map_err(|e| RpcError::Codec(format!("encoding header: {e}")))?;
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
