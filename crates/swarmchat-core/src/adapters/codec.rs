//! CBOR frames with a 4-byte big-endian length prefix.
//!
//! Used for the tracker control stream and for drive replication.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are refused rather than allocated.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes / decodes messages using CBOR (via `serde_cbor`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl CborCodec {
    pub fn encode<T: Serialize>(&self, msg: &T) -> anyhow::Result<Vec<u8>> {
        serde_cbor::to_vec(msg).map_err(Into::into)
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> anyhow::Result<T> {
        serde_cbor::from_slice(data).map_err(Into::into)
    }

    pub async fn write_frame<W, T>(&self, writer: &mut W, msg: &T) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize,
    {
        let payload = self.encode(msg)?;
        if payload.len() > MAX_FRAME_LEN {
            anyhow::bail!("Frame too large: {} bytes", payload.len());
        }
        let len = (payload.len() as u32).to_be_bytes();

        writer.write_all(&len).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame. `Ok(None)` on a clean end of stream before a new frame.
    pub async fn read_frame<R, T>(&self, reader: &mut R) -> anyhow::Result<Option<T>>
    where
        R: AsyncRead + Unpin + ?Sized,
        T: DeserializeOwned,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("Frame too large: {len} bytes");
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        self.decode(&payload).map(Some)
    }
}
