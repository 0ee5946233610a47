use anyhow::{bail, Context as _, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

pub use api::ApiKey;
pub use request::{Request, RequestHeader, RequestMessage};
pub use response::{Response, ResponseBody, ResponseHeader, ResponseMessage};

use error::DecodeError;

pub mod api;
pub mod error;
pub mod record;
pub mod request;
pub mod response;
pub mod types;

pub trait HeaderVersion {
    // NOTE: header version is generally different, but derivable from the API version
    fn header_version(&self, api_version: i16) -> i16;
}

/// Reads size-delimited frames off a byte stream.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    max_frame_size: usize,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    #[inline]
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame_size,
        }
    }

    /// Read the next frame body (without the size prefix) into `buf`.
    ///
    /// Returns `Ok(None)` if the stream ends cleanly at a frame boundary.
    pub async fn read_frame(&mut self, buf: &mut BytesMut) -> Result<Option<usize>> {
        // read frame size in bytes
        let mut prefix = [0; 4];
        let mut filled = 0;

        while filled < prefix.len() {
            let n = self
                .inner
                .read(&mut prefix[filled..])
                .await
                .context("frame size")?;

            match n {
                // if the input ends at frame boundary, return successfully without a frame
                0 if filled == 0 => return Ok(None),
                0 => bail!(DecodeError::Truncated {
                    needed: prefix.len(),
                    remaining: filled,
                }),
                n => filled += n,
            }
        }

        let size = i32::from_be_bytes(prefix);

        // every response starts with a correlation id
        let size = match usize::try_from(size) {
            Ok(size) if size >= ResponseHeader::SIZE => size,
            _ => bail!(DecodeError::InvalidLength(size.into())),
        };

        if size > self.max_frame_size {
            bail!(DecodeError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        buf.clear();
        buf.resize(size, 0);

        self.inner
            .read_exact(&mut buf[..])
            .await
            .context("frame content")?;

        Ok(Some(size))
    }
}

/// Writes pre-encoded frames to a byte stream.
pub struct MessageWriter<W> {
    inner: BufWriter<W>,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    #[inline]
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
        }
    }

    /// Buffer a complete frame. Call [`flush`](Self::flush) to push it to the peer.
    #[inline]
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.inner.write_all(frame).await.context("write frame")
    }

    #[inline]
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await.context("flush frames")
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.context("shutdown writer")
    }
}

pub trait Serialize {
    /// Size of a fixed-width encoding, zero for variable-size types.
    const SIZE: usize = 0;

    /// Exact number of bytes [`encode`](Self::encode) appends for given `version`.
    fn encode_size(&self, version: i16) -> usize;

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()>;
}

pub trait Deserialize: Sized {
    const DEFAULT_VERSION: i16 = 0;

    /// Decode an instance and report how many bytes were consumed from `buf`.
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)>;

    #[inline]
    fn deserialize<B: Buf>(buf: &mut B) -> Result<(Self, usize)> {
        Self::decode(buf, Self::DEFAULT_VERSION)
    }
}
