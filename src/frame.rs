//! Length-prefixed binary framing on the worker pipes.
//!
//! A frame is an ASCII decimal length, a `<` marker, exactly that many
//! payload bytes, and a `>` marker. Payload bytes are never escaped; the
//! reader trusts the declared length instead of scanning for markers.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::error::{Error, Result};

const MAX_LEN: u64 = isize::MAX as u64;

/// Reads a single frame from `r` and returns its payload.
///
/// The header is consumed one byte at a time, so `r` should be buffered.
/// A declared length of zero is not a valid frame and fails with
/// [`Error::NoLength`]; the worker side uses an unreadable length to
/// signal end-of-input instead.
pub async fn read_frame<R>(r: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut c = r.read_u8().await?;

    let mut len: u64 = 0;
    while c.is_ascii_digit() {
        let next = len as u128 * 10 + u128::from(c - b'0');
        if next > MAX_LEN as u128 {
            return Err(Error::MaxLength(next.min(u64::MAX as u128) as u64));
        }

        len = next as u64;
        c = r.read_u8().await?;
    }

    if len == 0 {
        return Err(Error::NoLength);
    }

    if c != b'<' {
        return Err(Error::InvalidOpenMarker);
    }

    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;

    if r.read_u8().await? != b'>' {
        return Err(Error::InvalidCloseMarker);
    }

    Ok(buf)
}

/// Buffers an [`AsyncWrite`] and writes frames to it.
pub struct FrameWriter<W> {
    w: BufWriter<W>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(w: W) -> Self {
        Self {
            w: BufWriter::new(w),
        }
    }

    /// Writes `payload` as one frame and flushes. Returns the total
    /// number of bytes put on the wire.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<usize> {
        let header = format!("{}<", payload.len());
        self.w.write_all(header.as_bytes()).await?;
        self.w.write_all(payload).await?;
        self.w.write_all(b">").await?;
        self.w.flush().await?;

        Ok(header.len() + payload.len() + 1)
    }

    /// Writes the single out-of-band newline that asks the worker to
    /// exit cleanly, and flushes.
    pub async fn write_newline(&mut self) -> Result<()> {
        self.w.write_all(b"\n").await?;
        self.w.flush().await?;
        Ok(())
    }
}
