use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const BUFFER_SIZE: usize = 32 * 1024;

const MAX_IDLE_BUFFERS: usize = 256;

/// Reusable [`BUFFER_SIZE`] buffers shared by every copy loop.
#[derive(Debug, Default)]
pub struct BufferPool {
    idle: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice());

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn put(&self, buf: Box<[u8]>) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_BUFFERS {
                idle.push(buf);
            }
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned to it on drop.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
}

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("connection closed")]
    Closed,

    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("read failed: {0}")]
    Read(io::Error),

    #[error("write failed: {0}")]
    Write(io::Error),
}

impl PipeError {
    /// Whether this is a normal consequence of the session being torn down.
    ///
    /// Only a close by the sibling loop, a reset and a broken pipe qualify.
    pub fn is_expected(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Read(e) | Self::Write(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            ),
            Self::ReadTimeout(_) | Self::WriteTimeout(_) => false,
        }
    }
}

/// Relay bytes from `src` to `dst` until `src` reaches end of stream.
///
/// Every read must complete within `timeouts.read` and every write within
/// `timeouts.write`. Once `closed` is cancelled the loop stops at its next
/// suspension point. Bytes written to `dst` are added to `copied`.
pub async fn pipe<R, W>(
    src: &mut R,
    dst: &mut W,
    buf: &mut [u8],
    timeouts: Timeouts,
    closed: &CancellationToken,
    copied: &mut u64,
) -> Result<(), PipeError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        let n = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(PipeError::Closed),
            r = timeout(timeouts.read, src.read(buf)) => match r {
                Err(_) => return Err(PipeError::ReadTimeout(timeouts.read)),
                Ok(Err(e)) => return Err(PipeError::Read(e)),
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
            },
        };

        tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(PipeError::Closed),
            r = timeout(timeouts.write, dst.write_all(&buf[..n])) => match r {
                Err(_) => return Err(PipeError::WriteTimeout(timeouts.write)),
                Ok(Err(e)) => return Err(PipeError::Write(e)),
                Ok(Ok(())) => {}
            },
        }

        *copied += n as u64;
    }
}
