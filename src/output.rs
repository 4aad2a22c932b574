use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use wasmtime_wasi::async_trait;
use wasmtime_wasi::cli::{IsTerminal, StdoutStream};
use wasmtime_wasi::p2::{OutputStream, Pollable, StreamResult};

/// Largest single write the guest is permitted before re-checking readiness.
const WRITE_PERMIT: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Inner {
    buf: Vec<u8>,
    dropped: usize,
}

/// Guest stdout/stderr sink that the host empties after every statement.
///
/// `max_bytes` bounds what may accumulate between two [`OutputBuffer::take`]
/// calls. Bytes past the limit are counted instead of stored, and the guest
/// never sees a write failure.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    max_bytes: usize,
    inner: Arc<Mutex<Inner>>,
}

/// What one [`OutputBuffer::take`] drained.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Bytes discarded since the last `take`.
    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }

    pub fn take(&self) -> Drained {
        let mut inner = self.lock();
        Drained {
            bytes: std::mem::take(&mut inner.buf),
            dropped: std::mem::take(&mut inner.dropped),
        }
    }

    fn append(&self, data: &[u8]) {
        let mut inner = self.lock();
        let room = self.max_bytes.saturating_sub(inner.buf.len());
        let kept = data.len().min(room);
        inner.buf.extend_from_slice(&data[..kept]);
        inner.dropped += data.len() - kept;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain bytes behind; keep using them.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OutputStream for OutputBuffer {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.append(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_PERMIT)
    }
}

#[async_trait]
impl Pollable for OutputBuffer {
    async fn ready(&mut self) {}
}

impl AsyncWrite for OutputBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.append(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl IsTerminal for OutputBuffer {
    fn is_terminal(&self) -> bool {
        false
    }
}

impl StdoutStream for OutputBuffer {
    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(self.clone())
    }

    fn async_stream(&self) -> Box<dyn AsyncWrite + Send + Sync> {
        Box::new(self.clone())
    }
}
