//! Socket adapter.
//!
//! Wraps the split halves of the underlying byte stream. The read half is
//! taken exactly once by the engine task; writes from any task serialize
//! through a single-holder mutex so every frame lands on the wire as one
//! contiguous byte sequence; shutdown is idempotent under concurrent
//! callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{EpoxyError, Result};

/// Boxed read half of the connection stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of the connection stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared socket state for one connection.
pub struct Socket {
    /// Read half, taken once by the engine task.
    reader: StdMutex<Option<BoxedReader>>,
    /// Write half behind the single-holder write mutex.
    writer: Mutex<BoxedWriter>,
    /// Elects the single shutdowner.
    shut_down: AtomicBool,
    /// Local endpoint label.
    local_endpoint: String,
    /// Remote endpoint label.
    remote_endpoint: String,
}

impl Socket {
    /// Wrap an already-connected byte stream.
    pub fn new<S>(stream: S, local_endpoint: String, remote_endpoint: String) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: StdMutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            shut_down: AtomicBool::new(false),
            local_endpoint,
            remote_endpoint,
        }
    }

    /// Take the read half. Only the engine task calls this, once.
    pub fn take_reader(&self) -> Option<BoxedReader> {
        self.reader.lock().expect("socket reader lock poisoned").take()
    }

    /// Write one encoded frame and flush, inside the write-lock critical
    /// section.
    pub async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        if self.is_shut_down() {
            return Err(EpoxyError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// True once any caller has begun shutdown.
    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Half-close the send side.
    ///
    /// The first caller wins the compare-and-swap and performs the close;
    /// everyone else returns immediately. Already-closed errors from the
    /// stream are suppressed; in-flight reads are interrupted by the
    /// connection's cancel token rather than from here.
    pub async fn shutdown(&self) {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(error = %e, "ignoring error from socket shutdown");
        }
    }

    /// Local endpoint label.
    pub fn local_endpoint(&self) -> &str {
        &self.local_endpoint
    }

    /// Remote endpoint label.
    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }
}
