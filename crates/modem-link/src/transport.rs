//! Byte-level transport abstraction
//!
//! The link engine never touches a serial port directly. It talks to a
//! [`ByteChannel`], which models the modem UART: chunked reads with a
//! status code, writes, line-speed changes, and the power/sleep controls
//! a cellular module exposes.
//!
//! [`StreamChannel`] adapts any `AsyncRead + AsyncWrite` stream (a
//! tokio-serial port, or a `DuplexStream` from `tokio::io::duplex()` for
//! a simulated modem) to the trait.

use std::future::Future;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Largest chunk a single read can return, matching a DMA receive
/// buffer of the same size.
pub const MAX_CHUNK_SIZE: usize = 128;

/// Line speed the transport falls back to when detection fails
pub const DEFAULT_BAUD: u32 = 115_200;

/// Outcome classification for a single transport read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Data arrived and the receiver went idle afterwards
    ReceivedAndIdle,
    /// Data arrived and filled the receive buffer completely; the
    /// caller should re-arm reception immediately
    ReceivedAndFull,
    /// Data that was already queued when the previous read returned
    /// full; a self-contained continuation chunk
    ReceivedAfterFull,
    /// The transport has not been initialized
    Uninitialized,
    /// Reception was never armed
    ReceivingNotStarted,
    /// Transmission was never armed
    TransmittingNotStarted,
    /// The receiver flagged a framing-level error on the wire
    CmuxFrameError,
    /// The timeout elapsed with nothing to deliver
    ReceivedNoData,
}

impl ReadStatus {
    /// Whether this outcome can carry payload bytes
    pub fn bears_data(&self) -> bool {
        matches!(
            self,
            ReadStatus::ReceivedAndIdle
                | ReadStatus::ReceivedAndFull
                | ReadStatus::ReceivedAfterFull
        )
    }
}

/// One read result: a status code plus up to [`MAX_CHUNK_SIZE`] bytes
#[derive(Debug, Clone)]
pub struct ReadChunk {
    pub status: ReadStatus,
    pub data: Vec<u8>,
}

impl ReadChunk {
    /// An empty chunk with the given status
    pub fn empty(status: ReadStatus) -> Self {
        Self {
            status,
            data: Vec::new(),
        }
    }
}

/// Antenna selection for modules with switched RF paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AntennaBand {
    LowBand,
    HighBand,
}

/// The physical transport contract the link engine is written against
///
/// One implementation is selected at composition time; tests use a
/// simulated modem behind a duplex stream.
pub trait ByteChannel: Send + 'static {
    /// Read up to `max_len` bytes, waiting at most `timeout`
    fn read(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> impl Future<Output = std::io::Result<ReadChunk>> + Send;

    /// Write bytes, returning how many were accepted
    fn write(&mut self, data: &[u8]) -> impl Future<Output = std::io::Result<usize>> + Send;

    /// Wait until data is available or the timeout elapses. Bytes seen
    /// here are retained and returned by the next `read`.
    fn wait(&mut self, timeout: Duration) -> impl Future<Output = std::io::Result<bool>> + Send;

    /// Change the line speed
    fn set_speed(&mut self, bps: u32) -> impl Future<Output = std::io::Result<()>> + Send;

    fn power_up(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;

    fn power_down(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;

    fn restart(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;

    fn enter_sleep(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;

    fn exit_sleep(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;

    fn select_antenna(
        &mut self,
        band: AntennaBand,
    ) -> impl Future<Output = std::io::Result<()>> + Send;
}

/// Adapter from an async byte stream to [`ByteChannel`]
///
/// The configured line speed is published through a shared atomic so a
/// simulated modem on the far end of a duplex stream can decide whether
/// it would "hear" us at the current baud rate.
pub struct StreamChannel<S> {
    io: S,
    /// Bytes observed by `wait` but not yet consumed by `read`
    pending: Vec<u8>,
    speed: Arc<AtomicU32>,
    last_read_full: bool,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: S) -> Self {
        Self {
            io,
            pending: Vec::new(),
            speed: Arc::new(AtomicU32::new(DEFAULT_BAUD)),
            last_read_full: false,
        }
    }

    /// Shared view of the configured line speed, for the simulated
    /// modem on the far end of a duplex stream
    pub fn speed_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.speed)
    }

    /// Pull pending bytes first, capped at `max_len`
    fn take_pending(&mut self, max_len: usize) -> Vec<u8> {
        let n = self.pending.len().min(max_len);
        self.pending.drain(..n).collect()
    }

    fn classify(&mut self, len: usize, max_len: usize) -> ReadStatus {
        let status = if len == 0 {
            ReadStatus::ReceivedNoData
        } else if len >= max_len {
            ReadStatus::ReceivedAndFull
        } else if self.last_read_full {
            ReadStatus::ReceivedAfterFull
        } else {
            ReadStatus::ReceivedAndIdle
        };
        self.last_read_full = status == ReadStatus::ReceivedAndFull;
        status
    }
}

impl<S> ByteChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&mut self, max_len: usize, timeout: Duration) -> std::io::Result<ReadChunk> {
        let max_len = max_len.min(MAX_CHUNK_SIZE);

        if !self.pending.is_empty() {
            let data = self.take_pending(max_len);
            let status = self.classify(data.len(), max_len);
            return Ok(ReadChunk { status, data });
        }

        let mut buf = vec![0u8; max_len];
        match tokio::time::timeout(timeout, self.io.read(&mut buf)).await {
            Ok(Ok(0)) => Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "transport closed",
            )),
            Ok(Ok(n)) => {
                buf.truncate(n);
                let status = self.classify(n, max_len);
                Ok(ReadChunk { status, data: buf })
            }
            Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => {
                Ok(ReadChunk::empty(ReadStatus::ReceivedNoData))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(ReadChunk::empty(ReadStatus::ReceivedNoData)),
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.io.write_all(data).await?;
        self.io.flush().await?;
        Ok(data.len())
    }

    async fn wait(&mut self, timeout: Duration) -> std::io::Result<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }

        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        match tokio::time::timeout(timeout, self.io.read(&mut buf)).await {
            Ok(Ok(0)) => Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "transport closed",
            )),
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(true)
            }
            Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    async fn set_speed(&mut self, bps: u32) -> std::io::Result<()> {
        debug!("transport speed set to {} baud", bps);
        self.speed.store(bps, Ordering::SeqCst);
        Ok(())
    }

    async fn power_up(&mut self) -> std::io::Result<()> {
        debug!("transport power up");
        Ok(())
    }

    async fn power_down(&mut self) -> std::io::Result<()> {
        debug!("transport power down");
        Ok(())
    }

    async fn restart(&mut self) -> std::io::Result<()> {
        debug!("transport restart");
        Ok(())
    }

    async fn enter_sleep(&mut self) -> std::io::Result<()> {
        debug!("transport entering sleep");
        Ok(())
    }

    async fn exit_sleep(&mut self) -> std::io::Result<()> {
        debug!("transport exiting sleep");
        Ok(())
    }

    async fn select_antenna(&mut self, band: AntennaBand) -> std::io::Result<()> {
        debug!("antenna select: {:?}", band);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_delivers_written_bytes() {
        let (a, mut b) = tokio::io::duplex(256);
        let mut chan = StreamChannel::new(a);

        b.write_all(b"hello").await.unwrap();
        let chunk = chan
            .read(MAX_CHUNK_SIZE, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(chunk.status, ReadStatus::ReceivedAndIdle);
        assert_eq!(chunk.data, b"hello");
    }

    #[tokio::test]
    async fn read_times_out_with_no_data_status() {
        let (a, _b) = tokio::io::duplex(256);
        let mut chan = StreamChannel::new(a);

        let chunk = chan
            .read(MAX_CHUNK_SIZE, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(chunk.status, ReadStatus::ReceivedNoData);
        assert!(chunk.data.is_empty());
    }

    #[tokio::test]
    async fn wait_retains_bytes_for_next_read() {
        let (a, mut b) = tokio::io::duplex(256);
        let mut chan = StreamChannel::new(a);

        b.write_all(b"AT\r").await.unwrap();
        assert!(chan.wait(Duration::from_millis(100)).await.unwrap());

        // Bytes seen during wait must not be lost
        let chunk = chan
            .read(MAX_CHUNK_SIZE, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(chunk.data, b"AT\r");
    }

    #[tokio::test]
    async fn full_chunk_then_remainder_classified_after_full() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut chan = StreamChannel::new(a);

        b.write_all(&vec![0xAA; MAX_CHUNK_SIZE + 10]).await.unwrap();

        let first = chan
            .read(MAX_CHUNK_SIZE, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(first.status, ReadStatus::ReceivedAndFull);
        assert_eq!(first.data.len(), MAX_CHUNK_SIZE);

        let second = chan
            .read(MAX_CHUNK_SIZE, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(second.status, ReadStatus::ReceivedAfterFull);
        assert_eq!(second.data.len(), 10);
    }

    #[tokio::test]
    async fn speed_handle_tracks_set_speed() {
        let (a, _b) = tokio::io::duplex(256);
        let mut chan = StreamChannel::new(a);
        let handle = chan.speed_handle();

        assert_eq!(handle.load(Ordering::SeqCst), DEFAULT_BAUD);
        chan.set_speed(460_800).await.unwrap();
        assert_eq!(handle.load(Ordering::SeqCst), 460_800);
    }
}
