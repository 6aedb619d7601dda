#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! The probekit transport layer: an owned bidirectional byte stream with
//! per-transport timeouts and idempotent close, produced by the connect
//! pipeline (resolution, TCP cascade, optional SOCKS5 and TLS stages).

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use probekit_common::{Failure, FailureKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub mod dial;
mod replay;
mod socks5;
mod tls;

pub use dial::connect;
pub use replay::ReplayIo;

const RECV_CHUNK: usize = 8 * 1024;

/// Object-safe bound for the streams a transport can own.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> Io for T {}

/// A connected byte stream.
///
/// Writes drain in order; [`Transport::recv`] yields chunks in arrival
/// order and reports orderly peer shutdown as `EofError`. After
/// [`Transport::close`] (or a fatal error) every operation fails with
/// `NetworkError` and nothing further is surfaced; closing again is a
/// no-op.
pub struct Transport {
    io: Option<Box<dyn Io>>,
    peer: Option<SocketAddr>,
    timeout: Option<Duration>,
    connect_errors: Vec<Failure>,
}

impl Transport {
    /// Wraps an already-connected stream.
    pub fn from_io(io: impl Io + 'static) -> Self {
        Self::from_boxed(Box::new(io), None, Vec::new())
    }

    pub(crate) fn from_boxed(
        io: Box<dyn Io>,
        peer: Option<SocketAddr>,
        connect_errors: Vec<Failure>,
    ) -> Self {
        Self { io: Some(io), peer, timeout: None, connect_errors }
    }

    /// The address the cascade finally connected to, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Per-address failures collected while cascading, for diagnostics.
    pub fn connect_errors(&self) -> &[Failure] {
        &self.connect_errors
    }

    /// Arms the one-shot I/O timeout: a recv or flush not completing
    /// within `delay` fails with `TimeoutError`.
    pub fn set_timeout(&mut self, delay: Duration) {
        self.timeout = Some(delay);
    }

    pub fn clear_timeout(&mut self) {
        self.timeout = None;
    }

    pub fn is_closed(&self) -> bool {
        self.io.is_none()
    }

    /// Queues `data` and drains the queue in order.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), Failure> {
        let io = self.io_mut()?;
        if let Err(err) = io.write_all(data).await {
            let failure = Failure::from(err);
            self.abort();
            return Err(failure);
        }
        Ok(())
    }

    /// Completes once the write queue is empty.
    pub async fn flush(&mut self) -> Result<(), Failure> {
        let delay = self.timeout;
        let io = self.io_mut()?;
        let result = match delay {
            Some(delay) => match timeout(delay, io.flush()).await {
                Ok(result) => result.map_err(Failure::from),
                Err(_) => Err(Failure::with_reason(FailureKind::Timeout, "flush timed out")),
            },
            None => io.flush().await.map_err(Failure::from),
        };
        if let Err(failure) = result {
            self.abort();
            return Err(failure);
        }
        Ok(())
    }

    /// Receives the next chunk. Orderly peer close yields `EofError`;
    /// the caller moves the bytes into its own buffer.
    pub async fn recv(&mut self) -> Result<Bytes, Failure> {
        let delay = self.timeout;
        let io = self.io_mut()?;
        let mut chunk = vec![0u8; RECV_CHUNK];
        let read = match delay {
            Some(delay) => match timeout(delay, io.read(&mut chunk)).await {
                Ok(result) => result.map_err(Failure::from),
                Err(_) => Err(Failure::with_reason(FailureKind::Timeout, "recv timed out")),
            },
            None => io.read(&mut chunk).await.map_err(Failure::from),
        };
        match read {
            Ok(0) => Err(Failure::with_reason(FailureKind::Eof, "connection closed by peer")),
            Ok(n) => {
                chunk.truncate(n);
                Ok(Bytes::from(chunk))
            }
            Err(failure) => {
                self.abort();
                Err(failure)
            }
        }
    }

    /// Shuts the stream down. Idempotent: exactly one close takes effect
    /// and later calls return immediately.
    pub async fn close(&mut self) {
        if let Some(mut io) = self.io.take() {
            tracing::debug!(peer = ?self.peer, "closing transport");
            let _ = io.shutdown().await;
        }
    }

    pub(crate) fn into_io(mut self) -> Result<Box<dyn Io>, Failure> {
        self.io.take().ok_or_else(closed_failure)
    }

    fn io_mut(&mut self) -> Result<&mut Box<dyn Io>, Failure> {
        self.io.as_mut().ok_or_else(closed_failure)
    }

    /// Drops the stream after a fatal error so nothing further fires.
    fn abort(&mut self) {
        self.io = None;
    }
}

fn closed_failure() -> Failure {
    Failure::with_reason(FailureKind::Network, "transport closed")
}
