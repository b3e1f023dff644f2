//! One attached socket
//!
//! A peer owns the read half through a framed reader and hands the write half
//! to a dedicated writer task fed by a bounded queue. Everything sent to a peer
//! (relayed or injected by a plugin) goes through that queue, which keeps the
//! per-direction order.
//!
//! `close()` is graceful: reading stops and no new data is accepted, but the
//! writer still flushes what is already queued before shutting the socket
//! down. `abort()` discards the queue.

use bytes::Bytes;
use futures_util::StreamExt;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::FramedRead;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::codec::{Packet, PacketCodec, READ_CHUNK};
use crate::error::{ProxyError, Result};
use crate::logger::log;

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// How long a closed peer may keep flushing its queue
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Which end of the proxy a peer is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Game client, accepted by the listener
    Client,
    /// Game server, dialed by the connector
    Server,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// Per-peer buffering limits
#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    pub max_packet_size: usize,
    pub outbound_queue: usize,
}

/// An attached connection
pub struct Peer {
    side: Side,
    addr: SocketAddr,
    reader: Mutex<FramedRead<BoxedReader, PacketCodec>>,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    aborted: CancellationToken,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("side", &self.side)
            .field("addr", &self.addr)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Peer {
    /// Split `stream` and start its writer task
    pub fn spawn<S>(stream: S, addr: SocketAddr, side: Side, config: PeerConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::pin(read_half);
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let closed = CancellationToken::new();
        let aborted = CancellationToken::new();

        tokio::spawn(write_loop(
            write_half,
            rx,
            closed.clone(),
            aborted.clone(),
            side,
            addr,
        ));

        Self {
            side,
            addr,
            reader: Mutex::new(FramedRead::with_capacity(
                reader,
                PacketCodec::new(config.max_packet_size),
                READ_CHUNK,
            )),
            outbound: tx,
            closed,
            aborted,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the next complete packet
    ///
    /// Cancel-safe: dropping the future keeps any partially received packet
    /// buffered for the next call. Any error closes the peer.
    pub async fn read_packet(&self) -> Result<Packet> {
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(ProxyError::ConnectionClosed),
            frame = async { self.reader.lock().await.next().await } => match frame {
                Some(Ok(packet)) => Ok(packet),
                Some(Err(e)) => Err(e),
                None => Err(ProxyError::ConnectionClosed),
            },
        };
        if result.is_err() {
            self.close();
        }
        result
    }

    /// Queue raw bytes for the writer task, waiting for queue space
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProxyError::ConnectionClosed);
        }
        self.outbound
            .send(data)
            .await
            .map_err(|_| ProxyError::ConnectionClosed)
    }

    /// Queue raw bytes without waiting; fails when the queue is full
    pub fn try_send(&self, data: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProxyError::ConnectionClosed);
        }
        self.outbound.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("{} outbound queue is full", self.side),
            )),
            mpsc::error::TrySendError::Closed(_) => ProxyError::ConnectionClosed,
        })
    }

    /// Stop reading and flush queued data before shutting down; safe to call
    /// any number of times
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Close without flushing the outbound queue
    pub fn abort(&self) {
        self.aborted.cancel();
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn write_loop<W>(
    mut writer: tokio::io::WriteHalf<W>,
    mut rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    aborted: CancellationToken,
    side: Side,
    addr: SocketAddr,
) where
    W: AsyncRead + AsyncWrite,
{
    // Resolves CLOSE_LINGER after a graceful close, bounding the final flush
    let linger = async {
        closed.cancelled().await;
        tokio::time::sleep(CLOSE_LINGER).await;
    };
    tokio::pin!(linger);

    loop {
        // Queued data goes out before a graceful close is acted on
        let data = tokio::select! {
            biased;
            _ = aborted.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(data) => data,
                None => break,
            },
            _ = closed.cancelled() => break,
        };

        let written = tokio::select! {
            biased;
            _ = aborted.cancelled() => break,
            _ = &mut linger => {
                log::debug!(side = %side, peer = %addr, "Flush timed out, discarding queue");
                break;
            }
            res = writer.write_all(&data) => res,
        };
        if let Err(e) = written {
            log::debug!(side = %side, peer = %addr, error = %e, "Write failed");
            closed.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
    log::debug!(side = %side, peer = %addr, "Writer stopped");
}
