//! TCP listener.
//!
//! Accepts connections on the same address as the UDP listener and runs
//! each one on its own task. Messages use the RFC 1035 2-byte length
//! framing; a connection may carry several queries in sequence and is
//! closed after [`IDLE_TIMEOUT`] without a new query, or when the client
//! half-closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{DnsError, DnsResult};

use super::handler::{DnsHandler, QUERY_DEADLINE};

/// Maximum framed message size (RFC 1035 length prefix is 16-bit).
pub const MAX_TCP_MESSAGE_SIZE: usize = 65_535;

/// Smallest parseable DNS message (header only).
pub const MIN_DNS_MESSAGE_SIZE: usize = 12;

/// Idle time before a quiet connection is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener counters.
#[derive(Debug, Default)]
pub struct TcpServerStats {
    connections_accepted: AtomicU64,
    connections_open: AtomicUsize,
    queries_processed: AtomicU64,
    read_errors: AtomicU64,
}

impl TcpServerStats {
    /// Connections accepted since start.
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Connections currently open.
    #[must_use]
    pub fn connections_open(&self) -> usize {
        self.connections_open.load(Ordering::Relaxed)
    }

    /// Queries answered over TCP.
    #[must_use]
    pub fn queries_processed(&self) -> u64 {
        self.queries_processed.load(Ordering::Relaxed)
    }

    /// Framing or socket errors while reading.
    #[must_use]
    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }
}

/// TCP DNS server.
pub struct TcpDnsServer {
    listener: TcpListener,
    handler: Arc<DnsHandler>,
    stats: Arc<TcpServerStats>,
    local_addr: SocketAddr,
}

impl TcpDnsServer {
    /// Bind `addr` and attach `handler`.
    pub async fn bind(addr: SocketAddr, handler: Arc<DnsHandler>) -> DnsResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind TCP socket {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to read local address", e))?;

        info!(addr = %local_addr, "TCP DNS server bound");

        Ok(Self {
            listener,
            handler,
            stats: Arc::new(TcpServerStats::default()),
            local_addr,
        })
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Counters handle.
    #[must_use]
    pub fn stats(&self) -> Arc<TcpServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept loop; exits when `stop` flips to true. Each connection runs
    /// on its own task.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> DnsResult<()> {
        info!(addr = %self.local_addr, "TCP DNS server serving");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "TCP accept failed");
                            continue;
                        }
                    };

                    self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_open.fetch_add(1, Ordering::Relaxed);
                    trace!(peer = %peer, "accepted TCP connection");

                    let handler = Arc::clone(&self.handler);
                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, peer, handler, &stats).await {
                            debug!(peer = %peer, error = %err, "TCP connection ended");
                        }
                        stats.connections_open.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!(addr = %self.local_addr, "TCP DNS server stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<DnsHandler>,
    stats: &TcpServerStats,
) -> DnsResult<()> {
    loop {
        // Length prefix, or a clean close while idle.
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(err)) => {
                stats.read_errors.fetch_add(1, Ordering::Relaxed);
                return Err(DnsError::network_io("TCP length read failed", err));
            }
            Err(_) => {
                trace!(peer = %peer, "closing idle TCP connection");
                return Ok(());
            }
        }

        let message_len = u16::from_be_bytes(len_buf) as usize;
        if message_len < MIN_DNS_MESSAGE_SIZE {
            stats.read_errors.fetch_add(1, Ordering::Relaxed);
            return Err(DnsError::parse(format!(
                "framed message too short: {message_len} bytes"
            )));
        }

        let mut query = vec![0u8; message_len];
        stream
            .read_exact(&mut query)
            .await
            .map_err(|e| DnsError::network_io("TCP message read failed", e))?;

        let response =
            match tokio::time::timeout(QUERY_DEADLINE, handler.handle_bytes(peer, &query)).await {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(_) => {
                    warn!(peer = %peer, "TCP query exceeded deadline");
                    continue;
                }
            };

        let response_len = u16::try_from(response.len())
            .map_err(|_| DnsError::serialize("response exceeds 65535 bytes"))?;
        stream
            .write_all(&response_len.to_be_bytes())
            .await
            .map_err(|e| DnsError::network_io("TCP length write failed", e))?;
        stream
            .write_all(&response)
            .await
            .map_err(|e| DnsError::network_io("TCP message write failed", e))?;

        stats.queries_processed.fetch_add(1, Ordering::Relaxed);
        trace!(peer = %peer, len = response.len(), "sent TCP response");
    }
}
