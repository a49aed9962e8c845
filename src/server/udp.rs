//! UDP listener.
//!
//! Binds the configured address and hands each datagram to its own task;
//! the handler writes exactly one response back on the same socket. A
//! response that does not fit the client's buffer (512 bytes without
//! EDNS0, the advertised size with it) is replaced by a truncated
//! response with TC=1 so the client retries over TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hickory_proto::op::{Header, Message, MessageType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{DnsError, DnsResult};

use super::handler::{DnsHandler, QUERY_DEADLINE};

/// Maximum inbound datagram this server reads.
pub const MAX_UDP_MESSAGE_SIZE: usize = 4096;

/// Response budget for clients without EDNS0 (RFC 1035).
pub const MAX_UDP_RESPONSE_SIZE_NO_EDNS: usize = 512;

/// Listener counters.
#[derive(Debug, Default)]
pub struct UdpServerStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
    truncated_responses: AtomicU64,
}

impl UdpServerStats {
    /// Datagrams received.
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Responses written.
    #[must_use]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Queries that produced no response (unanswerable or send failure).
    #[must_use]
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    /// Responses replaced by a TC=1 stub.
    #[must_use]
    pub fn truncated_responses(&self) -> u64 {
        self.truncated_responses.load(Ordering::Relaxed)
    }
}

/// UDP DNS server.
pub struct UdpDnsServer {
    socket: Arc<UdpSocket>,
    handler: Arc<DnsHandler>,
    stats: Arc<UdpServerStats>,
    local_addr: SocketAddr,
}

impl UdpDnsServer {
    /// Bind `addr` and attach `handler`.
    pub async fn bind(addr: SocketAddr, handler: Arc<DnsHandler>) -> DnsResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind UDP socket {addr}"), e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to read local address", e))?;

        info!(addr = %local_addr, "UDP DNS server bound");

        Ok(Self {
            socket: Arc::new(socket),
            handler,
            stats: Arc::new(UdpServerStats::default()),
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
    pub fn stats(&self) -> Arc<UdpServerStats> {
        Arc::clone(&self.stats)
    }

    /// Receive loop; exits when `stop` flips to true. Each datagram is
    /// processed on its own task.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> DnsResult<()> {
        info!(addr = %self.local_addr, "UDP DNS server serving");
        let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "UDP recv failed");
                            continue;
                        }
                    };

                    self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                    trace!(peer = %peer, len, "received UDP query");

                    let query = buf[..len].to_vec();
                    let socket = Arc::clone(&self.socket);
                    let handler = Arc::clone(&self.handler);
                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(async move {
                        handle_datagram(socket, handler, stats, peer, query).await;
                    });
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!(addr = %self.local_addr, "UDP DNS server stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    handler: Arc<DnsHandler>,
    stats: Arc<UdpServerStats>,
    peer: SocketAddr,
    query: Vec<u8>,
) {
    let response = match tokio::time::timeout(QUERY_DEADLINE, handler.handle_bytes(peer, &query))
        .await
    {
        Ok(response) => response,
        Err(_) => {
            warn!(peer = %peer, "query exceeded deadline");
            servfail_bytes(&query)
        }
    };

    let Some(response) = response else {
        stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let budget = client_buffer_size(&query);
    let response = if response.len() > budget {
        stats.truncated_responses.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, size = response.len(), budget, "truncating oversize UDP response");
        truncated_response(&query).unwrap_or(response)
    } else {
        response
    };

    match socket.send_to(&response, peer).await {
        Ok(sent) => {
            stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            trace!(peer = %peer, len = sent, "sent UDP response");
        }
        Err(err) => {
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(peer = %peer, error = %err, "failed to send UDP response");
        }
    }
}

/// The client's advertised buffer size: the EDNS0 payload size when
/// present, 512 otherwise.
fn client_buffer_size(query_bytes: &[u8]) -> usize {
    let Ok(query) = Message::from_bytes(query_bytes) else {
        return MAX_UDP_RESPONSE_SIZE_NO_EDNS;
    };
    match query.extensions() {
        Some(edns) => usize::from(edns.max_payload()).max(MAX_UDP_RESPONSE_SIZE_NO_EDNS),
        None => MAX_UDP_RESPONSE_SIZE_NO_EDNS,
    }
}

/// A header-plus-question response with TC=1.
fn truncated_response(query_bytes: &[u8]) -> Option<Vec<u8>> {
    let query = Message::from_bytes(query_bytes).ok()?;

    let mut response = Message::new();
    let mut header = Header::response_from_request(query.header());
    header.set_message_type(MessageType::Response);
    header.set_truncated(true);
    response.set_header(header);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response.to_bytes().ok()
}

/// A bare SERVFAIL carrying the query id, for deadline overruns.
fn servfail_bytes(query_bytes: &[u8]) -> Option<Vec<u8>> {
    let query = Message::from_bytes(query_bytes).ok()?;
    let mut response = Message::new();
    let mut header = Header::response_from_request(query.header());
    header.set_message_type(MessageType::Response);
    header.set_response_code(hickory_proto::op::ResponseCode::ServFail);
    response.set_header(header);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response.to_bytes().ok()
}
