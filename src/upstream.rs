//! Upstream forwarder.
//!
//! Queries for names outside every local zone are forwarded to a single
//! configured resolver: one UDP exchange bounded by the per-forward
//! timeout, retried over TCP when the answer comes back truncated. The
//! upstream address lives in the KV store under `dns:config:upstream` as
//! `{"address": "1.1.1.1:53"}` so every instance forwards to the same
//! place.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{DnsError, DnsResult};
use crate::store::{KeyValueStore, StoreError, StoreResult};

/// Store key holding the upstream document.
pub const UPSTREAM_CONFIG_KEY: &str = "dns:config:upstream";

/// UDP receive buffer; large enough for EDNS0 answers.
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// The persisted upstream document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfigDoc {
    /// Resolver address as `host:port`.
    pub address: String,
}

/// Forwards queries to the one configured upstream resolver.
pub struct UpstreamForwarder {
    store: Arc<dyn KeyValueStore>,
    addr: RwLock<Option<SocketAddr>>,
    timeout: Duration,
}

impl UpstreamForwarder {
    /// Create a forwarder with no address yet; call [`Self::reload`] or
    /// [`Self::seed_default`] before forwarding.
    pub fn new(store: Arc<dyn KeyValueStore>, per_forward_timeout: Duration) -> Self {
        Self {
            store,
            addr: RwLock::new(None),
            timeout: per_forward_timeout.max(Duration::from_millis(100)),
        }
    }

    /// Load the upstream address from the store.
    pub async fn reload(&self) -> StoreResult<()> {
        let data = self.store.get(UPSTREAM_CONFIG_KEY).await?;
        let doc: UpstreamConfigDoc = serde_json::from_str(&data)
            .map_err(|e| StoreError::encoding(format!("upstream document: {e}")))?;

        let addr = resolve(&doc.address)
            .await
            .map_err(|e| StoreError::encoding(format!("upstream address {}: {e}", doc.address)))?;

        *self.addr.write() = Some(addr);
        info!(upstream = %addr, "loaded upstream resolver");
        Ok(())
    }

    /// Seed `default_address` when the key is absent, then load.
    pub async fn seed_default(&self, default_address: &str) -> StoreResult<()> {
        match self.store.get(UPSTREAM_CONFIG_KEY).await {
            Ok(_) => return self.reload().await,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let doc = UpstreamConfigDoc {
            address: default_address.to_string(),
        };
        let data = serde_json::to_string(&doc)
            .map_err(|e| StoreError::encoding(format!("upstream document: {e}")))?;
        self.store.set(UPSTREAM_CONFIG_KEY, &data).await?;
        info!(upstream = default_address, "seeded default upstream resolver");

        self.reload().await
    }

    /// The resolver currently in use.
    #[must_use]
    pub fn address(&self) -> Option<SocketAddr> {
        *self.addr.read()
    }

    /// Forward `query` and return the upstream's response.
    ///
    /// One UDP exchange within the per-forward timeout; a TC=1 answer is
    /// retried once over TCP under a fresh instance of the same timeout.
    ///
    /// # Errors
    ///
    /// Any failure (no address, socket error, deadline, bad response id)
    /// comes back as a [`DnsError`] for the handler to absorb.
    pub async fn forward(&self, query: &Message) -> DnsResult<Message> {
        let Some(addr) = self.address() else {
            return Err(DnsError::upstream("<unset>", "no upstream configured"));
        };

        let query_bytes = query
            .to_bytes()
            .map_err(|e| DnsError::serialize(format!("failed to serialize query: {e}")))?;

        let response = self.exchange_udp(addr, &query_bytes, query.id()).await?;
        if !response.truncated() {
            return Ok(response);
        }

        debug!(upstream = %addr, "upstream answer truncated, retrying over TCP");
        self.exchange_tcp(addr, &query_bytes, query.id()).await
    }

    async fn exchange_udp(
        &self,
        addr: SocketAddr,
        query_bytes: &[u8],
        query_id: u16,
    ) -> DnsResult<Message> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid bind address")
        } else {
            "[::]:0".parse().expect("valid bind address")
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsError::network_io("failed to bind forwarder socket", e))?;

        socket
            .send_to(query_bytes, addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to send to {addr}"), e))?;

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let (len, from) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DnsError::timeout(format!("UDP exchange with {addr}"), self.timeout))?
            .map_err(|e| DnsError::network_io(format!("recv from {addr} failed"), e))?;

        if from.ip() != addr.ip() {
            return Err(DnsError::upstream(
                addr.to_string(),
                format!("response from unexpected peer {from}"),
            ));
        }

        parse_response(&buf[..len], query_id, addr)
    }

    async fn exchange_tcp(
        &self,
        addr: SocketAddr,
        query_bytes: &[u8],
        query_id: u16,
    ) -> DnsResult<Message> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| DnsError::network_io(format!("TCP connect to {addr} failed"), e))?;

            let len = u16::try_from(query_bytes.len())
                .map_err(|_| DnsError::serialize("query exceeds 65535 bytes"))?;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(query_bytes).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let response_len = u16::from_be_bytes(len_buf) as usize;

            let mut response_buf = vec![0u8; response_len];
            stream.read_exact(&mut response_buf).await?;

            parse_response(&response_buf, query_id, addr)
        };

        timeout(self.timeout, exchange)
            .await
            .map_err(|_| DnsError::timeout(format!("TCP exchange with {addr}"), self.timeout))?
    }
}

fn parse_response(bytes: &[u8], query_id: u16, addr: SocketAddr) -> DnsResult<Message> {
    let response = Message::from_bytes(bytes)
        .map_err(|e| DnsError::upstream(addr.to_string(), format!("unparseable response: {e}")))?;

    if response.id() != query_id {
        warn!(upstream = %addr, expected = query_id, got = response.id(), "response id mismatch");
        return Err(DnsError::upstream(addr.to_string(), "response id mismatch"));
    }

    Ok(response)
}

async fn resolve(address: &str) -> std::io::Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address for upstream")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use hickory_proto::op::{Header, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::{rdata, Name, RData, Record, RecordType};

    fn make_query(id: u16, name: &str) -> Message {
        let mut message = Message::new();
        let mut header = Header::new();
        header.set_id(id);
        header.set_message_type(MessageType::Query);
        header.set_op_code(OpCode::Query);
        header.set_recursion_desired(true);
        message.set_header(header);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        message
    }

    fn make_response(query: &Message, addr: std::net::Ipv4Addr) -> Message {
        let mut response = Message::new();
        let mut header = Header::response_from_request(query.header());
        header.set_response_code(ResponseCode::NoError);
        response.set_header(header);
        for q in query.queries() {
            response.add_query(q.clone());
        }
        let name = query.queries()[0].name().clone();
        response.add_answer(Record::from_rdata(name, 300, RData::A(rdata::A(addr))));
        response
    }

    async fn forwarder_with(address: &str) -> UpstreamForwarder {
        let store = Arc::new(MemoryStore::new());
        let doc = UpstreamConfigDoc {
            address: address.to_string(),
        };
        store
            .set(UPSTREAM_CONFIG_KEY, &serde_json::to_string(&doc).unwrap())
            .await
            .unwrap();
        let forwarder = UpstreamForwarder::new(store, Duration::from_millis(500));
        forwarder.reload().await.unwrap();
        forwarder
    }

    #[tokio::test]
    async fn test_seed_default_then_load() {
        let store = Arc::new(MemoryStore::new());
        let forwarder = UpstreamForwarder::new(store.clone(), Duration::from_secs(3));
        forwarder.seed_default("127.0.0.1:5353").await.unwrap();
        assert_eq!(
            forwarder.address().unwrap().to_string(),
            "127.0.0.1:5353"
        );

        // An existing document wins over a different default.
        let other = UpstreamForwarder::new(store, Duration::from_secs(3));
        other.seed_default("127.0.0.1:9999").await.unwrap();
        assert_eq!(other.address().unwrap().to_string(), "127.0.0.1:5353");
    }

    #[tokio::test]
    async fn test_forward_without_address_fails() {
        let forwarder =
            UpstreamForwarder::new(Arc::new(MemoryStore::new()), Duration::from_millis(100));
        let query = make_query(0x1234, "example.com.");
        assert!(forwarder.forward(&query).await.is_err());
    }

    #[tokio::test]
    async fn test_forward_udp_round_trip() {
        // Stand up a one-shot fake resolver on localhost.
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let query = Message::from_bytes(&buf[..len]).unwrap();
            let response = make_response(&query, std::net::Ipv4Addr::new(93, 184, 216, 34));
            upstream
                .send_to(&response.to_bytes().unwrap(), peer)
                .await
                .unwrap();
        });

        let forwarder = forwarder_with(&upstream_addr.to_string()).await;
        let query = make_query(0x4242, "example.com.");
        let response = forwarder.forward(&query).await.unwrap();

        assert_eq!(response.id(), 0x4242);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_times_out_on_silent_upstream() {
        // Bound but never answers.
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let forwarder = forwarder_with(&upstream_addr.to_string()).await;
        let query = make_query(0x1111, "example.com.");
        let err = forwarder.forward(&query).await.unwrap_err();
        assert!(err.is_timeout());
        drop(upstream);
    }

    #[tokio::test]
    async fn test_truncated_udp_falls_back_to_tcp() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let tcp = tokio::net::TcpListener::bind(addr).await.unwrap();

        // UDP side answers with TC=1 and no answers.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = udp.recv_from(&mut buf).await.unwrap();
            let query = Message::from_bytes(&buf[..len]).unwrap();
            let mut response = Message::new();
            let mut header = Header::response_from_request(query.header());
            header.set_truncated(true);
            response.set_header(header);
            for q in query.queries() {
                response.add_query(q.clone());
            }
            udp.send_to(&response.to_bytes().unwrap(), peer).await.unwrap();
        });

        // TCP side answers for real.
        tokio::spawn(async move {
            let (mut stream, _) = tcp.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut query_buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut query_buf).await.unwrap();
            let query = Message::from_bytes(&query_buf).unwrap();

            let response = make_response(&query, std::net::Ipv4Addr::new(198, 51, 100, 7));
            let bytes = response.to_bytes().unwrap();
            stream
                .write_all(&(bytes.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&bytes).await.unwrap();
        });

        let forwarder = forwarder_with(&addr.to_string()).await;
        let query = make_query(0x2222, "big.example.com.");
        let response = forwarder.forward(&query).await.unwrap();

        assert!(!response.truncated());
        assert_eq!(response.answers().len(), 1);
    }
}
