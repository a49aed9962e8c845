//! DNS listeners and the query pipeline.
//!
//! [`DnsServer`] binds UDP and TCP on the same address, flips the
//! readiness probe once both listeners are up, and serves until the stop
//! signal. The per-query work lives in [`handler::DnsHandler`]; rate
//! limiting in [`rate_limit::RateLimiter`].

pub mod handler;
pub mod rate_limit;
pub mod tcp;
pub mod udp;

pub use handler::{DnsHandler, HandlerParts, QUERY_DEADLINE};
pub use rate_limit::RateLimiter;
pub use tcp::TcpDnsServer;
pub use udp::UdpDnsServer;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::error::DnsResult;
use crate::probes::ProbeState;

/// The UDP+TCP server pair.
pub struct DnsServer {
    udp: UdpDnsServer,
    tcp: TcpDnsServer,
    probe_state: Arc<ProbeState>,
}

impl DnsServer {
    /// Bind both transports on `addr`. With an ephemeral port, TCP
    /// follows the port the UDP bind was given.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<DnsHandler>,
        probe_state: Arc<ProbeState>,
    ) -> DnsResult<Self> {
        let udp = UdpDnsServer::bind(addr, Arc::clone(&handler)).await?;
        let tcp_addr = if addr.port() == 0 {
            udp.local_addr()
        } else {
            addr
        };
        let tcp = TcpDnsServer::bind(tcp_addr, handler).await?;
        Ok(Self {
            udp,
            tcp,
            probe_state,
        })
    }

    /// The bound UDP address (TCP shares the port).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    /// Serve both transports until `stop` flips to true. Marks the
    /// service ready on entry and not-ready on the way out.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> DnsResult<()> {
        info!(addr = %self.local_addr(), "DNS server listening (udp/tcp)");
        self.probe_state.set_ready(true);

        let result = tokio::try_join!(self.udp.run(stop.clone()), self.tcp.run(stop));

        self.probe_state.set_ready(false);
        result.map(|_| ())
    }
}
