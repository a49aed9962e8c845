//! Liveness and readiness probe endpoints.
//!
//! Two tiny HTTP servers: `GET /health/live` always answers `200 OK`
//! while the process runs; `GET /health/ready` answers `200 Ready` once
//! the DNS listener is bound and the store has answered a request, and
//! `503 Not Ready` otherwise (including during shutdown drain).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{DnsError, DnsResult};

/// Shared readiness flag.
#[derive(Debug, Default)]
pub struct ProbeState {
    ready: AtomicBool,
}

impl ProbeState {
    /// Create an initially not-ready state.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Flip readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        if ready {
            info!("service marked ready");
        } else {
            info!("service marked not ready");
        }
    }

    /// Current readiness.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn handle_live() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn handle_ready(State(state): State<Arc<ProbeState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Ready")
    }
}

/// Bind and serve both probe servers, returning the bound addresses. The
/// serving tasks are detached and run until process exit.
pub async fn start(
    liveness_addr: SocketAddr,
    readiness_addr: SocketAddr,
    state: Arc<ProbeState>,
) -> DnsResult<(SocketAddr, SocketAddr)> {
    let liveness = Router::new().route("/health/live", get(handle_live));
    let readiness = Router::new()
        .route("/health/ready", get(handle_ready))
        .with_state(state);

    let liveness_listener = tokio::net::TcpListener::bind(liveness_addr)
        .await
        .map_err(|e| DnsError::network_io(format!("failed to bind {liveness_addr}"), e))?;
    let readiness_listener = tokio::net::TcpListener::bind(readiness_addr)
        .await
        .map_err(|e| DnsError::network_io(format!("failed to bind {readiness_addr}"), e))?;

    let bound_liveness = liveness_listener
        .local_addr()
        .map_err(|e| DnsError::network_io("failed to read local address", e))?;
    let bound_readiness = readiness_listener
        .local_addr()
        .map_err(|e| DnsError::network_io("failed to read local address", e))?;

    info!(liveness = %bound_liveness, readiness = %bound_readiness, "probe servers listening");

    let _liveness_task: JoinHandle<()> = tokio::spawn(async move {
        let _ = axum::serve(liveness_listener, liveness).await;
    });
    let _readiness_task: JoinHandle<()> = tokio::spawn(async move {
        let _ = axum::serve(readiness_listener, readiness).await;
    });

    Ok((bound_liveness, bound_readiness))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_body(addr: SocketAddr, path: &str) -> (u16, String) {
        let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        let status = response.status().as_u16();
        (status, response.text().await.unwrap())
    }

    #[tokio::test]
    async fn test_probe_lifecycle() {
        let state = ProbeState::new();

        let (live_addr, ready_addr) = start(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&state),
        )
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (status, body) = get_body(live_addr, "/health/live").await;
        assert_eq!(status, 200);
        assert_eq!(body, "OK");

        let (status, body) = get_body(ready_addr, "/health/ready").await;
        assert_eq!(status, 503);
        assert_eq!(body, "Not Ready");

        state.set_ready(true);
        let (status, body) = get_body(ready_addr, "/health/ready").await;
        assert_eq!(status, 200);
        assert_eq!(body, "Ready");

        state.set_ready(false);
        let (status, _) = get_body(ready_addr, "/health/ready").await;
        assert_eq!(status, 503);
    }
}
