use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::session::Session;
use crate::shaper::Shaper;
use crate::stats::Stats;

/// Pending-connection queue length passed to `listen(2)`.
pub const LISTEN_BACKLOG: u32 = 128;

/// Accept loop that spawns one [`Session`] per inbound client.
pub struct Listener {
    listener: TcpListener,
    config: Arc<ProxyConfig>,
    shaper: Shaper,
    stats: Stats,
    limiter: Option<Arc<Semaphore>>,
}

impl Listener {
    /// Binds the configured listen address with address reuse enabled.
    pub async fn bind(config: Arc<ProxyConfig>, stats: Stats) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = bind_reuse(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr: addr.clone(), source })?;

        let shaper = Shaper::new(Arc::new(config.shaper.clone()));
        let limiter = config.max_connections.map(|n| Arc::new(Semaphore::new(n)));

        Ok(Self {
            listener,
            config,
            shaper,
            stats,
            limiter,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients until `shutdown` resolves, then closes the listening
    /// socket. Sessions already running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Proxy listening on {}", self.config.listen_addr());
        info!("Running in MODE={}", self.shaper.mode());

        tokio::select! {
            _ = shutdown => {
                info!("Shutdown signal received, closing listener");
            },
            _ = self.accept_loop() => {}
        }
    }

    /// Runs until Ctrl+C.
    pub async fn run(self) {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    async fn accept_loop(&self) {
        let mut next_id = 0u64;
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    next_id += 1;
                    let mut session = Session::new(
                        next_id,
                        stream,
                        peer_addr,
                        Arc::clone(&self.config),
                        self.shaper.clone(),
                        self.stats.clone(),
                    );
                    if let Some(limiter) = &self.limiter {
                        session = session.with_limiter(Arc::clone(limiter));
                    }
                    tokio::spawn(async move {
                        if let Err(e) = session.run().await {
                            debug!("Session for {} ended early: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn bind_reuse(addr: &str) -> std::io::Result<TcpListener> {
    let resolved = lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to any address", addr),
        )
    })?;

    let socket = if resolved.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(resolved)?;
    socket.listen(LISTEN_BACKLOG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = Arc::new(ProxyConfig::new("127.0.0.1", 0, "127.0.0.1", 9));
        let listener = Listener::bind(config, Stats::new()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = Arc::new(ProxyConfig::new("127.0.0.1", port, "127.0.0.1", 9));
        let err = Listener::bind(config, Stats::new()).await.err().unwrap();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert!(!err.is_session_scoped());
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let config = Arc::new(ProxyConfig::new("127.0.0.1", 0, "127.0.0.1", 9));
        let listener = Listener::bind(config, Stats::new()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        listener.run_until(async {}).await;

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
