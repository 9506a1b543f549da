//! One proxied client connection and its upstream counterpart.
//!
//! ## Cancellation
//!
//! There is no stop API. Closing either endpoint of a session is the only way
//! to end it: the forwarder that observes the close shuts its destination and
//! fires the session's [`SessionLink`], which the other forwarder treats as
//! end-of-stream on its pending read.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::forwarder::{Direction, ForwardSummary, Forwarder};
use crate::shaper::Shaper;
use crate::stats::Stats;

/// Close notification shared by the two forwarders of a session.
pub struct SessionLink {
    tx: broadcast::Sender<()>,
    rx: broadcast::Receiver<()>,
}

impl SessionLink {
    /// Two connected ends: closing either one wakes the other.
    pub fn pair() -> (Self, Self) {
        let (tx, rx) = broadcast::channel(1);
        let other = Self {
            tx: tx.clone(),
            rx: tx.subscribe(),
        };
        (Self { tx, rx }, other)
    }

    pub fn close(&self) {
        let _ = self.tx.send(());
    }

    /// Resolves once any end of the link has been closed.
    pub async fn closed(&mut self) {
        let _ = self.rx.recv().await;
    }
}

/// Outcome of a session that reached the relay phase.
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub client_to_server: ForwardSummary,
    pub server_to_client: ForwardSummary,
}

pub struct Session {
    id: u64,
    client: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    shaper: Shaper,
    stats: Stats,
    limiter: Option<Arc<Semaphore>>,
}

impl Session {
    pub fn new(
        id: u64,
        client: TcpStream,
        peer_addr: SocketAddr,
        config: Arc<ProxyConfig>,
        shaper: Shaper,
        stats: Stats,
    ) -> Self {
        Self {
            id,
            client,
            peer_addr,
            config,
            shaper,
            stats,
            limiter: None,
        }
    }

    /// Holds a permit from `limiter` for the whole session.
    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Dials upstream and relays until both directions have finished.
    ///
    /// A failed dial drops the client connection and returns the error; it is
    /// never retried.
    pub async fn run(self) -> Result<SessionReport> {
        let Session {
            id,
            client,
            peer_addr,
            config,
            shaper,
            stats,
            limiter,
        } = self;

        let _permit = match limiter {
            Some(limiter) => limiter.acquire_owned().await.ok(),
            None => None,
        };
        let _guard = stats.session_started();

        info!("[session {}] client connected from {}", id, peer_addr);

        let upstream = match dial(&config).await {
            Ok(stream) => stream,
            Err(e) => {
                stats.upstream_failed();
                warn!("[session {}] {}; closing client {}", id, e, peer_addr);
                return Err(e);
            }
        };
        info!("[session {}] connected to server at {}", id, config.upstream_addr());

        let _ = client.set_nodelay(true);
        let _ = upstream.set_nodelay(true);

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        let (up_link, down_link) = SessionLink::pair();

        let up = Forwarder::new(
            Direction::ClientToServer,
            client_read,
            upstream_write,
            shaper.clone(),
            stats.clone(),
        );
        let down = Forwarder::new(
            Direction::ServerToClient,
            upstream_read,
            client_write,
            shaper,
            stats.clone(),
        );

        let up_task = tokio::spawn(up.run(up_link));
        let down_task = tokio::spawn(down.run(down_link));
        let (up_result, down_result) = tokio::join!(up_task, down_task);

        let client_to_server = up_result.map_err(join_error)?;
        let server_to_client = down_result.map_err(join_error)?;

        info!(
            "[session {}] closed ({} bytes to server, {} bytes to client)",
            id, client_to_server.bytes_written, server_to_client.bytes_written
        );

        Ok(SessionReport {
            id,
            client_to_server,
            server_to_client,
        })
    }
}

async fn dial(config: &ProxyConfig) -> Result<TcpStream> {
    let addr = config.upstream_addr();
    debug!("Dialing upstream {}", addr);
    match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::UpstreamConnect { addr, source }),
        Err(_) => Err(ProxyError::UpstreamTimeout(addr)),
    }
}

fn join_error(e: tokio::task::JoinError) -> ProxyError {
    ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::config::{AttackMode, ShaperConfig};

    async fn connected_pair(listener: &TcpListener) -> (TcpStream, TcpStream, SocketAddr) {
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        (client, accepted, peer)
    }

    fn session_config(upstream: SocketAddr, shaper: ShaperConfig) -> Arc<ProxyConfig> {
        let mut config = ProxyConfig::new("127.0.0.1", 0, upstream.ip().to_string(), upstream.port());
        config.shaper = shaper;
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_link_pair_wakes_other_end() {
        let (a, mut b) = SessionLink::pair();
        a.close();
        tokio::time::timeout(Duration::from_secs(1), b.closed())
            .await
            .expect("link did not fire");
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        // Bind then drop to get a port with nothing listening.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, accepted, peer) = connected_pair(&front).await;

        let config = session_config(dead_addr, ShaperConfig::default());
        let stats = Stats::new();
        let session = Session::new(
            1,
            accepted,
            peer,
            Arc::clone(&config),
            Shaper::new(Arc::new(config.shaper.clone())),
            stats.clone(),
        );

        let err = session.run().await.unwrap_err();
        assert!(err.is_session_scoped());
        assert_eq!(stats.snapshot().failed_upstream, 1);
        assert_eq!(stats.active_sessions(), 0);

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_session_relays_both_directions() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, accepted, peer) = connected_pair(&front).await;

        let config = session_config(upstream_addr, ShaperConfig::with_mode(AttackMode::Transparent));
        let stats = Stats::new();
        let session = Session::new(
            7,
            accepted,
            peer,
            Arc::clone(&config),
            Shaper::new(Arc::new(config.shaper.clone())),
            stats.clone(),
        );
        let handle = tokio::spawn(session.run());

        let (mut server, _) = upstream.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session did not finish")
            .unwrap()
            .unwrap();
        assert_eq!(report.id, 7);
        assert_eq!(report.client_to_server.bytes_written, 4);
        assert_eq!(report.server_to_client.bytes_written, 4);
        assert_eq!(stats.active_sessions(), 0);
    }
}
