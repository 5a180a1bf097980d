//! The proxy server: listener, session registry, and timeout sweeping.

use crate::config::ServerConfig;
use crate::session::{run_session, SessionCtx};
use crate::socks::auth::Authenticator;
use crate::timeout::{SessionId, Wheels};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// The set of live sessions, keyed by id.
///
/// Sessions unlink themselves on completion; the sweeper unlinks the
/// ones it reclaims.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<HashMap<SessionId, AbortHandle>>,
}

impl Registry {
    fn insert(&self, id: SessionId, handle: AbortHandle) {
        self.inner.lock().unwrap().insert(id, handle);
    }

    fn remove(&self, id: SessionId) -> Option<AbortHandle> {
        self.inner.lock().unwrap().remove(&id)
    }

    fn abort_all(&self) {
        for handle in self.inner.lock().unwrap().values() {
            handle.abort();
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// True when no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unlinks a session from the registry and every wheel when its task
/// finishes or is aborted.
struct SessionGuard {
    id: SessionId,
    registry: Arc<Registry>,
    wheels: Arc<Wheels>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        self.wheels.remove_all(self.id);
    }
}

/// A SOCKS5 proxy server.
pub struct ProxyServer {
    cfg: Arc<ServerConfig>,
    auth: Arc<dyn Authenticator>,
    wheels: Arc<Wheels>,
    registry: Arc<Registry>,
}

impl ProxyServer {
    /// Create a server from its configuration and authenticator.
    pub fn new(cfg: ServerConfig, auth: Arc<dyn Authenticator>) -> Self {
        let wheels = Arc::new(Wheels::new(
            cfg.client_stall_timeout,
            cfg.remote_stall_timeout,
            cfg.idle_timeout,
        ));
        ProxyServer {
            cfg: Arc::new(cfg),
            auth,
            wheels,
            registry: Arc::new(Registry::default()),
        }
    }

    /// Number of live sessions.
    pub fn sessions(&self) -> usize {
        self.registry.len()
    }

    /// Open the listening socket with SO_REUSEADDR (and SO_REUSEPORT
    /// where available). Failures here are fatal to startup.
    pub async fn bind(&self) -> Result<TcpListener> {
        let (host, port) = self.cfg.listen_host_port().map_err(anyhow::Error::msg)?;
        let addr = resolve_listen_addr(&host, port).await?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4().context("socket error")?,
            SocketAddr::V6(_) => TcpSocket::new_v6().context("socket error")?,
        };
        socket
            .set_reuseaddr(true)
            .context("setsockopt SO_REUSEADDR error")?;
        #[cfg(unix)]
        socket
            .set_reuseport(true)
            .context("setsockopt SO_REUSEPORT error")?;
        socket
            .bind(addr)
            .with_context(|| format!("bind error for {}", addr))?;
        socket.listen(1024).context("listen error")
    }

    /// Accept and serve sessions until shut down.
    ///
    /// The first shutdown signal stops the listener and lets existing
    /// sessions drain (their timeouts still apply); a second signal
    /// force-terminates them.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let local = listener.local_addr().context("listener address error")?;
        info!("listening on {}", local);

        let sweeper = tokio::spawn(sweep_loop(self.wheels.clone(), self.registry.clone()));
        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        self.spawn_session(&mut sessions, SessionId(next_id), stream, peer);
                    }
                    Err(e) => error!("accept error: {}", e),
                },
                _ = recv_signal(&mut shutdown) => {
                    info!("shutdown requested, draining {} sessions", self.registry.len());
                    break;
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        drop(listener);

        loop {
            tokio::select! {
                joined = sessions.join_next() => match joined {
                    Some(_) => {}
                    None => break,
                },
                _ = recv_signal(&mut shutdown) => {
                    warn!("forced shutdown, aborting {} sessions", self.registry.len());
                    self.registry.abort_all();
                    sessions.abort_all();
                }
            }
        }

        sweeper.abort();
        info!("server stopped");
        Ok(())
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        id: SessionId,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        info!("accepted client {} as session {}", peer, id);

        // handshake deadline; cleared when a command succeeds
        self.wheels.touch_client_stall(id);

        let ctx = SessionCtx {
            id,
            cfg: self.cfg.clone(),
            auth: self.auth.clone(),
            wheels: self.wheels.clone(),
        };
        let registry = self.registry.clone();
        let wheels = self.wheels.clone();
        let handle = sessions.spawn(async move {
            let _guard = SessionGuard {
                id,
                registry,
                wheels,
            };
            run_session(ctx, stream, peer).await;
        });
        self.registry.insert(id, handle);
    }
}

async fn resolve_listen_addr(host: &str, port: u16) -> Result<SocketAddr> {
    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    tokio::net::lookup_host((host, port))
        .await
        .context("getaddrinfo error")?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses found for {:?}", host))
}

/// Resolve on the next shutdown signal; never resolve once the channel
/// is gone.
async fn recv_signal(rx: &mut broadcast::Receiver<()>) {
    loop {
        match rx.recv().await {
            Ok(()) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Sweep the three wheels, reclaim expired sessions, and re-arm to the
/// earliest next expiry.
async fn sweep_loop(wheels: Arc<Wheels>, registry: Arc<Registry>) {
    let mut next = wheels.min_timeout();
    loop {
        tokio::time::sleep(next).await;
        let now = Instant::now();

        let mut stalled_clients = Vec::new();
        let mut stalled_remotes = Vec::new();
        let mut idle = Vec::new();

        let next_client = wheels
            .client_stall
            .lock()
            .unwrap()
            .sweep(now, &mut stalled_clients);
        let next_remote = wheels
            .remote_stall
            .lock()
            .unwrap()
            .sweep(now, &mut stalled_remotes);
        let next_idle = wheels.idle.lock().unwrap().sweep(now, &mut idle);

        for id in stalled_clients {
            expire(&registry, &wheels, id, "client write stalled");
        }
        for id in stalled_remotes {
            expire(&registry, &wheels, id, "remote write stalled");
        }
        for id in idle {
            expire(&registry, &wheels, id, "idle");
        }

        next = next_client.min(next_remote).min(next_idle);
        debug!("next timeout check in {:?}", next);
    }
}

fn expire(registry: &Registry, wheels: &Wheels, id: SessionId, reason: &str) {
    wheels.remove_all(id);
    if let Some(handle) = registry.remove(id) {
        warn!("session {} timed out ({})", id, reason);
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::auth::NoAuth;

    fn test_server(cfg: ServerConfig) -> ProxyServer {
        ProxyServer::new(cfg, Arc::new(NoAuth))
    }

    #[tokio::test]
    async fn test_bind_wildcard_for_empty_host() {
        let cfg = ServerConfig {
            listen: ":0".to_string(),
            ..Default::default()
        };
        let listener = test_server(cfg).bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_unspecified());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_explicit_host() {
        let cfg = ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let listener = test_server(cfg).bind().await.unwrap();
        assert_eq!(
            listener.local_addr().unwrap().ip(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_listen() {
        let cfg = ServerConfig {
            listen: "no-port".to_string(),
            ..Default::default()
        };
        assert!(test_server(cfg).bind().await.is_err());
    }

    #[test]
    fn test_registry_tracks_sessions() {
        let registry = Registry::default();
        assert!(registry.is_empty());

        // a finished task's abort handle is still a valid registry value
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut set: JoinSet<()> = JoinSet::new();
            let handle = set.spawn(async {});
            registry.insert(SessionId(1), handle);
            assert_eq!(registry.len(), 1);

            assert!(registry.remove(SessionId(1)).is_some());
            assert!(registry.remove(SessionId(1)).is_none());
            assert!(registry.is_empty());
        });
    }
}
