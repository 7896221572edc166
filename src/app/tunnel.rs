use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::session::Session;
use super::{Endpoint, Shared};

/// Source of inbound connections for a [`Tunnel`].
pub trait Accept: Send + Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Bind `listen`. An empty host means every interface, IPv6 included
/// where the system supports it.
pub async fn bind(listen: &Endpoint) -> io::Result<TcpListener> {
    if !listen.host.is_empty() {
        return TcpListener::bind((listen.host.as_str(), listen.port)).await;
    }

    match TcpListener::bind((Ipv6Addr::UNSPECIFIED, listen.port)).await {
        Ok(x) => Ok(x),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(e),
        Err(e) => {
            debug!("no IPv6 listener on port {}: {e}, using IPv4", listen.port);
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, listen.port)).await
        }
    }
}

/// One source port forwarded to one target port.
pub struct Tunnel {
    pub listen: Endpoint,
    pub target: Endpoint,
    pub shared: Arc<Shared>,
}

impl Tunnel {
    /// Accept connections until `cancel` fires, then wait for every session
    /// accepted here to finish.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let bound = async {
            debug!("bind listener on {}", display!(self.listen));
            bind(&self.listen).await
        }
        .instrument(self.span())
        .await;

        let listener = bound
            .with_context(|| format!("failed to bind listener on {}", self.listen))
            .with_context(|| format!("forwarding {} -> {}", self.listen, self.target))?;

        self.serve_on(listener, cancel).await
    }

    /// Like [`Tunnel::serve`] on an already open listener.
    pub async fn serve_on<L: Accept>(self, listener: L, cancel: CancellationToken) -> Result<()> {
        let span = self.span();

        self.run(listener, cancel)
            .instrument(span)
            .await
            .with_context(|| format!("forwarding {} -> {}", self.listen, self.target))
    }

    fn span(&self) -> tracing::Span {
        error_span!(
            "tunnel",
            listen = self.listen.to_string(),
            target = self.target.to_string()
        )
    }

    async fn run<L: Accept>(&self, listener: L, cancel: CancellationToken) -> Result<()> {
        let open = self.shared.stats.listener_opened();
        let sessions = TaskTracker::new();

        let r = self.accept_loop(&listener, &sessions, &cancel).await;

        // a fatal accept error takes every sibling listener down with it
        if r.is_err() {
            cancel.cancel();
        }

        drop(listener);
        drop(open);
        sessions.close();

        if !sessions.is_empty() {
            info!("waiting for {} connections to finish", sessions.len());
            sessions.wait().await;
            info!("all connections finished");
        }

        r
    }

    async fn accept_loop<L: Accept>(
        &self,
        listener: &L,
        sessions: &TaskTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                x = listener.accept() => x,
            };

            let (inbound, peer) = match accepted {
                Ok(x) => x,
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to accept connection on {}", self.listen));
                }
            };

            self.shared.stats.session_accepted();

            let session = Session {
                inbound,
                peer,
                target: self.target.clone(),
                shared: Arc::clone(&self.shared),
            };

            let span = info_span!("session", peer = peer.to_string());
            sessions.spawn(session.run(cancel.clone()).instrument(span));
        }
    }
}
