use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use owo_colors::OwoColorize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::pipe::pipe;
use super::{Endpoint, Shared};

pub struct Session {
    pub inbound: TcpStream,
    pub peer: SocketAddr,
    pub target: Endpoint,
    pub shared: Arc<Shared>,
}

impl Session {
    /// Bridge the accepted connection to the target until both directions
    /// are done. Failures are logged and never escape the session.
    pub async fn run(self, cancel: CancellationToken) {
        let _active = self.shared.stats.session_started();
        info!("accepted connection from {}", display!(self.peer));

        let outbound = match self.dial(&cancel).await {
            Ok(x) => x,
            Err(e) => {
                error!("cannot connect to {}: {}", display!(self.target), display!(e));
                return;
            }
        };

        info!("{} to {}", "connected".bright_green(), display!(self.target));

        for (side, r) in [
            ("client", self.inbound.set_nodelay(true)),
            ("target", outbound.set_nodelay(true)),
        ] {
            if let Err(e) = r {
                debug!("cannot set TCP_NODELAY on {side} connection: {e}");
            }
        }

        let (mut client_rd, mut client_wr) = self.inbound.into_split();
        let (mut target_rd, mut target_wr) = outbound.into_split();

        let closed = CancellationToken::new();
        let shared = &self.shared;

        let upstream = forward(&mut client_rd, &mut target_wr, shared, &closed)
            .instrument(debug_span!("pipe", direction = "upstream"));
        let downstream = forward(&mut target_rd, &mut client_wr, shared, &closed)
            .instrument(debug_span!("pipe", direction = "downstream"));

        let (sent, received) = tokio::join!(upstream, downstream);

        info!(sent, received, "connection finished");
    }

    async fn dial(&self, cancel: &CancellationToken) -> io::Result<TcpStream> {
        let connect_timeout = self.shared.settings.connect_timeout;
        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));

        tokio::select! {
            _ = cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "shutting down",
            )),
            r = timeout(connect_timeout, connect) => match r {
                Ok(x) => x,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {connect_timeout:?}"),
                )),
            },
        }
    }
}

/// One direction of a session.
///
/// On exit the write side of `dst` is shut down and `closed` is fired so the
/// opposite direction stops as well.
async fn forward<R, W>(src: &mut R, dst: &mut W, shared: &Shared, closed: &CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _pipe = shared.stats.pipe_started();
    let mut buf = shared.buffers.get();

    let mut copied = 0;
    let r = pipe(src, dst, &mut buf, shared.settings.timeouts(), closed, &mut copied).await;

    closed.cancel();
    let _ = dst.shutdown().await;

    match r {
        Ok(()) => {}
        Err(e) if e.is_expected() => debug!("{e}"),
        Err(e) => warn!("{}", display!(e)),
    }

    copied
}
