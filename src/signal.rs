use eyre::Result;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct Signals {
    int: Signal,
    term: Signal,
}

impl Signals {
    pub fn new() -> Result<Self> {
        Ok(Self {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
        })
    }

    /// Cancel `token` on the first SIGINT or SIGTERM.
    pub fn cancel_on_terminate(mut self, token: CancellationToken) {
        tokio::spawn(async move {
            tokio::select! {
                _ = self.int.recv() => info!("received SIGINT"),
                _ = self.term.recv() => info!("received SIGTERM"),
                _ = token.cancelled() => return,
            }

            info!("shutting down, waiting for open connections to drain");
            token.cancel();
        });
    }
}
