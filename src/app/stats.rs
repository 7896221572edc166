use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Process-wide forwarding counters.
///
/// Every counter is updated lock-free. Gauges are only ever adjusted through
/// the guards handed out below, so they cannot underflow.
#[derive(Debug, Default)]
pub struct Stats {
    open_listeners: AtomicU64,
    total_sessions: AtomicU64,
    active_sessions: AtomicU64,
    active_pipes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub open_listeners: u64,
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub active_pipes: u64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            open_listeners: self.open_listeners.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            active_pipes: self.active_pipes.load(Ordering::Relaxed),
        }
    }

    pub fn listener_opened(self: &Arc<Self>) -> Gauge {
        Gauge::acquire(self, Counter::OpenListeners)
    }

    pub fn session_accepted(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(self: &Arc<Self>) -> Gauge {
        Gauge::acquire(self, Counter::ActiveSessions)
    }

    pub fn pipe_started(self: &Arc<Self>) -> Gauge {
        Gauge::acquire(self, Counter::ActivePipes)
    }

    fn counter(&self, which: Counter) -> &AtomicU64 {
        match which {
            Counter::OpenListeners => &self.open_listeners,
            Counter::ActiveSessions => &self.active_sessions,
            Counter::ActivePipes => &self.active_pipes,
        }
    }

    /// Log a [`Snapshot`] every `period` until `cancel` fires.
    pub async fn report(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let s = self.snapshot();
            info!(
                open_listeners = s.open_listeners,
                total_sessions = s.total_sessions,
                active_sessions = s.active_sessions,
                active_pipes = s.active_pipes,
                "proxy stats"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    OpenListeners,
    ActiveSessions,
    ActivePipes,
}

/// Keeps a gauge incremented for as long as it is alive.
#[must_use]
#[derive(Debug)]
pub struct Gauge {
    stats: Arc<Stats>,
    which: Counter,
}

impl Gauge {
    fn acquire(stats: &Arc<Stats>, which: Counter) -> Self {
        stats.counter(which).fetch_add(1, Ordering::Relaxed);
        Self {
            stats: Arc::clone(stats),
            which,
        }
    }
}

impl Drop for Gauge {
    fn drop(&mut self) {
        self.stats.counter(self.which).fetch_sub(1, Ordering::Relaxed);
    }
}
