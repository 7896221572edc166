use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, eyre};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::ports::PortRange;

pub mod pipe;
mod session;
mod stats;
mod tunnel;

use self::pipe::{BufferPool, Timeouts};
use self::stats::Stats;
use self::tunnel::Tunnel;

pub use self::stats::Snapshot;

/// A host name or IP literal together with a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.is_empty() {
            write!(f, "*:{}", self.port)
        } else if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_host: String,
    pub target_host: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_timeout: Duration,
    pub stats_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_host: String::new(),
            target_host: "127.0.0.1".into(),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            stats_interval: Duration::from_secs(5),
        }
    }
}

impl Settings {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            read: self.read_timeout,
            write: self.write_timeout,
        }
    }
}

/// State shared by every tunnel and session of one [`App`].
#[derive(Debug)]
pub struct Shared {
    settings: Settings,
    stats: Arc<Stats>,
    buffers: Arc<BufferPool>,
}

#[derive(Debug)]
pub struct App {
    ports: PortRange,
    shared: Arc<Shared>,
}

impl Shared {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            stats: Stats::new(),
            buffers: BufferPool::new(),
        }
    }
}

impl App {
    pub fn new(ports: PortRange, settings: Settings) -> Self {
        Self {
            ports,
            shared: Arc::new(Shared::new(settings)),
        }
    }

    pub fn stats(&self) -> Snapshot {
        self.shared.stats.snapshot()
    }

    /// Forward every port of the range until `cancel` fires.
    ///
    /// Returns once every listener is closed and every session it accepted
    /// has finished. The first bind or accept failure stops all listeners
    /// and is returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let cancel = cancel.child_token();
        let settings = &self.shared.settings;

        info!(
            "forwarding {} ports: {} to {}",
            self.ports.port_count(),
            display!(self.ports),
            settings.target_host
        );
        debug!(
            "timeouts: read {}, write {}, connect {}",
            display!(settings.read_timeout),
            display!(settings.write_timeout),
            display!(settings.connect_timeout)
        );

        let reporter = tokio::spawn(
            Arc::clone(&self.shared.stats).report(settings.stats_interval, cancel.clone()),
        );

        let mut tunnels = JoinSet::new();
        for (source, dest) in self.ports.pairs() {
            let tunnel = Tunnel {
                listen: Endpoint::new(settings.listen_host.as_str(), source),
                target: Endpoint::new(settings.target_host.as_str(), dest),
                shared: Arc::clone(&self.shared),
            };

            tunnels.spawn(tunnel.serve(cancel.clone()));
        }

        let mut result = Ok(());
        while let Some(r) = tunnels.join_next().await {
            let r = r.map_err(|e| eyre!("listener task failed: {e}")).and_then(|r| r);

            if let Err(e) = r {
                if result.is_ok() {
                    cancel.cancel();
                    result = Err(e);
                } else {
                    debug!("additional listener failure: {e:#}");
                }
            }
        }

        cancel.cancel();
        join_reporter(reporter).await;

        result
    }
}

async fn join_reporter(reporter: JoinHandle<()>) {
    if let Err(e) = reporter.await {
        debug!("stats reporter failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    use super::*;

    async fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    fn settings() -> Settings {
        Settings {
            listen_host: "127.0.0.1".into(),
            target_host: "127.0.0.1".into(),
            stats_interval: Duration::from_millis(50),
            ..Settings::default()
        }
    }

    fn single(source: u16, dest: u16) -> PortRange {
        format!("{source}-{source}:{dest}-{dest}").parse().unwrap()
    }

    struct Running {
        app: Arc<App>,
        cancel: CancellationToken,
        handle: JoinHandle<Result<()>>,
        listen: SocketAddr,
    }

    async fn start(upstream: &TcpListener, settings: Settings) -> Running {
        let dest = upstream.local_addr().unwrap().port();
        let source = free_port().await;

        let app = Arc::new(App::new(single(source, dest), settings));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let app = Arc::clone(&app);
            let cancel = cancel.clone();
            async move { app.run(cancel).await }
        });

        let listen: SocketAddr = format!("127.0.0.1:{source}").parse().unwrap();
        wait_until(|| app.stats().open_listeners == 1).await;

        Running {
            app,
            cancel,
            handle,
            listen,
        }
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !f() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn relays_ping_pong() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = start(&upstream, settings()).await;

        let mut client = TcpStream::connect(running.listen).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let (mut server, _) = upstream.accept().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        drop(server);

        wait_until(|| running.app.stats().active_sessions == 0).await;
        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();

        let stats = running.app.stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.open_listeners, 0);
    }

    #[tokio::test]
    async fn relays_large_payloads_in_both_directions() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = start(&upstream, settings()).await;

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i * 7 % 256) as u8).collect();

        let mut client = TcpStream::connect(running.listen).await.unwrap();
        let (mut server, _) = upstream.accept().await.unwrap();

        let echo = tokio::spawn(async move {
            let mut received = vec![0u8; 1_000_000];
            server.read_exact(&mut received).await.unwrap();
            let reply: Vec<u8> = received.iter().rev().copied().collect();
            server.write_all(&reply).await.unwrap();
            received
        });

        let (mut rd, mut wr) = client.split();
        let send = async { wr.write_all(&payload).await.unwrap() };
        let recv = async {
            let mut reply = vec![0u8; 1_000_000];
            rd.read_exact(&mut reply).await.unwrap();
            reply
        };
        let ((), reply) = tokio::join!(send, recv);

        let received = echo.await.unwrap();
        assert_eq!(received, payload);
        assert!(reply.iter().eq(payload.iter().rev()));

        drop(client);
        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn counts_concurrent_sessions() {
        const N: usize = 8;

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = start(&upstream, settings()).await;

        let mut clients = Vec::new();
        let mut servers = Vec::new();
        for _ in 0..N {
            clients.push(TcpStream::connect(running.listen).await.unwrap());
            servers.push(upstream.accept().await.unwrap().0);
        }

        wait_until(|| running.app.stats().active_sessions == N as u64).await;
        assert_eq!(running.app.stats().total_sessions, N as u64);
        assert_eq!(running.app.stats().active_pipes, 2 * N as u64);

        drop(clients);
        wait_until(|| running.app.stats().active_sessions == 0).await;

        let stats = running.app.stats();
        assert_eq!(stats.total_sessions, N as u64);
        assert_eq!(stats.active_pipes, 0);

        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_session_is_torn_down() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = Settings {
            read_timeout: Duration::from_millis(200),
            ..settings()
        };
        let running = start(&upstream, settings).await;

        let mut client = TcpStream::connect(running.listen).await.unwrap();
        let (_server, _) = upstream.accept().await.unwrap();
        wait_until(|| running.app.stats().active_sessions == 1).await;

        // the client sees the forwarder close its side
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("session was not reaped")
            .unwrap_or(0);
        assert_eq!(n, 0);

        wait_until(|| running.app.stats().active_sessions == 0).await;
        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drains_in_flight_sessions_on_shutdown() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = start(&upstream, settings()).await;

        let mut client = TcpStream::connect(running.listen).await.unwrap();
        let (mut server, _) = upstream.accept().await.unwrap();
        wait_until(|| running.app.stats().active_sessions == 1).await;

        running.cancel.cancel();
        wait_until(|| running.app.stats().open_listeners == 0).await;

        // no new connections once the listener is closed
        assert!(TcpStream::connect(running.listen).await.is_err());

        // the accepted session keeps working
        client.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        server.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        sleep(Duration::from_millis(50)).await;
        assert!(!running.handle.is_finished());

        drop(client);
        drop(server);

        let r = timeout(Duration::from_secs(5), running.handle)
            .await
            .expect("run did not return after drain");
        r.unwrap().unwrap();
        assert_eq!(running.app.stats().active_sessions, 0);
    }

    #[tokio::test]
    async fn failed_dial_only_ends_that_session() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = upstream.local_addr().unwrap().port();
        drop(upstream);

        let source = free_port().await;
        let app = Arc::new(App::new(single(source, dest), settings()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let app = Arc::clone(&app);
            let cancel = cancel.clone();
            async move { app.run(cancel).await }
        });
        wait_until(|| app.stats().open_listeners == 1).await;

        for _ in 0..3 {
            let mut client = TcpStream::connect(("127.0.0.1", source)).await.unwrap();
            let mut buf = [0u8; 1];
            let n = timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }

        wait_until(|| app.stats().active_sessions == 0).await;
        assert_eq!(app.stats().total_sessions, 3);
        assert_eq!(app.stats().open_listeners, 1);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let app = App::new(single(taken_port, 9), settings());
        let cancel = CancellationToken::new();

        let err = timeout(Duration::from_secs(5), app.run(cancel.clone()))
            .await
            .expect("run should fail promptly")
            .unwrap_err();

        assert!(format!("{err:#}").contains("failed to bind listener"));
        assert!(!cancel.is_cancelled());
        assert_eq!(app.stats().open_listeners, 0);
    }

    #[tokio::test]
    async fn bind_failure_stops_sibling_listeners() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        if taken_port == u16::MAX {
            return;
        }

        // the port right above may or may not be free, either way run must fail
        let ports: PortRange = format!(
            "{}-{}:{}-{}",
            taken_port,
            taken_port + 1,
            1000,
            1001
        )
        .parse()
        .unwrap();

        let app = App::new(ports, settings());
        let r = timeout(Duration::from_secs(5), app.run(CancellationToken::new()))
            .await
            .expect("run should stop every listener");

        assert!(r.is_err());
        assert_eq!(app.stats().open_listeners, 0);
    }

    #[test]
    fn endpoint_formats_ipv6_hosts() {
        assert_eq!(Endpoint::new("10.0.0.1", 80).to_string(), "10.0.0.1:80");
        assert_eq!(Endpoint::new("::1", 80).to_string(), "[::1]:80");
        assert_eq!(Endpoint::new("example.com", 443).to_string(), "example.com:443");
        assert_eq!(Endpoint::new("", 8080).to_string(), "*:8080");
    }

    #[test]
    fn default_settings_listen_everywhere() {
        assert_eq!(Settings::default().listen_host, "");
    }

    #[tokio::test]
    async fn reporter_failure_does_not_escape() {
        join_reporter(tokio::spawn(async { panic!("reporter died") })).await;

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        join_reporter(aborted).await;
    }
}
