//! TCP server for the notification protocol.
//!
//! Accepts incoming connections and hands each one to its own handler task.
//! Handlers share nothing but the shutdown signal.

use crate::config::Config;
use crate::notify::{handle_connection, Settings};
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Source of incoming connections.
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Stops a running [`Server`] and every handler it spawned.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // The server holds a receiver from construction on, so this only
        // fails once it is gone.
        let _ = self.tx.send(());
    }
}

/// Server instance
pub struct Server<L = TcpListener> {
    listener: L,
    settings: Settings,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Server {
    /// Bind the configured listen address.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen.clone(),
                source,
            })?;

        Ok(Server::new(listener, Settings::from(config)))
    }
}

impl<L: Listener> Server<L> {
    pub fn new(listener: L, settings: Settings) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Server {
            listener,
            settings,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept connections until shutdown is triggered or accept fails.
    ///
    /// An accept failure is returned as-is; the service does not try to
    /// recover from it. Either way every handler is signalled and awaited
    /// before this returns.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            mut listener,
            settings,
            shutdown_tx,
            mut shutdown_rx,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Server listening");
        }

        let mut handlers = JoinSet::new();

        let result = loop {
            tokio::select! {
                accepted = poll_fn(|cx| listener.poll_accept(cx)) => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            break Err(ServerError::Accept(e));
                        }
                    };
                    debug!(peer = %peer, "New connection");

                    let shutdown = shutdown_tx.subscribe();
                    handlers.spawn(
                        async move {
                            let outcome = handle_connection(stream, settings, shutdown).await;
                            debug!(?outcome, "Connection closed");
                            outcome
                        }
                        .instrument(info_span!("connection", peer = %peer)),
                    );
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(active = handlers.len(), "Server shutting down");
                    break Ok(());
                }
            }
        };

        // Reaches handlers still streaming when accept failed; harmless after a trigger.
        drop(shutdown_rx);
        let _ = shutdown_tx.send(());
        while handlers.join_next().await.is_some() {}

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::time::Duration;
    use std::collections::VecDeque;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);

    async fn start(interval: Duration) -> (SocketAddr, ShutdownHandle, JoinHandle<Result<(), ServerError>>) {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            interval,
            ..Config::default()
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        (addr, shutdown, task)
    }

    async fn request(addr: SocketAddr, line: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(line).await.unwrap();
        let mut received = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut received)).await.unwrap().unwrap();
        received
    }

    async fn start_stream(addr: SocketAddr) -> BufReader<TcpStream> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"START\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        timeout(WAIT, reader.read_line(&mut line)).await.unwrap().unwrap();
        assert_eq!(line, "Starting notification service...\n");
        reader
    }

    async fn next_stamp(reader: &mut BufReader<TcpStream>) -> i64 {
        let mut line = String::new();
        timeout(WAIT, reader.read_line(&mut line)).await.unwrap().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "push");
        assert_eq!(value["title"], "Current time");
        DateTime::parse_from_rfc3339(value["data"].as_str().unwrap())
            .unwrap()
            .timestamp()
    }

    /// Hands out queued accept results, then waits forever.
    struct ScriptedListener {
        queue: VecDeque<io::Result<DuplexStream>>,
    }

    impl Listener for ScriptedListener {
        type Io = DuplexStream;

        fn poll_accept(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<io::Result<(DuplexStream, SocketAddr)>> {
            match self.queue.pop_front() {
                Some(result) => Poll::Ready(result.map(|io| (io, "127.0.0.1:1".parse().unwrap()))),
                None => Poll::Pending,
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let config = Config {
            listen: "not an address".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            Server::bind(&config).await,
            Err(ServerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejection_is_repeatable() {
        let (addr, shutdown, task) = start(Duration::from_millis(50)).await;

        assert_eq!(request(addr, b"hello\n").await, b"Goodbye, client!\n");
        assert_eq!(request(addr, b"hello\n").await, b"Goodbye, client!\n");
        assert_eq!(request(addr, b"START now\n").await, b"Goodbye, client!\n");

        shutdown.trigger();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_streams_one_second_apart() {
        let (addr, shutdown, task) = start(Duration::from_secs(1)).await;

        let mut reader = start_stream(addr).await;
        let first = next_stamp(&mut reader).await;
        let second = next_stamp(&mut reader).await;
        assert!((1..=2).contains(&(second - first)), "{first} -> {second}");

        shutdown.trigger();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_does_not_affect_others() {
        let (addr, shutdown, task) = start(Duration::from_millis(50)).await;

        drop(TcpStream::connect(addr).await.unwrap());

        let mut reader = start_stream(addr).await;
        next_stamp(&mut reader).await;

        shutdown.trigger();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_departed_client_leaves_service_running() {
        let (addr, shutdown, task) = start(Duration::from_millis(20)).await;

        let mut reader = start_stream(addr).await;
        next_stamp(&mut reader).await;
        drop(reader);

        // Give the abandoned handler a few ticks to hit its write failure.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(request(addr, b"hello\n").await, b"Goodbye, client!\n");
        let mut reader = start_stream(addr).await;
        next_stamp(&mut reader).await;

        shutdown.trigger();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_streams() {
        let (addr, shutdown, task) = start(Duration::from_millis(20)).await;

        let mut reader = start_stream(addr).await;
        next_stamp(&mut reader).await;

        shutdown.trigger();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();

        // Whatever was in flight drains, then the server side is closed.
        let mut rest = Vec::new();
        timeout(WAIT, reader.read_to_end(&mut rest)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_trigger_before_run_is_honoured() {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        };
        let server = Server::bind(&config).await.unwrap();
        server.shutdown_handle().trigger();

        timeout(WAIT, server.run()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accept_error_is_fatal() {
        let (mut client, server_side) = duplex(4096);
        client.write_all(b"START\n").await.unwrap();

        let listener = ScriptedListener {
            queue: VecDeque::from([
                Ok(server_side),
                Err(io::Error::new(io::ErrorKind::Other, "too many open files")),
            ]),
        };
        let settings = Settings {
            interval: Duration::from_secs(60),
            ..Settings::default()
        };
        let server = Server::new(listener, settings);

        let result = timeout(WAIT, server.run()).await.unwrap();
        assert!(matches!(result, Err(ServerError::Accept(_))));

        // The connection accepted before the failure was stopped and closed,
        // possibly before it got as far as acknowledging.
        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received)).await.unwrap().unwrap();
        assert!(
            received.is_empty() || received.starts_with(b"Starting notification service...\n"),
            "{:?}",
            String::from_utf8_lossy(&received)
        );
    }
}
