//! XMPP client-to-server stream layer.
//!
//! Accepts TCP connections, runs the opening stream negotiation on each one and hands
//! negotiated `Client`s (stream descriptor plus stanza queues) to the application.
//! Failed negotiations are answered with a `<stream:error/>` and closed here.

mod client;
mod error;
mod id;
mod negotiate;
mod stanza;
mod token;

pub use client::{
    Client, ClientSummary, InboundEnd, OutboundEnd, INBOUND_QUEUE_CAPACITY,
    OUTBOUND_QUEUE_CAPACITY,
};
pub use error::{NegotiationError, StreamError, StreamErrorCondition, TokenError};
pub use id::{IdGenerator, ID_BYTES};
pub use negotiate::{check_version, negotiate, negotiate_with_timeout, Stream, Version};
pub use stanza::Stanza;
pub use token::{
    Attribute, EndElement, ProcInst, QName, StartElement, Token, TokenDecoder, TokenKind,
};

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use negotiate::{CLIENT_NS, STREAMS_NS};

/// Conventional XMPP client-to-server port.
pub const DEFAULT_C2S_PORT: u16 = 5222;

/// How long a new connection may take to send its stream header.
///
/// A peer that has not completed the opening negotiation by then is sent a
/// `connection-timeout` stream error and disconnected, so stalled sockets cannot hold
/// connection slots indefinitely.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of negotiated clients that may wait for the application to pick them up.
const PENDING_CLIENTS_CAPACITY: usize = 16;

/// Monotonic connection id for correlating logs across tasks.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Listener configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Address to accept client connections on.
    pub listen_addr: SocketAddr,
    /// Domain this server answers for; used as `from` in our stream header.
    pub domain: String,
    pub negotiation_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_C2S_PORT)),
            domain: "localhost".to_string(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

/// RAII guard that decrements the connection counter when dropped.
/// Ensures cleanup even if the connection handler panics or returns early.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug!(active = prev - 1, "Connection handler finished");
    }
}

/// Accept loop for client connections.
///
/// Each accepted connection is negotiated independently; successful negotiations are
/// delivered through the receiver returned by `start`.
pub struct XmppServer {
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Connections currently being negotiated (for diagnostics/logging)
    active_negotiations: Arc<AtomicUsize>,
}

impl XmppServer {
    /// Bind the listener and start accepting connections.
    pub async fn start(
        config: ServerConfig,
        ids: IdGenerator,
    ) -> Result<(Self, mpsc::Receiver<Client>), String> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", config.listen_addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to get local address: {}", e))?;

        info!(addr = %local_addr, domain = %config.domain, "XMPP server listening");

        let (shutdown_tx, _) = broadcast::channel(1);
        let (clients_tx, clients_rx) = mpsc::channel(PENDING_CLIENTS_CAPACITY);
        let active_negotiations = Arc::new(AtomicUsize::new(0));

        let config = Arc::new(config);
        let shutdown_for_task = shutdown_tx.clone();
        let active_for_task = active_negotiations.clone();

        let task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_for_task.subscribe();

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                warn!(error = %e, "Accept failed");
                                continue;
                            }
                        };
                        let config = config.clone();
                        let ids = ids.clone();
                        let clients = clients_tx.clone();
                        let shutdown = shutdown_for_task.subscribe();
                        let counter = active_for_task.clone();

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, &config, &ids, clients, shutdown, counter).await {
                                info!(addr = %addr, error = %e, "Connection rejected");
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutting down");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                local_addr,
                task: Some(task),
                shutdown_tx,
                active_negotiations,
            },
            clients_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections still in the opening negotiation.
    pub fn active_negotiations(&self) -> usize {
        self.active_negotiations.load(Ordering::SeqCst)
    }

    /// Subscribe to the server's shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop accepting connections and abort pending negotiations.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Accept loop task join error");
            }
        }
    }
}

/// Negotiate a single connection and hand it over as a `Client`.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: &ServerConfig,
    ids: &IdGenerator,
    clients: mpsc::Sender<Client>,
    mut shutdown: broadcast::Receiver<()>,
    active_negotiations: Arc<AtomicUsize>,
) -> Result<(), String> {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    info!(conn_id, addr = %addr, "Handling connection");

    let guard = ConnectionGuard::new(active_negotiations);

    let (read, mut write) = stream.into_split();
    let mut decoder = TokenDecoder::new(BufReader::new(read));

    let negotiated = tokio::select! {
        result = negotiate_with_timeout(&mut decoder, ids, config.negotiation_timeout) => result,
        _ = shutdown.recv() => {
            let err = StreamError::new(StreamErrorCondition::SystemShutdown, "");
            let _ = reject(&mut write, &config.domain, &err).await;
            return Err("Server shut down during negotiation".to_string());
        }
    };
    // Counts negotiations only, not clients waiting to be picked up
    drop(guard);

    let client_stream = match negotiated {
        Ok(s) => s,
        Err(e) => {
            if let Some(stream_err) = e.stream_error() {
                reject(&mut write, &config.domain, stream_err).await?;
            }
            return Err(format!(
                "Negotiation failed after {}ms: {}",
                started.elapsed().as_millis(),
                e
            ));
        }
    };

    info!(
        conn_id,
        from = %client_stream.from,
        to = %client_stream.to,
        id = %client_stream.id,
        negotiate_ms = started.elapsed().as_millis() as u64,
        "Got stream"
    );

    write
        .write_all(client_stream.response_header(&config.domain).as_bytes())
        .await
        .map_err(|e| format!("Failed to send stream header: {}", e))?;
    write
        .flush()
        .await
        .map_err(|e| format!("Failed to flush stream header: {}", e))?;

    let client = Client::spawn(client_stream, decoder, write);
    if let Err(mpsc::error::SendError(client)) = clients.send(client).await {
        warn!(conn_id, "No consumer for negotiated clients, closing");
        client.close().await;
    }
    Ok(())
}

/// Report a stream error to the peer and end the stream.
///
/// RFC 6120 §4.9.1.1: the error must come inside a stream, so our own stream header is
/// sent first.
async fn reject<W>(writer: &mut W, domain: &str, err: &StreamError) -> Result<(), String>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let response = format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' from='{}' version='1.0'>{}</stream:stream>",
        CLIENT_NS,
        STREAMS_NS,
        quick_xml::escape::escape(domain),
        err.to_xml()
    );
    writer
        .write_all(response.as_bytes())
        .await
        .map_err(|e| format!("Failed to send stream error: {}", e))?;
    writer
        .shutdown()
        .await
        .map_err(|e| format!("Failed to close connection: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn start_test_server(timeout: Duration) -> (XmppServer, mpsc::Receiver<Client>) {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            domain: "example.com".to_string(),
            negotiation_timeout: timeout,
        };
        XmppServer::start(config, IdGenerator::start())
            .await
            .expect("server should start")
    }

    async fn read_until_closed(socket: &mut TcpStream) -> String {
        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(2), socket.read_to_string(&mut out))
            .await
            .expect("server should close the connection")
            .expect("read should succeed");
        out
    }

    // --- ConnectionGuard tests ---

    #[test]
    fn test_connection_guard_counts_up_and_down() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard1 = ConnectionGuard::new(counter.clone());
        let guard2 = ConnectionGuard::new(counter.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(guard1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(guard2);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr.port(), 5222);
        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
    }

    // --- end-to-end tests ---

    #[tokio::test]
    async fn test_negotiated_client_is_handed_over() {
        let (mut server, mut clients) = start_test_server(Duration::from_secs(5)).await;
        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

        socket
            .write_all(b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' from='juliet@example.com' version='1.0'>")
            .await
            .unwrap();

        let mut client = tokio::time::timeout(Duration::from_secs(2), clients.recv())
            .await
            .expect("client should be handed over")
            .expect("channel open");
        assert_eq!(client.stream().from, "juliet@example.com");

        socket.write_all(b"<presence/>").await.unwrap();
        assert_eq!(client.recv().await.unwrap().name(), "presence");

        client
            .send(Stanza::parse("<message><body>hi</body></message>").await.unwrap())
            .await
            .unwrap();
        let summary = client.close().await;
        assert_eq!(summary.outbound, OutboundEnd::Drained);

        let received = read_until_closed(&mut socket).await;
        assert!(received.starts_with("<?xml version='1.0'?><stream:stream "));
        assert!(received.contains("from='example.com'"));
        assert!(received.contains("to='juliet@example.com'"));
        assert!(received.contains("<message><body>hi</body></message>"));
        assert!(received.ends_with("</stream:stream>"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bad_version_is_reported_to_peer() {
        let (mut server, _clients) = start_test_server(Duration::from_secs(5)).await;
        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

        socket
            .write_all(b"<?xml version='1.0'?><stream:stream xmlns:stream='http://etherx.jabber.org/streams' version='2.0'>")
            .await
            .unwrap();

        let received = read_until_closed(&mut socket).await;
        assert!(received.contains("<stream:error><unsupported-version xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
        assert!(received.contains(">2.0</text>"));
        assert!(received.ends_with("</stream:stream>"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_pending_handover_is_not_an_active_negotiation() {
        let (mut server, _clients) = start_test_server(Duration::from_secs(5)).await;

        // One more than the handover queue holds, so the last handler waits on the send
        let mut sockets = Vec::new();
        for _ in 0..PENDING_CLIENTS_CAPACITY + 1 {
            let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
            socket
                .write_all(b"<?xml version='1.0'?><stream:stream xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>")
                .await
                .unwrap();
            sockets.push(socket);
        }

        // Our header is written before the handover, so every handler is past negotiation
        for socket in &mut sockets {
            let mut header = Vec::new();
            let mut buf = [0u8; 256];
            while !header.ends_with(b"version='1.0'>") {
                let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
                    .await
                    .expect("server should answer")
                    .unwrap();
                assert_ne!(n, 0, "connection closed before the stream header");
                header.extend_from_slice(&buf[..n]);
            }
        }

        for _ in 0..200 {
            if server.active_negotiations() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.active_negotiations(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_silent_peer_gets_connection_timeout() {
        let (mut server, _clients) = start_test_server(Duration::from_millis(100)).await;
        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

        let received = read_until_closed(&mut socket).await;
        assert!(received.contains("<connection-timeout "));

        // The handler's guard is released right after the connection is closed
        for _ in 0..50 {
            if server.active_negotiations() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.active_negotiations(), 0);

        server.stop().await;
    }
}
