//! WebSocket server implementation
//!
//! Accepts client connections on a single endpoint path, adapts each socket to a
//! relay connection and drives the relay's lifecycle callbacks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use super::WsConnection;
use crate::config::{normalize_path, DEFAULT_PATH};
use crate::relay::{BroadcastRelay, Connection};

/// How long shutdown waits for open connections to finish their close handshake
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that end a single client connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Handshake rejected with HTTP {0}")]
    Rejected(StatusCode),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

impl ConnectionError {
    /// Client mistakes that are not worth an error-level log
    pub fn is_routine(&self) -> bool {
        matches!(self, ConnectionError::Rejected(_))
    }
}

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Endpoint path clients must request
    pub path: String,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            path: DEFAULT_PATH.to_string(),
        }
    }

    /// Set the endpoint path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = normalize_path(path);
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket front end for the broadcast relay
pub struct WebSocketServer {
    config: ServerConfig,
    relay: Arc<BroadcastRelay>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, relay: Arc<BroadcastRelay>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            relay,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket relay listening on ws://{}{}", addr, self.config.path);

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// On shutdown the server stops accepting, asks every client to close and waits
    /// briefly for their connections to wind down.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let relay = Arc::clone(&self.relay);
                            let path = self.config.path.clone();

                            connections.spawn(async move {
                                match handle_connection(stream, peer_addr, relay, path).await {
                                    Ok(()) => {}
                                    Err(e) if e.is_routine() => {
                                        warn!("Connection from {} refused: {}", peer_addr, e);
                                    }
                                    Err(e) => {
                                        error!("Connection error from {}: {}", peer_addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let active = self.relay.connection_count();
        if active > 0 {
            info!("Closing {} active clients", active);
        }
        self.relay.close_all();

        if !connections.is_empty() {
            info!("Waiting for {} connections to close...", connections.len());
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("{} connections did not close in time", connections.len());
                connections.abort_all();
            }
        }

        Ok(())
    }
}

/// Reject handshakes for any path other than the relay endpoint
fn check_path(req: &Request, resp: Response, path: &str) -> Result<Response, ErrorResponse> {
    if req.uri().path() == path {
        return Ok(resp);
    }

    let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    relay: Arc<BroadcastRelay>,
    path: String,
) -> Result<(), ConnectionError> {
    debug!("New TCP connection from {}", peer_addr);

    // Upgrade to WebSocket
    let handshake = accept_hdr_async(stream, |req: &Request, resp: Response| {
        check_path(req, resp, &path)
    })
    .await;
    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(WsError::Http(resp)) => return Err(ConnectionError::Rejected(resp.status())),
        Err(e) => return Err(e.into()),
    };
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    let (conn, writer) = WsConnection::spawn(peer_addr, ws_sender);
    let conn = Arc::new(conn);
    let id = conn.id();
    info!("Client {} connected as {}", conn.peer_addr(), id);

    relay.on_open(conn.clone());

    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("Received message from {}: {}", id, text);
                relay.on_message(id, &text);
            }
            Some(Ok(Message::Binary(data))) => {
                warn!("Received binary message from {} ({} bytes), ignoring", id, data.len());
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                // Control frames are answered by tungstenite
            }
            Some(Ok(Message::Close(_))) => {
                info!("Client {} requested close", id);
                relay.on_close(id);
                break;
            }
            Some(Err(e)) => {
                relay.on_error(id, &e);
                break;
            }
            None => {
                relay.on_close(id);
                break;
            }
        }
    }

    // Dropping the last handle closes the outbound queue and lets the writer finish
    drop(conn);
    if let Err(e) = writer.await {
        warn!("Writer task for {} failed: {}", id, e);
    }

    info!("Connection from {} closed", peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::WELCOME_MESSAGE;
    use futures_util::SinkExt;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server() -> (SocketAddr, Arc<BroadcastRelay>, Arc<WebSocketServer>) {
        let relay = Arc::new(BroadcastRelay::new());
        let config = ServerConfig::new("127.0.0.1".to_string(), 0);
        let server = Arc::new(WebSocketServer::new(config, Arc::clone(&relay)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        (addr, relay, server)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (mut client, _) = connect_async(format!("ws://{}/bbService", addr))
            .await
            .unwrap();
        // Once welcomed the client is registered
        assert_eq!(next_text(&mut client).await, WELCOME_MESSAGE);
        client
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let msg = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for message")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return text;
            }
        }
    }

    async fn assert_silent(client: &mut Client) {
        let result = timeout(Duration::from_millis(200), client.next()).await;
        assert!(result.is_err(), "unexpected message: {:?}", result);
    }

    async fn wait_for_count(relay: &BroadcastRelay, expected: usize) {
        for _ in 0..100 {
            if relay.connection_count() == expected {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {} connections, found {}",
            expected,
            relay.connection_count()
        );
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.path, "/bbService");
    }

    #[test]
    fn test_server_config_with_path() {
        let config = ServerConfig::new("0.0.0.0".to_string(), 8080).with_path("relay");
        assert_eq!(config.path, "/relay");
    }

    #[tokio::test]
    async fn test_relay_between_clients() {
        let (addr, relay, _server) = start_server().await;
        let mut c1 = connect(addr).await;
        let mut c2 = connect(addr).await;
        let mut c3 = connect(addr).await;
        assert_eq!(relay.connection_count(), 3);

        c1.send(Message::Text("hello".to_string())).await.unwrap();
        assert_eq!(next_text(&mut c2).await, "hello");
        assert_eq!(next_text(&mut c3).await, "hello");
        assert_silent(&mut c1).await;

        c2.close(None).await.unwrap();
        wait_for_count(&relay, 2).await;

        c1.send(Message::Text("world".to_string())).await.unwrap();
        assert_eq!(next_text(&mut c3).await, "world");
        assert_silent(&mut c1).await;
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_deregisters() {
        let (addr, relay, _server) = start_server().await;
        let c1 = connect(addr).await;
        let _c2 = connect(addr).await;
        assert_eq!(relay.connection_count(), 2);

        drop(c1);
        wait_for_count(&relay, 1).await;
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let (addr, relay, _server) = start_server().await;

        let result = connect_async(format!("ws://{}/elsewhere", addr)).await;
        match result {
            Err(WsError::Http(resp)) => assert_eq!(resp.status(), StatusCode::NOT_FOUND),
            other => panic!("expected 404 rejection, got {:?}", other.map(|(_, r)| r)),
        }
        assert_eq!(relay.connection_count(), 0);

        // A refused handshake leaves the server serving
        let _client = connect(addr).await;
        assert_eq!(relay.connection_count(), 1);
    }

    #[test]
    fn test_rejected_handshake_is_routine() {
        assert!(ConnectionError::Rejected(StatusCode::NOT_FOUND).is_routine());
        assert!(!ConnectionError::WebSocket(WsError::ConnectionClosed).is_routine());
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (addr, relay, server) = start_server().await;
        let mut c1 = connect(addr).await;

        server.shutdown();

        let msg = timeout(Duration::from_secs(5), c1.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("websocket error");
        assert!(matches!(msg, Message::Close(_)));

        drop(c1);
        wait_for_count(&relay, 0).await;
    }
}
