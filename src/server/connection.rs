//! WebSocket-backed connection handle
//!
//! Each accepted socket gets a bounded outbound queue drained by its own writer
//! task. Sending only enqueues, so a slow client never holds up anyone else; once its
//! queue is full further messages to it are dropped.

use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::relay::{Connection, ConnectionId, SendError};

/// Messages buffered per client before sends start failing
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Handle to one client's outbound queue
pub struct WsConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    tx: mpsc::Sender<Message>,
}

impl WsConnection {
    /// Create a handle and spawn the writer task that owns the socket sink
    pub fn spawn(peer_addr: SocketAddr, sink: WsSink) -> (Self, JoinHandle<()>) {
        let (conn, rx) = Self::with_queue(peer_addr, OUTBOUND_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_loop(conn.id, sink, rx));

        (conn, writer)
    }

    /// Create a handle over a fresh queue, returning the receiving end
    fn with_queue(peer_addr: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Self {
            id: ConnectionId::new(),
            peer_addr,
            tx,
        };
        (conn, rx)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, text: &str) -> Result<(), SendError> {
        self.tx
            .try_send(Message::Text(text.to_string()))
            .map_err(|e| match e {
                TrySendError::Full(_) => SendError::Full(self.id),
                TrySendError::Closed(_) => SendError::Closed(self.id),
            })
    }

    fn close(&self) {
        // Writer already gone means the socket is closing anyway
        if let Err(TrySendError::Full(_)) = self.tx.try_send(Message::Close(None)) {
            debug!("Queue for {} full, close frame dropped", self.id);
        }
    }
}

/// Forward queued messages to the socket until the queue closes or a write fails
async fn write_loop(id: ConnectionId, mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));

        if let Err(e) = sink.send(msg).await {
            warn!("Write to {} failed: {}", id, e);
            break;
        }
        if closing {
            debug!("Sent close frame to {}", id);
            break;
        }
    }
}
