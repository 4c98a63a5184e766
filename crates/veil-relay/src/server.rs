//! WebSocket transport: one task per socket, multiplexing client frames
//! with events queued for it by other connections.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use veil_proto::codec::encode;
use veil_proto::{ErrorCode, ServerEvent};
use veil_store::{ConnectionId, EventSink};

use crate::auth::Authenticator;
use crate::connection::Connection;
use crate::relay::Relay;

/// Per-connection outbound queue depth. A client that falls this far
/// behind stops receiving live traffic; messages for it are buffered and
/// flushed again as the writer drains the queue.
pub const OUTBOUND_QUEUE: usize = 256;

/// `EventSink` backed by the connection task's queue.
pub struct ChannelSink {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                id: ConnectionId::new(),
                tx,
            }),
            rx,
        )
    }
}

impl EventSink for ChannelSink {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, event: ServerEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

pub struct RelayServer {
    relay: Arc<Relay>,
    auth: Arc<dyn Authenticator>,
    max_frame_bytes: usize,
}

impl RelayServer {
    pub fn new(relay: Arc<Relay>, auth: Arc<dyn Authenticator>, max_frame_bytes: usize) -> Self {
        Self {
            relay,
            auth,
            max_frame_bytes,
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "relay listening");
        Ok(listener)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_socket(stream, peer).await {
                    warn!(peer = %peer, error = %e, "connection error");
                }
            });
        }
    }

    async fn handle_socket(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_frame_bytes);
        ws_config.max_frame_size = Some(self.max_frame_bytes);
        let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
        let (mut write, mut read) = ws_stream.split();

        let (sink, mut rx) = ChannelSink::new(OUTBOUND_QUEUE);
        let conn_id = sink.connection_id();
        debug!(peer = %peer, connection = %conn_id, "websocket open");
        let mut connection = Connection::new(sink, self.relay.clone(), self.auth.clone());

        let result: Result<()> = async {
            loop {
                let msg = tokio::select! {
                    incoming = read.next() => match incoming {
                        Some(msg) => msg?,
                        None => break,
                    },
                    Some(event) = rx.recv() => {
                        write.send(Message::Text(encode(&event)?)).await?;
                        connection.flush_backlog();
                        continue;
                    }
                };

                match msg {
                    Message::Text(text) => {
                        for reply in connection.handle_frame(&text).await {
                            write.send(Message::Text(encode(&reply)?)).await?;
                        }
                    }
                    Message::Binary(_) => {
                        let reply = ServerEvent::error(ErrorCode::InvalidPayload, "binary frames are not accepted");
                        write.send(Message::Text(encode(&reply)?)).await?;
                    }
                    Message::Ping(data) => write.send(Message::Pong(data)).await?,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Ok(())
        }
        .await;

        connection.close();
        debug!(peer = %peer, connection = %conn_id, "websocket closed");
        result
    }
}
