use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use bytes::Bytes;

use crate::broker::Router;
use crate::connection::{Connection, ConnectionHandler, ConnectionRegistry};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::TransportError;

/// Transport handle of a WebSocket client: the queue drained by its writer task.
///
/// The connection owns the only copy. Dropping it on `close` ends the writer and fires
/// the signal returned by [`WsPeer::new`], which stops the client's read loop.
#[derive(Debug)]
pub struct WsPeer {
    outbound: mpsc::UnboundedSender<WsMessage>,
    _closed: oneshot::Sender<()>,
}

impl WsPeer {
    pub fn new(outbound: mpsc::UnboundedSender<WsMessage>) -> (Self, oneshot::Receiver<()>) {
        let (closed, on_close) = oneshot::channel();
        let peer = Self {
            outbound,
            _closed: closed,
        };
        (peer, on_close)
    }

    pub fn send(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(msg)?;
        self.outbound
            .send(WsMessage::text(text))
            .map_err(|_| TransportError::PeerGone)
    }
}

/// Hooks wiring WebSocket clients into the broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsHandler;

impl ConnectionHandler<WsPeer> for WsHandler {
    fn on_accept(&self, conn: &Arc<Connection<WsPeer>>) {
        info!(key = %conn.key(), "client connected");
    }

    fn write(
        &self,
        _conn: &Connection<WsPeer>,
        peer: &WsPeer,
        topic: &[u8],
        payload: &Bytes,
    ) -> Result<(), TransportError> {
        peer.send(&ServerMessage::Message {
            topic: String::from_utf8_lossy(topic).into_owned(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    fn on_close(&self, conn: &Connection<WsPeer>, reason: Option<&TransportError>) {
        match reason {
            Some(err) => warn!(key = %conn.key(), error = %err, "client closed with error"),
            None => info!(key = %conn.key(), "client disconnected"),
        }
    }
}

/// Accept WebSocket clients on `listener` until accepting fails.
pub async fn start_websocket_server(
    listener: TcpListener,
    router: Arc<Router<WsPeer>>,
    registry: ConnectionRegistry<WsPeer>,
    max_connections: usize,
) -> std::io::Result<()> {
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    let slots = Arc::new(Semaphore::new(max_connections));

    loop {
        let (stream, remote) = listener.accept().await?;
        // The slot is taken before the handshake so pending handshakes count too.
        let Ok(slot) = slots.clone().try_acquire_owned() else {
            warn!(%remote, limit = max_connections, "refusing client, connection limit reached");
            continue;
        };

        let router = router.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_client(stream, router, registry, slot).await {
                debug!(%remote, error = %err, "WebSocket handshake error");
            }
        });
    }
}

async fn serve_client(
    stream: TcpStream,
    router: Arc<Router<WsPeer>>,
    registry: ConnectionRegistry<WsPeer>,
    _slot: OwnedSemaphorePermit,
) -> Result<(), tungstenite::Error> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let (peer, mut closed) = WsPeer::new(tx);
    let conn = registry.admit(peer);

    // broker → client
    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = ws_sender.send(msg).await {
                writer_conn.close(Some(TransportError::Write(err.to_string())));
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut reason = None;
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut closed => break,
            frame = ws_receiver.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                reason = Some(TransportError::Read(err.to_string()));
                break;
            }
            None => break,
        };
        if frame.is_close() {
            break;
        }
        if !frame.is_text() {
            continue;
        }
        let Ok(text) = frame.to_text() else {
            continue;
        };

        let reply = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => dispatch(&router, &conn, msg).await,
            Err(err) => {
                warn!(key = %conn.key(), error = %err, "invalid client message");
                Some(ServerMessage::Error {
                    message: format!("invalid message: {err}"),
                })
            }
        };
        if let Some(reply) = reply {
            match conn.with_transport(|peer| peer.send(&reply)) {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    reason = Some(err);
                    break;
                }
                None => break,
            }
        }
    }

    conn.close(reason);
    let _ = writer.await;
    Ok(())
}

/// Hand one client request to the router. Returns the reply to send, if any.
async fn dispatch(
    router: &Router<WsPeer>,
    conn: &Arc<Connection<WsPeer>>,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    let result = match msg {
        ClientMessage::Subscribe { topic } => router.subscribe(topic.into_bytes(), conn).await,
        ClientMessage::Unsubscribe { topic } => router.unsubscribe(topic.as_bytes(), conn).await,
        ClientMessage::Publish { topic, payload } => {
            router
                .publish(topic.as_bytes(), conn, payload.into_bytes())
                .await
        }
        ClientMessage::Ping => return Some(ServerMessage::Pong),
    };

    match result {
        Ok(()) => None,
        Err(err) => {
            warn!(key = %conn.key(), error = %err, label = err.as_label(), "request refused");
            Some(ServerMessage::Error {
                message: err.to_string(),
            })
        }
    }
}
