//! WebSocket transport served by axum.
//!
//! One task per client multiplexes two directions:
//! - outbound: a bounded queue fed by `broadcast`
//! - inbound: frames from the socket, decoded into protocol messages
//!
//! A slow or dead client only affects its own queue. When that queue is full
//! the client is dropped rather than letting it grow.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use super::{
    BroadcastReport, ClientId, MessageTransport, TransportBinder, TransportConfig, TransportError,
    TransportEvent,
};
use crate::bridge::{ProtocolMessage, RawRecord, codec};
use crate::config::route_path;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds `WsTransport` instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsBinder;

#[async_trait]
impl TransportBinder for WsBinder {
    async fn bind(
        &self,
        config: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn MessageTransport>, TransportError> {
        let transport = WsTransport::bind(config, events).await?;
        Ok(Arc::new(transport) as Arc<dyn MessageTransport>)
    }
}

/// Registry entry for one connected client.
struct Session {
    outbound: mpsc::Sender<Message>,
    /// Cancelled when the client is dropped for lagging.
    evicted: CancellationToken,
}

/// Client registry shared by the server and the per-client tasks.
struct Hub {
    clients: DashMap<ClientId, Session>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
    client_queue: usize,
}

impl Hub {
    async fn emit(&self, event: TransportEvent) {
        // Receiver gone means the bridge is shutting down.
        let _ = self.events.send(event).await;
    }

    async fn receive(&self, client: ClientId, data: &[u8]) {
        let record = RawRecord::new(Bytes::copy_from_slice(data));
        match codec::decode(&record) {
            Ok(message) => self.emit(TransportEvent::Inbound(client, message)).await,
            Err(e) => {
                self.emit(TransportEvent::Error(TransportError::client(
                    client,
                    format!("invalid message: {}", e),
                )))
                .await
            }
        }
    }

    fn evict(&self, client: &ClientId) {
        if let Some((_, session)) = self.clients.remove(client) {
            session.evicted.cancel();
        }
    }
}

pub struct WsTransport {
    hub: Arc<Hub>,
    local_addr: SocketAddr,
    server: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl WsTransport {
    /// Bind the listener and start accepting clients on `config.path`.
    pub async fn bind(
        config: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let path = route_path(&config.path)?;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let hub = Arc::new(Hub {
            clients: DashMap::new(),
            events,
            shutdown: CancellationToken::new(),
            client_queue: config.client_queue.max(1),
        });

        let app = routes(Arc::clone(&hub), &path, config.cors);
        let shutdown = hub.shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        });

        debug!(%local_addr, %path, cors = config.cors, "WebSocket transport listening");

        Ok(Self {
            hub,
            local_addr,
            server: Mutex::new(Some(server)),
        })
    }
}

#[async_trait]
impl MessageTransport for WsTransport {
    fn broadcast(&self, message: &ProtocolMessage) -> BroadcastReport {
        let text = match codec::encode(message).map(|r| String::from_utf8(r.into_bytes().to_vec())) {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(error = %e, "Encoded message is not UTF-8, dropping");
                return BroadcastReport::default();
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode message for broadcast, dropping");
                return BroadcastReport::default();
            }
        };
        let frame = Message::Text(text.into());

        let outcomes: Vec<_> = self
            .hub
            .clients
            .iter()
            .map(|entry| {
                let id = *entry.key();
                let result = match entry.value().outbound.try_send(frame.clone()) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => Err(TransportError::client(
                        id,
                        "outbound queue full, dropping client",
                    )),
                    Err(TrySendError::Closed(_)) => {
                        Err(TransportError::client(id, "session closed"))
                    }
                };
                if let Err(ref e) = result {
                    warn!(client_id = %id, error = %e, "Failed to queue message for client");
                }
                (id, result)
            })
            .collect();

        // Shard locks are released once iteration ends.
        for (id, result) in &outcomes {
            if result.is_err() {
                self.hub.evict(id);
            }
        }

        BroadcastReport { outcomes }
    }

    fn client_count(&self) -> usize {
        self.hub.clients.len()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.hub.shutdown.cancel();
        self.hub.clients.clear();

        let Some(server) = self.server.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, server).await {
            Ok(Ok(Ok(()))) => {
                debug!("WebSocket transport closed");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(TransportError::Close(e.to_string())),
            Ok(Err(e)) => Err(TransportError::Close(format!("server task failed: {}", e))),
            Err(_) => Err(TransportError::Close(
                "timed out waiting for server to stop".to_string(),
            )),
        }
    }
}

fn routes(hub: Arc<Hub>, path: &str, cors: bool) -> Router {
    let router = Router::new().route(path, get(upgrade)).with_state(hub);
    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| serve_client(hub, socket))
}

async fn serve_client(hub: Arc<Hub>, socket: WebSocket) {
    let id = ClientId::new();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::channel::<Message>(hub.client_queue);
    let evicted = CancellationToken::new();

    hub.clients.insert(
        id,
        Session {
            outbound: tx,
            evicted: evicted.clone(),
        },
    );
    hub.emit(TransportEvent::Connected(id)).await;

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                // Sender dropped: transport is closing.
                let Some(msg) = msg else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                // A client that stopped reading can stall the send itself.
                let sent = tokio::select! {
                    result = sink.send(msg) => Some(result),
                    _ = evicted.cancelled() => None,
                };
                match sent {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        hub.emit(TransportEvent::Error(TransportError::client(
                            id,
                            format!("send failed: {}", e),
                        )))
                        .await;
                        break;
                    }
                    None => break,
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => hub.receive(id, text.as_str().as_bytes()).await,
                Some(Ok(Message::Binary(bytes))) => hub.receive(id, &bytes).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    hub.emit(TransportEvent::Error(TransportError::client(
                        id,
                        format!("receive failed: {}", e),
                    )))
                    .await;
                    break;
                }
            },
            _ = evicted.cancelled() => {
                debug!(client_id = %id, "Dropping lagging client");
                break;
            }
            _ = hub.shutdown.cancelled() => {
                // Flush what was queued before the close.
                while let Ok(msg) = outbound.try_recv() {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    hub.clients.remove(&id);
    hub.emit(TransportEvent::Disconnected(id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn local_config() -> TransportConfig {
        TransportConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    async fn connect(transport: &WsTransport, path: &str) -> Client {
        let url = format!("ws://{}{}", transport.local_addr, path);
        let (client, _) = connect_async(url).await.expect("ws connect failed");
        client
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("ws error");
            if let ClientMessage::Text(text) = msg {
                return text.as_str().to_string();
            }
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let (tx, mut events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let mut a = connect(&transport, "/message").await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected(_)));
        let mut b = connect(&transport, "/message").await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected(_)));
        assert_eq!(transport.client_count(), 2);

        let report = transport.broadcast(&ProtocolMessage::new(json!({"id": 1, "result": "pong"})));
        assert_eq!(report.recipients(), 2);
        assert_eq!(report.delivered(), 2);

        assert_eq!(next_text(&mut a).await, r#"{"id":1,"result":"pong"}"#);
        assert_eq!(next_text(&mut b).await, r#"{"id":1,"result":"pong"}"#);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_without_clients_is_empty() {
        let (tx, _events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let report = transport.broadcast(&ProtocolMessage::new(json!({"id": 1})));
        assert_eq!(report.recipients(), 0);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn inbound_text_is_decoded() {
        let (tx, mut events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let mut client = connect(&transport, "/message").await;
        let TransportEvent::Connected(connected) = next_event(&mut events).await else {
            panic!("expected connect event");
        };

        client
            .send(ClientMessage::Text(r#"{"id":2,"method":"ping"}"#.into()))
            .await
            .unwrap();

        match next_event(&mut events).await {
            TransportEvent::Inbound(id, msg) => {
                assert_eq!(id, connected);
                assert_eq!(msg.as_value(), &json!({"id": 2, "method": "ping"}));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_inbound_is_client_error() {
        let (tx, mut events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let mut client = connect(&transport, "/message").await;
        let _ = next_event(&mut events).await;

        client.send(ClientMessage::Text("not json".into())).await.unwrap();
        client.send(ClientMessage::Text(r#"{"id":3}"#.into())).await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Error(TransportError::Client { .. })
        ));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Inbound(..)));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_removes_session() {
        let (tx, mut events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let mut client = connect(&transport, "/message").await;
        let TransportEvent::Connected(id) = next_event(&mut events).await else {
            panic!("expected connect event");
        };

        client.close(None).await.unwrap();

        match next_event(&mut events).await {
            TransportEvent::Disconnected(gone) => assert_eq!(gone, id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(transport.client_count(), 0);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_ends_sessions_and_is_idempotent() {
        let (tx, mut events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let mut client = connect(&transport, "/message").await;
        let _ = next_event(&mut events).await;

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.client_count(), 0);

        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(ClientMessage::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "client was not disconnected");
    }

    #[tokio::test]
    async fn unknown_path_is_rejected() {
        let (tx, _events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let url = format!("ws://{}/elsewhere", transport.local_addr);
        assert!(connect_async(url).await.is_err());

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn path_without_leading_slash_is_normalized() {
        let (tx, mut events) = mpsc::channel(16);
        let config = TransportConfig {
            path: "ws".to_string(),
            ..local_config()
        };
        let transport = WsTransport::bind(&config, tx).await.unwrap();

        let _client = connect(&transport, "/ws").await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected(_)));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn port_in_use_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let (tx, _events) = mpsc::channel(16);
        let config = TransportConfig {
            port,
            ..local_config()
        };
        let err = WsTransport::bind(&config, tx).await.err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    fn stalled_session(
        transport: &WsTransport,
        queue: usize,
    ) -> (ClientId, CancellationToken, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(queue);
        let evicted = CancellationToken::new();
        let id = ClientId::new();
        transport.hub.clients.insert(
            id,
            Session {
                outbound,
                evicted: evicted.clone(),
            },
        );
        (id, evicted, rx)
    }

    #[tokio::test]
    async fn lagging_client_is_dropped_without_blocking_others() {
        let (tx, mut events) = mpsc::channel(16);
        let config = TransportConfig {
            client_queue: 1,
            ..local_config()
        };
        let transport = WsTransport::bind(&config, tx).await.unwrap();

        let mut reader = connect(&transport, "/message").await;
        let _ = next_event(&mut events).await;
        // Never drained.
        let (stuck, evicted, _queue) = stalled_session(&transport, 1);

        let first = transport.broadcast(&ProtocolMessage::new(json!({"id": 1})));
        assert_eq!(first.delivered(), 2);
        assert_eq!(next_text(&mut reader).await, r#"{"id":1}"#);

        let second = transport.broadcast(&ProtocolMessage::new(json!({"id": 2})));
        assert_eq!(second.recipients(), 2);
        assert_eq!(second.delivered(), 1);
        let failed: Vec<_> = second.failed().map(|(id, _)| *id).collect();
        assert_eq!(failed, vec![stuck]);
        assert!(evicted.is_cancelled());
        assert_eq!(transport.client_count(), 1);
        assert_eq!(next_text(&mut reader).await, r#"{"id":2}"#);

        let third = transport.broadcast(&ProtocolMessage::new(json!({"id": 3})));
        assert_eq!(third.recipients(), 1);
        assert_eq!(next_text(&mut reader).await, r#"{"id":3}"#);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_session_does_not_block_others() {
        let (tx, mut events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let mut reader = connect(&transport, "/message").await;
        let _ = next_event(&mut events).await;
        let (gone, _, queue) = stalled_session(&transport, 4);
        drop(queue);

        let report = transport.broadcast(&ProtocolMessage::new(json!({"id": 9})));
        assert_eq!(report.delivered(), 1);
        let failed: Vec<_> = report.failed().map(|(id, _)| *id).collect();
        assert_eq!(failed, vec![gone]);
        assert_eq!(next_text(&mut reader).await, r#"{"id":9}"#);
        assert_eq!(transport.client_count(), 1);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn evicted_real_client_is_disconnected() {
        let (tx, mut events) = mpsc::channel(16);
        let transport = WsTransport::bind(&local_config(), tx).await.unwrap();

        let _client = connect(&transport, "/message").await;
        let TransportEvent::Connected(id) = next_event(&mut events).await else {
            panic!("expected connect event");
        };

        transport.hub.evict(&id);

        match next_event(&mut events).await {
            TransportEvent::Disconnected(gone) => assert_eq!(gone, id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(transport.client_count(), 0);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn router_syntax_in_path_is_rejected() {
        for path in ["/:status", "/{x", "/{*rest}"] {
            let (tx, _events) = mpsc::channel(16);
            let config = TransportConfig {
                path: path.to_string(),
                ..local_config()
            };
            let err = WsTransport::bind(&config, tx).await.err().unwrap();
            assert!(matches!(err, TransportError::InvalidPath(_)), "{}", path);
        }
    }
}
