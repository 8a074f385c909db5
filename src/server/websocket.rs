use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use crate::common::models::{Envelope, UserId};
use crate::server::collaborators::Directory;
use crate::server::config::ServerConfig;
use crate::server::dispatcher::Dispatcher;
use crate::server::registry::{Connection, Transport};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub message_type: String, // "auth_response"
    pub success: bool,
    pub user_id: Option<UserId>,
    pub error: Option<String>,
}

impl AuthResponse {
    fn accepted(user_id: UserId) -> Self {
        Self { message_type: "auth_response".to_string(), success: true, user_id: Some(user_id), error: None }
    }

    fn rejected(reason: &str) -> Self {
        Self { message_type: "auth_response".to_string(), success: false, user_id: None, error: Some(reason.to_string()) }
    }
}

/// Write half of an upgraded socket.
pub struct WsTransport<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsTransport<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, frame: &str) -> anyhow::Result<()> {
        self.sink.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

async fn reject<S>(sink: &mut SplitSink<WebSocketStream<S>, Message>, reason: &str) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = serde_json::to_string(&AuthResponse::rejected(reason))?;
    let _ = sink.send(Message::Text(response)).await;
    Err(anyhow::anyhow!("authentication failed: {}", reason))
}

pub struct WsGateway {
    dispatcher: Arc<Dispatcher>,
    directory: Arc<dyn Directory>,
    auth_timeout: Duration,
    write_timeout: Duration,
}

impl WsGateway {
    pub fn new(dispatcher: Arc<Dispatcher>, directory: Arc<dyn Directory>, config: &ServerConfig) -> Self {
        Self { dispatcher, directory, auth_timeout: config.auth_timeout, write_timeout: config.write_timeout }
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("[WS] Listening on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("[WS] Connection from {}", peer);
            let gateway = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws_stream) => {
                        if let Err(e) = gateway.handle_connection(ws_stream).await {
                            warn!("[WS] Session from {} ended: {}", peer, e);
                        }
                    }
                    Err(e) => error!("[WS] Handshake with {} failed: {}", peer, e),
                }
            });
        }
    }

    /// Authenticates on the first text frame, then feeds every later frame to
    /// the dispatcher until the peer leaves or the connection is replaced.
    pub async fn handle_connection<S>(&self, ws_stream: WebSocketStream<S>) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws_stream.split();

        let first = match tokio::time::timeout(self.auth_timeout, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!("[WS] Peer left before authenticating");
                return Ok(());
            }
            Ok(Some(Ok(_))) => return reject(&mut sink, "Expected text message for authentication").await,
            Ok(Some(Err(e))) => return Err(e.into()),
            Err(_) => return reject(&mut sink, "Authentication timeout").await,
        };

        let token = match Envelope::decode(&first).map(|e| e.token) {
            Ok(Some(token)) if !token.is_empty() => token,
            _ => return reject(&mut sink, "Missing session token").await,
        };
        let user_id = match self.directory.validate_session(&token).await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => return reject(&mut sink, "Invalid or expired session token").await,
            Err(e) => {
                error!("[WS] Session lookup failed: {}", e);
                return reject(&mut sink, "Session lookup failed").await;
            }
        };

        let registry = self.dispatcher.registry().clone();
        let store = self.dispatcher.store().clone();
        let connection = Connection::with_write_timeout(user_id, WsTransport::new(sink), self.write_timeout);
        registry.register(connection.clone()).await;
        if let Err(e) = store.set_online(user_id).await {
            error!("[WS] Could not mark user {} online: {}", user_id, e);
            registry.remove_connection(user_id, connection.id()).await;
            return Err(e.into());
        }
        connection.write(&serde_json::to_string(&AuthResponse::accepted(user_id))?).await?;
        info!("[WS] User {} authenticated on connection {}", user_id, connection.id());

        loop {
            tokio::select! {
                _ = connection.closed() => {
                    // replaced or evicted; whoever closed us owns the cleanup
                    debug!("[WS] Connection {} for user {} closed by server", connection.id(), user_id);
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.dispatcher.handle(user_id, &text).await {
                            error!("[WS] Dropping user {} after backend failure: {}", user_id, e);
                            registry.remove_connection(user_id, connection.id()).await;
                            return Err(e.into());
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => connection.touch(),
                    Some(Ok(Message::Binary(_))) | Some(Ok(Message::Frame(_))) => {
                        debug!("[WS] Ignoring non-text frame from user {}", user_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        // a newer login may already own the slot
                        if registry.remove_connection(user_id, connection.id()).await && !registry.contains(user_id).await {
                            store.set_offline(user_id).await?;
                        }
                        info!("[WS] User {} logged out", user_id);
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        registry.remove_connection(user_id, connection.id()).await;
                        return Err(e.into());
                    }
                    None => {
                        registry.remove_connection(user_id, connection.id()).await;
                        debug!("[WS] Stream for user {} ended without close frame", user_id);
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::database::Database;
    use crate::server::group_ack::GroupAckProtocol;
    use crate::server::registry::Registry;
    use crate::server::store::{MemoryPresenceStore, PresenceStore};

    struct Fixture {
        gateway: Arc<WsGateway>,
        registry: Arc<Registry>,
        store: Arc<MemoryPresenceStore>,
    }

    async fn fixture() -> Fixture {
        let config = ServerConfig::default();
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        db.migrate().await.unwrap();
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES ('tok-1', 1, ?, ?)")
            .bind(now)
            .bind(now + 600)
            .execute(&db.pool)
            .await
            .unwrap();

        let registry = Arc::new(Registry::from_config(&config));
        let store = Arc::new(MemoryPresenceStore::new());
        let group_ack = Arc::new(GroupAckProtocol::new(registry.clone(), store.clone(), db.clone(), &config));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), store.clone(), db.clone(), db.clone(), group_ack, &config));
        let gateway = Arc::new(WsGateway::new(dispatcher, db, &config));
        Fixture { gateway, registry, store }
    }

    async fn pair(gateway: Arc<WsGateway>) -> (
        WebSocketStream<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server_io).await?;
            gateway.handle_connection(ws).await
        });
        let (client, _) = tokio_tungstenite::client_async("ws://localhost/", client_io).await.unwrap();
        (client, server)
    }

    async fn next_text(client: &mut WebSocketStream<tokio::io::DuplexStream>) -> String {
        loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => return text,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn valid_token_registers_and_close_logs_out() {
        let f = fixture().await;
        let (mut client, server) = pair(f.gateway.clone()).await;

        client.send(Message::Text(r#"{"cmd":0,"token":"tok-1"}"#.to_string())).await.unwrap();
        let response: AuthResponse = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert!(response.success);
        assert_eq!(response.user_id, Some(1));
        assert!(f.registry.contains(1).await);
        assert!(f.store.is_online(1).await.unwrap());

        client.send(Message::Text(r#"{"cmd":0}"#.to_string())).await.unwrap();
        assert_eq!(next_text(&mut client).await, r#"{"cmd":0}"#);

        client.close(None).await.unwrap();
        server.await.unwrap().unwrap();
        assert!(!f.registry.contains(1).await);
        assert!(!f.store.is_online(1).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let f = fixture().await;
        let (mut client, server) = pair(f.gateway.clone()).await;

        client.send(Message::Text(r#"{"cmd":0,"token":"forged"}"#.to_string())).await.unwrap();
        let response: AuthResponse = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert!(!response.success);
        assert!(server.await.unwrap().is_err());
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn replaced_connection_keeps_presence() {
        let f = fixture().await;
        let (mut first, first_server) = pair(f.gateway.clone()).await;
        first.send(Message::Text(r#"{"cmd":0,"token":"tok-1"}"#.to_string())).await.unwrap();
        next_text(&mut first).await;

        let (mut second, _second_server) = pair(f.gateway.clone()).await;
        second.send(Message::Text(r#"{"cmd":0,"token":"tok-1"}"#.to_string())).await.unwrap();
        next_text(&mut second).await;

        first_server.await.unwrap().unwrap();
        assert!(f.registry.contains(1).await);
        assert!(f.store.is_online(1).await.unwrap());
    }
}
