//! WebSocket gateway server built on axum.

use super::GatewayConfig;
use super::connection::ConnectionManager;
use super::events::{ClientMessage, ServerMessage};
use crate::error::ChannelError;
use crate::pipeline::Pipeline;
use crate::session::{EventSink, SessionChannel, SessionState};
use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::{Html, IntoResponse},
    routing::get,
};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INDEX_HTML: &str = include_str!("index.html");

/// Thread-safe shared gateway reference for axum handlers.
pub type SharedGateway = Arc<Mutex<GatewayServer>>;

/// Connection registry plus the pipeline every session runs against.
pub struct GatewayServer {
    config: GatewayConfig,
    connections: ConnectionManager,
    pipeline: Arc<Pipeline>,
    started_at: chrono::DateTime<Utc>,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("config", &self.config)
            .field("connections", &self.connections.active_count())
            .finish()
    }
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, pipeline: Arc<Pipeline>) -> Self {
        let connections = ConnectionManager::new(config.max_connections);
        Self {
            config,
            connections,
            pipeline,
            started_at: Utc::now(),
        }
    }

    /// Wrap in the shared handle the router expects.
    pub fn shared(self) -> SharedGateway {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionManager {
        &mut self.connections
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn uptime_secs(&self) -> u64 {
        let elapsed = Utc::now() - self.started_at;
        elapsed.num_seconds().max(0) as u64
    }

    pub fn active_connections(&self) -> usize {
        self.connections.active_count()
    }
}

/// Outbound websocket half. The mutex is the send lock: one frame at a time.
pub struct WsSink {
    inner: Mutex<SplitSink<WebSocket, WsMessage>>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, WsMessage>) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let _ = inner.close().await;
    }
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&self, event: ServerMessage) -> Result<(), ChannelError> {
        let json = event.to_json().map_err(|_| ChannelError::Closed)?;
        let mut inner = self.inner.lock().await;
        inner
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

/// Build an axum Router with `/`, `/ws` and `/health` routes.
pub fn router(shared: SharedGateway) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn ws_handler(ws: WebSocketUpgrade, State(gw): State<SharedGateway>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gw))
}

async fn health_handler(State(gw): State<SharedGateway>) -> impl IntoResponse {
    let gw = gw.lock().await;
    let body = serde_json::json!({
        "status": "ok",
        "connections": gw.active_connections(),
        "max_connections": gw.connections().max_connections(),
        "uptime_secs": gw.uptime_secs(),
        "backends": gw.pipeline().pool().names(),
    });
    axum::Json(body)
}

/// Serve one client: prompts are handled one at a time, and a closed socket
/// cancels whatever is in flight.
async fn handle_socket(mut socket: WebSocket, gw: SharedGateway) {
    let registered = {
        let mut gw = gw.lock().await;
        gw.connections_mut()
            .add_connection()
            .map(|id| (id, gw.pipeline()))
    };
    let Some((conn_id, pipeline)) = registered else {
        warn!("Rejecting websocket connection: server at capacity");
        let err = ServerMessage::error("Server at maximum connections");
        if let Ok(json) = err.to_json() {
            let _ = socket.send(WsMessage::Text(json.into())).await;
        }
        let _ = socket.close().await;
        return;
    };
    info!(connection_id = %conn_id, "Client connected");

    let (sender, receiver) = socket.split();
    let sink = Arc::new(WsSink::new(sender));
    let cancel = CancellationToken::new();
    let (prompt_tx, mut prompt_rx) = mpsc::channel::<String>(8);
    let reader = tokio::spawn(read_prompts(
        receiver,
        prompt_tx,
        Arc::clone(&sink),
        cancel.clone(),
        conn_id,
    ));

    let mut session = SessionChannel::new(pipeline, sink.clone() as Arc<dyn EventSink>);
    while let Some(prompt) = prompt_rx.recv().await {
        if session.handle_prompt(&prompt, &cancel).await == SessionState::Closed {
            break;
        }
    }
    if session.state() != SessionState::Closed {
        session.close();
    }

    cancel.cancel();
    reader.abort();
    sink.close().await;
    gw.lock().await.connections_mut().remove_connection(&conn_id);
    info!(connection_id = %conn_id, session_id = %session.id(), "Client disconnected");
}

/// Forward prompts from the socket until it closes, then cancel the session.
async fn read_prompts(
    mut receiver: futures::stream::SplitStream<WebSocket>,
    prompts: mpsc::Sender<String>,
    sink: Arc<WsSink>,
    cancel: CancellationToken,
    conn_id: Uuid,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            WsMessage::Text(t) => t.to_string(),
            WsMessage::Close(_) => break,
            WsMessage::Binary(_) => {
                let _ = sink
                    .send(ServerMessage::error("Binary frames are not supported"))
                    .await;
                continue;
            }
            _ => continue,
        };

        match ClientMessage::parse(&text) {
            Ok(msg) => {
                if prompts.send(msg.prompt).await.is_err() {
                    break;
                }
            }
            Err(reason) => {
                debug!(connection_id = %conn_id, reason = %reason, "Rejected client frame");
                if sink.send(ServerMessage::error(reason)).await.is_err() {
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

/// Serve the gateway on an already-bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    gw: SharedGateway,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = router(gw);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Bind the configured address and serve until `shutdown` fires.
pub async fn run(gw: SharedGateway, shutdown: CancellationToken) -> Result<(), std::io::Error> {
    let (host, port) = {
        let gw = gw.lock().await;
        (gw.config().host.clone(), gw.config().port)
    };
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    serve(listener, gw, shutdown).await
}
