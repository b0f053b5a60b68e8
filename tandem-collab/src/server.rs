//! WebSocket server: accepts sockets and routes them into session actors.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Session actor (S1) ── outboxes
//!             ├── connection tasks ──┤
//! Client B ──┘    (one per socket)   └── Session actor (S2) ── outboxes
//!                       │
//!                       └── SessionRegistry (S1, S2 → mailbox handles)
//! ```
//!
//! A connection task is a thin adapter. It decodes frames, answers
//! create/join itself, and forwards everything else to its session's
//! mailbox. It drains its outbox onto the socket and pings on a timer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::analysis::{AnalysisError, AnalysisRequest, AnalysisService};
use crate::protocol::{
    AnalysisResult, ClientId, ClientMessage, CreateSession, JoinSession, RunAnalysis,
    ServerMessage,
};
use crate::sequencer::{SessionHandle, SessionRegistry};
use crate::session::SessionError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Members allowed in one session
    pub max_members_per_session: usize,
    /// Frames buffered per member before it is evicted
    pub outbox_capacity: usize,
    /// Commands buffered per session actor
    pub mailbox_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_session: 100,
            outbox_capacity: 256,
            mailbox_capacity: 1024,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub parse_errors: u64,
    pub active_sessions: usize,
}

/// Everything a connection task needs, cloned per accept.
#[derive(Clone)]
struct ConnectionContext {
    config: ServerConfig,
    registry: SessionRegistry,
    stats: Arc<RwLock<ServerStats>>,
    analysis: Option<Arc<dyn AnalysisService>>,
}

/// The session server.
pub struct SyncServer {
    config: ServerConfig,
    registry: SessionRegistry,
    stats: Arc<RwLock<ServerStats>>,
    analysis: Option<Arc<dyn AnalysisService>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = SessionRegistry::new(config.max_members_per_session, config.mailbox_capacity);
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            analysis: None,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Relay `run-neurolint` requests to `service`.
    pub fn with_analysis(mut self, service: Arc<dyn AnalysisService>) -> Self {
        self.analysis = Some(service);
        self
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = ConnectionContext {
                config: self.config.clone(),
                registry: self.registry.clone(),
                stats: self.stats.clone(),
                analysis: self.analysis.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

struct Membership {
    handle: SessionHandle,
    client_id: ClientId,
}

/// Per-socket state.
struct Connection {
    addr: SocketAddr,
    ctx: ConnectionContext,
    membership: Option<Membership>,
    outbox: Option<mpsc::Receiver<Arc<str>>>,
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: ConnectionContext) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let stats = ctx.stats.clone();
    let mut conn = Connection { addr, ctx, membership: None, outbox: None };
    let result = conn.serve(ws_stream).await;

    // Always leave, however the socket ended.
    if let Some(membership) = conn.membership.take() {
        membership.handle.leave(membership.client_id).await;
    }
    stats.write().await.active_connections -= 1;
    result
}

impl Connection {
    async fn serve(&mut self, ws_stream: WebSocketStream<TcpStream>) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let period = Duration::from_secs(self.ctx.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = self.ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match ClientMessage::decode(&text) {
                                Ok(message) => self.route(message, &mut ws_sender).await?,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {}: {e}", self.addr);
                                    self.ctx.stats.write().await.parse_errors += 1;
                                    send(&mut ws_sender, &ServerMessage::error(e)).await?;
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            send(&mut ws_sender, &ServerMessage::error("binary frames are not supported")).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Frames from the session actor
                frame = async {
                    match self.outbox.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Some(text) => {
                            ws_sender.send(Message::Text(text.to_string().into())).await?;
                        }
                        None => {
                            // The actor dropped our outbox: evicted or session gone.
                            log::warn!("Session dropped {}, closing", self.addr);
                            self.membership = None;
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    async fn route(&mut self, message: ClientMessage, ws_sender: &mut WsSender) -> Result<(), BoxError> {
        log::debug!("{} -> {}", self.addr, message.kind());
        match message {
            ClientMessage::CreateSession(create) => {
                if let Err(e) = self.create(create).await {
                    send(ws_sender, &ServerMessage::error(e)).await?;
                }
            }

            ClientMessage::JoinSession(join) => {
                if let Err(e) = self.join(join).await {
                    send(ws_sender, &ServerMessage::error(e)).await?;
                }
            }

            ClientMessage::RunNeurolint(request) => {
                if let Err(e) = self.analyze(request) {
                    send(ws_sender, &ServerMessage::error(e)).await?;
                }
            }

            other => match &self.membership {
                Some(m) => {
                    if let Err(e) = m.handle.submit(m.client_id, other).await {
                        send(ws_sender, &ServerMessage::error(e)).await?;
                    }
                }
                None => send(ws_sender, &ServerMessage::error(SessionError::NotJoined)).await?,
            },
        }
        Ok(())
    }

    async fn create(&mut self, create: CreateSession) -> Result<(), SessionError> {
        if self.membership.is_some() {
            return Err(SessionError::AlreadyJoined);
        }
        let client_id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.ctx.config.outbox_capacity.max(1));
        let handle = self
            .ctx
            .registry
            .create(create.document, client_id, create.user_data, tx)
            .await?;
        self.outbox = Some(rx);
        self.membership = Some(Membership { handle, client_id });
        Ok(())
    }

    async fn join(&mut self, join: JoinSession) -> Result<(), SessionError> {
        if self.membership.is_some() {
            return Err(SessionError::AlreadyJoined);
        }
        let handle = self
            .ctx
            .registry
            .get(&join.session_id)
            .await
            .ok_or(SessionError::NotFound)?;

        // A fresh id per join: a rejoin is a new membership.
        let client_id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.ctx.config.outbox_capacity.max(1));
        handle.join(client_id, join.user_data, tx).await?;
        self.outbox = Some(rx);
        self.membership = Some(Membership { handle, client_id });
        Ok(())
    }

    /// Run the analysis off the connection task; results come back through
    /// the session.
    fn analyze(&self, request: RunAnalysis) -> Result<(), String> {
        let membership = self
            .membership
            .as_ref()
            .ok_or_else(|| SessionError::NotJoined.to_string())?;
        let service = self
            .ctx
            .analysis
            .clone()
            .ok_or_else(|| AnalysisError::NotConfigured.to_string())?;

        let handle = membership.handle.clone();
        let client_id = membership.client_id;
        tokio::spawn(async move {
            let snapshot = match handle.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::debug!("Analysis skipped: {e}");
                    return;
                }
            };
            let request = AnalysisRequest {
                code: snapshot.content,
                filename: request.filename.unwrap_or_else(|| "document.txt".to_string()),
                layers: request.layers,
                dry_run: request.dry_run,
            };
            let reply = match service.analyze(request).await {
                Ok(result) => {
                    log::info!("Analysis of session {} at revision {} done", snapshot.session_id, snapshot.revision);
                    handle.relay(ServerMessage::NeurolintResult(AnalysisResult { result })).await
                }
                Err(e) => {
                    log::warn!("Analysis for {client_id} failed: {e}");
                    handle.send_to(client_id, ServerMessage::error(e)).await
                }
            };
            if let Err(e) = reply {
                log::debug!("Analysis result undeliverable: {e}");
            }
        });
        Ok(())
    }
}

async fn send(ws_sender: &mut WsSender, message: &ServerMessage) -> Result<(), BoxError> {
    let text = message.encode()?;
    ws_sender.send(Message::Text(text.into())).await?;
    Ok(())
}
