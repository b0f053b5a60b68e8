//! WebSocket client for a collaborative session.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Optimistic local edits reconciled against the server's order
//! - Throttled cursor and immediate selection updates
//! - Comments, chat and analysis requests
//!
//! ```text
//!  app ── edit()/update_cursor() ──► outgoing queue ─┐
//!                                                    ▼
//!                              supervisor task ── socket ◄──► server
//!                                    │
//!  app ◄── SyncEvent mpsc ◄── Replica::handle()
//! ```
//!
//! One supervisor task owns the socket. It reads frames, feeds them to the
//! [`Replica`], writes whatever the app queued, and reconnects when the
//! socket drops.
//!
//! The replica and the outgoing queue sit behind one lock. Every frame
//! after the opening one is queued while that lock is held, so the wire
//! order always matches the order of the replica's pending operations.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::backoff::ReconnectPolicy;
use crate::comments::Comment;
use crate::presence::{Cursor, LocalPresence, Selection};
use crate::protocol::{
    AddComment, ChatMessage, ChatRelay, ClientId, ClientMessage, Collaborator, CursorUpdate,
    ProtocolError, ResolveComment, RunAnalysis, SelectionUpdate, ServerMessage, SessionId,
    UserData,
};
use crate::replica::Replica;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted or the server refused the join. Terminal.
    Failed,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Socket open, join or create sent
    Connected,
    /// Socket lost
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted
    GaveUp { attempts: u32 },
    /// First `session-state` on this socket
    SessionJoined { session_id: SessionId, client_id: ClientId, is_host: bool },
    /// The server answered the join with an error
    JoinRejected { error: String },
    /// Content replaced wholesale from the server
    DocumentReplaced { revision: u64 },
    RemoteEdit { client_id: ClientId, revision: u64 },
    OperationAcked { revision: u64 },
    CollaboratorJoined(Collaborator),
    CollaboratorLeft { client_id: ClientId, new_host: Option<ClientId> },
    CursorMoved { client_id: ClientId, cursor: Cursor },
    SelectionChanged { client_id: ClientId, selection: Option<Selection> },
    CommentAdded(Comment),
    CommentResolved { comment_id: String },
    Chat(ChatRelay),
    AnalysisResult(serde_json::Value),
    ServerError(String),
    /// Local copy was inconsistent; a full resync is under way
    Diverged { reason: String },
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("not connected")]
    NotConnected,
    #[error("client is already running")]
    AlreadyRunning,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub server_url: String,
    pub user: UserData,
    pub reconnect: ReconnectPolicy,
    /// Events buffered for the app before new ones are dropped
    pub event_capacity: usize,
    /// Minimum spacing of cursor updates
    pub cursor_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            user: UserData::named("Anonymous"),
            reconnect: ReconnectPolicy::default(),
            event_capacity: 256,
            cursor_interval: Duration::from_millis(33),
        }
    }
}

/// The replica plus the queue to the current socket.
struct Link {
    replica: Replica,
    /// Set in the same critical section that first marks the replica
    /// joined on this socket; `None` otherwise.
    outgoing: Option<mpsc::UnboundedSender<ClientMessage>>,
}

impl Link {
    fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        let tx = self.outgoing.as_ref().ok_or(ConnectionError::NotConnected)?;
        tx.send(message).map_err(|_| ConnectionError::NotConnected)
    }
}

/// State shared between the client handle and its supervisor task.
struct Shared {
    config: ClientConfig,
    link: Mutex<Link>,
    presence: Mutex<LocalPresence>,
    state: RwLock<ConnectionState>,
    events: mpsc::Sender<SyncEvent>,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Dropping sync event: {e}");
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        self.link.lock().await.send(message)
    }

    async fn connection_lost(&self) {
        {
            let mut link = self.link.lock().await;
            link.outgoing = None;
            link.replica.connection_lost();
        }
        self.presence.lock().await.reset();
    }
}

enum Outcome {
    /// Socket dropped; try again.
    Closed,
    /// Server refused the join; do not retry.
    Rejected,
    /// `disconnect()` or the client was dropped.
    Shutdown,
}

/// The sync client.
///
/// Holds the replica of one session and drives one socket to the server.
pub struct SyncClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    shutdown: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// A client that creates a new session seeded with `document`.
    pub fn create(config: ClientConfig, document: impl Into<String>) -> Self {
        Self::new(config, Replica::create(document))
    }

    /// A client that joins an existing session.
    pub fn join(config: ClientConfig, session_id: SessionId) -> Self {
        Self::new(config, Replica::join(session_id))
    }

    fn new(config: ClientConfig, replica: Replica) -> Self {
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let presence = LocalPresence::new(config.cursor_interval);
        Self {
            shared: Arc::new(Shared {
                config,
                link: Mutex::new(Link { replica, outgoing: None }),
                presence: Mutex::new(presence),
                state: RwLock::new(ConnectionState::Disconnected),
                events,
            }),
            event_rx: Some(event_rx),
            shutdown: None,
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and start the supervisor task.
    ///
    /// Fails if the first connection attempt fails; after that, drops are
    /// retried per the reconnect policy.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(ConnectionError::AlreadyRunning);
        }
        self.shared.set_state(ConnectionState::Connecting).await;

        let stream = match open_socket(&self.shared.config.server_url).await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected).await;
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.supervisor = Some(tokio::spawn(supervise(self.shared.clone(), stream, shutdown_rx)));
        Ok(())
    }

    /// Close the socket and cancel any pending reconnect.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.await;
        }
        self.shared.set_state(ConnectionState::Disconnected).await;
    }

    /// Replace the visible text with `new_content`.
    ///
    /// The change is applied locally at once. Returns `true` if the visible
    /// text changed. While offline the edit stays local and is discarded by
    /// the resync on rejoin. During a resync it is held and replayed onto
    /// the fresh state.
    pub async fn edit(&self, new_content: &str) -> Result<bool, ConnectionError> {
        let mut link = self.shared.link.lock().await;
        if link.replica.content() == new_content {
            return Ok(false);
        }
        if let Some(message) = link.replica.local_edit(new_content) {
            match link.send(message) {
                Ok(()) | Err(ConnectionError::NotConnected) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Move the local caret. Throttled; dropped while offline.
    pub async fn update_cursor(&self, cursor: Cursor) -> Result<(), ConnectionError> {
        let send = self.shared.presence.lock().await.update_cursor(cursor);
        match send {
            Some(cursor) => self.send_presence(ClientMessage::CursorUpdate(CursorUpdate { cursor })).await,
            None => Ok(()),
        }
    }

    /// Send a caret move held back by the throttle.
    pub async fn flush_cursor(&self) -> Result<(), ConnectionError> {
        let send = self.shared.presence.lock().await.flush_cursor();
        match send {
            Some(cursor) => self.send_presence(ClientMessage::CursorUpdate(CursorUpdate { cursor })).await,
            None => Ok(()),
        }
    }

    pub async fn update_selection(&self, selection: Option<Selection>) -> Result<(), ConnectionError> {
        let selection = self.shared.presence.lock().await.update_selection(selection);
        self.send_presence(ClientMessage::SelectionUpdate(SelectionUpdate { selection })).await
    }

    pub async fn add_comment(&self, content: &str, line: u32, column: u32) -> Result<(), ConnectionError> {
        self.shared
            .send(ClientMessage::AddComment(AddComment {
                content: content.to_string(),
                line,
                column,
            }))
            .await
    }

    pub async fn resolve_comment(&self, comment_id: &str) -> Result<(), ConnectionError> {
        self.shared
            .send(ClientMessage::ResolveComment(ResolveComment {
                comment_id: comment_id.to_string(),
            }))
            .await
    }

    pub async fn send_chat(&self, content: &str) -> Result<(), ConnectionError> {
        self.shared
            .send(ClientMessage::ChatMessage(ChatMessage {
                content: content.to_string(),
                kind: "text".to_string(),
            }))
            .await
    }

    pub async fn run_analysis(&self, request: RunAnalysis) -> Result<(), ConnectionError> {
        self.shared.send(ClientMessage::RunNeurolint(request)).await
    }

    /// Ask for a full `session-state`.
    ///
    /// Edits made until it arrives are held back and replayed onto it.
    pub async fn request_state(&self) -> Result<(), ConnectionError> {
        let mut link = self.shared.link.lock().await;
        if link.outgoing.is_none() {
            return Err(ConnectionError::NotConnected);
        }
        if link.replica.is_resyncing() {
            return Ok(());
        }
        let message = link.replica.request_state();
        link.send(message)
    }

    async fn send_presence(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        match self.shared.send(message).await {
            // presence is advisory; nothing to catch up on later
            Err(ConnectionError::NotConnected) => Ok(()),
            other => other,
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub async fn content(&self) -> String {
        self.shared.link.lock().await.replica.content().to_string()
    }

    pub async fn revision(&self) -> u64 {
        self.shared.link.lock().await.replica.revision()
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.link.lock().await.replica.document().pending_len()
    }

    pub async fn collaborators(&self) -> Vec<Collaborator> {
        self.shared.link.lock().await.replica.collaborators()
    }

    pub async fn comments(&self) -> Vec<Comment> {
        self.shared.link.lock().await.replica.comments().all().to_vec()
    }

    pub async fn is_joined(&self) -> bool {
        self.shared.link.lock().await.replica.is_joined()
    }

    pub async fn is_host(&self) -> bool {
        self.shared.link.lock().await.replica.is_host()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.shared.link.lock().await.replica.session_id().cloned()
    }

    pub async fn client_id(&self) -> Option<ClientId> {
        self.shared.link.lock().await.replica.client_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

async fn open_socket(url: &str) -> Result<WsStream, ConnectionError> {
    match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(e)) => Err(ConnectionError::WebSocket(e.to_string())),
        Err(_) => Err(ConnectionError::WebSocket(format!("connect to {url} timed out"))),
    }
}

async fn supervise(shared: Arc<Shared>, mut stream: WsStream, mut shutdown: watch::Receiver<bool>) {
    loop {
        let outcome = run_connection(&shared, stream, &mut shutdown).await;
        shared.connection_lost().await;

        match outcome {
            Outcome::Shutdown => {
                shared.set_state(ConnectionState::Disconnected).await;
                shared.emit(SyncEvent::Disconnected);
                return;
            }
            Outcome::Rejected => {
                shared.set_state(ConnectionState::Failed).await;
                shared.emit(SyncEvent::Disconnected);
                return;
            }
            Outcome::Closed => {
                log::info!("Connection to {} lost", shared.config.server_url);
                shared.emit(SyncEvent::Disconnected);
            }
        }

        match reconnect(&shared, &mut shutdown).await {
            Some(next) => stream = next,
            None => return,
        }
    }
}

/// Retry until a socket opens, retries run out, or shutdown.
async fn reconnect(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> Option<WsStream> {
    let policy = &shared.config.reconnect;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(delay) = policy.next_delay(attempt) else {
            let attempts = attempt - 1;
            log::error!("Giving up on {} after {attempts} attempts", shared.config.server_url);
            shared.set_state(ConnectionState::Failed).await;
            shared.emit(SyncEvent::GaveUp { attempts });
            return None;
        };

        shared.set_state(ConnectionState::Reconnecting).await;
        shared.emit(SyncEvent::Reconnecting { attempt, delay });
        log::info!("Reconnecting in {delay:?} (attempt {attempt})");

        tokio::select! {
            _ = shutdown.changed() => {
                shared.set_state(ConnectionState::Disconnected).await;
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        tokio::select! {
            _ = shutdown.changed() => {
                shared.set_state(ConnectionState::Disconnected).await;
                return None;
            }
            result = open_socket(&shared.config.server_url) => match result {
                Ok(stream) => return Some(stream),
                Err(e) => log::warn!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
    }
}

async fn run_connection(
    shared: &Shared,
    stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> Outcome {
    let (mut writer, mut reader) = stream.split();

    let opening = shared.link.lock().await.replica.opening_message(&shared.config.user);
    if let Err(e) = send_frame(&mut writer, &opening).await {
        log::error!("Failed to send {}: {e}", opening.kind());
        return Outcome::Closed;
    }
    shared.set_state(ConnectionState::Connected).await;
    shared.emit(SyncEvent::Connected);

    // Frames after the opening one are queued under the link lock, so the
    // wire order matches the order of pending operations.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = writer.send(Message::Close(None)).await;
                return Outcome::Shutdown;
            }

            Some(message) = out_rx.recv() => {
                if let Err(e) = send_frame(&mut writer, &message).await {
                    log::error!("Failed to send {}: {e}", message.kind());
                    return Outcome::Closed;
                }
            }

            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message = match ServerMessage::decode(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            log::warn!("Ignoring frame from server: {e}");
                            continue;
                        }
                    };
                    log::debug!("Received {}", message.kind());

                    let reaction = {
                        let mut link = shared.link.lock().await;
                        let mut reaction = link.replica.handle(message);
                        if link.replica.is_joined() && link.outgoing.is_none() {
                            link.outgoing = Some(out_tx.clone());
                        }
                        if let Some(reply) = reaction.reply.take() {
                            // out_rx lives as long as this loop
                            let _ = out_tx.send(reply);
                        }
                        reaction
                    };
                    for event in reaction.events {
                        shared.emit(event);
                    }
                    if reaction.stop {
                        let _ = writer.send(Message::Close(None)).await;
                        return Outcome::Rejected;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if writer.send(Message::Pong(data)).await.is_err() {
                        return Outcome::Closed;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Outcome::Closed,
                Some(Err(e)) => {
                    log::error!("WebSocket error: {e}");
                    return Outcome::Closed;
                }
                _ => {}
            }
        }
    }
}

async fn send_frame<S>(writer: &mut S, message: &ClientMessage) -> Result<(), ConnectionError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = message.encode()?;
    writer
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| ConnectionError::WebSocket(e.to_string()))
}
