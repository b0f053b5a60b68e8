//! Client-side view of a session, as a pure reducer.
//!
//! The socket task feeds every decoded [`ServerMessage`] into
//! [`Replica::handle`] and acts on the returned [`Reaction`]: emit the
//! events, send the reply (if any), stop if asked. Nothing here does I/O.
//!
//! While a `request-state` is in flight, local edits are held back rather
//! than sent: the incoming state would not contain them, and their acks
//! would land on the wrong pending entry. Once the state lands the held
//! edits are replayed onto it and go out as one operation.

use crate::client::SyncEvent;
use crate::comments::CommentStore;
use crate::document::{DivergenceError, DocumentSync};
use crate::operation::{diff, Edit};
use crate::presence::PresenceTracker;
use crate::protocol::{
    ClientId, ClientMessage, Collaborator, CreateSession, JoinSession, ServerMessage, SessionId,
    SessionState, UserData,
};

/// What the socket task should do after one server message.
#[derive(Debug, Default)]
pub struct Reaction {
    pub events: Vec<SyncEvent>,
    pub reply: Option<ClientMessage>,
    /// The server refused us; do not reconnect.
    pub stop: bool,
}

impl Reaction {
    fn event(event: SyncEvent) -> Self {
        Self { events: vec![event], ..Self::default() }
    }
}

#[derive(Debug)]
pub struct Replica {
    session_id: Option<SessionId>,
    client_id: Option<ClientId>,
    document: DocumentSync,
    roster: Vec<Collaborator>,
    presence: PresenceTracker,
    comments: CommentStore,
    is_host: bool,
    joined: bool,
    /// A `request-state` is in flight; ops and acks are ignored until it lands.
    resyncing: bool,
    /// Local edits made while resyncing, oldest first.
    held: Vec<Edit>,
    /// Visible text while edits are held.
    held_view: Option<String>,
}

impl Replica {
    /// A replica that will open a new session seeded with `document`.
    pub fn create(document: impl Into<String>) -> Self {
        Self::with(None, DocumentSync::new(document, 0))
    }

    /// A replica that will join an existing session.
    pub fn join(session_id: SessionId) -> Self {
        Self::with(Some(session_id), DocumentSync::default())
    }

    fn with(session_id: Option<SessionId>, document: DocumentSync) -> Self {
        Self {
            session_id,
            client_id: None,
            document,
            roster: Vec::new(),
            presence: PresenceTracker::new(),
            comments: CommentStore::new(),
            is_host: false,
            joined: false,
            resyncing: false,
            held: Vec::new(),
            held_view: None,
        }
    }

    /// First frame on a fresh socket: join if we know a session, else create.
    pub fn opening_message(&self, user: &UserData) -> ClientMessage {
        match &self.session_id {
            Some(session_id) => ClientMessage::JoinSession(JoinSession {
                session_id: session_id.clone(),
                user_data: user.clone(),
                document: None,
            }),
            None => ClientMessage::CreateSession(CreateSession {
                user_data: user.clone(),
                document: self.document.content().to_string(),
            }),
        }
    }

    pub fn handle(&mut self, message: ServerMessage) -> Reaction {
        match message {
            ServerMessage::SessionState(state) => self.apply_state(state),

            ServerMessage::Operation(remote) => {
                if self.resyncing {
                    return Reaction::default();
                }
                match self.document.on_remote_operation(&remote.operation, remote.revision) {
                    Ok(true) => Reaction::event(SyncEvent::RemoteEdit {
                        client_id: remote.client_id,
                        revision: remote.revision,
                    }),
                    Ok(false) => Reaction::default(),
                    Err(e) => self.diverged(e),
                }
            }

            ServerMessage::OperationAck(ack) => {
                if self.resyncing {
                    return Reaction::default();
                }
                match self.document.on_ack(ack.revision) {
                    Ok(()) => Reaction::event(SyncEvent::OperationAcked { revision: ack.revision }),
                    Err(e) => self.diverged(e),
                }
            }

            ServerMessage::CursorUpdate(update) => {
                self.presence.update_cursor(update.client_id, update.cursor);
                Reaction::event(SyncEvent::CursorMoved {
                    client_id: update.client_id,
                    cursor: update.cursor,
                })
            }

            ServerMessage::SelectionUpdate(update) => {
                self.presence.update_selection(update.client_id, update.selection);
                Reaction::event(SyncEvent::SelectionChanged {
                    client_id: update.client_id,
                    selection: update.selection,
                })
            }

            ServerMessage::ClientJoined(joined) => {
                let client = joined.client;
                self.presence.seed(client.id, client.cursor, client.selection);
                self.roster.retain(|c| c.id != client.id);
                self.roster.push(client.clone());
                Reaction::event(SyncEvent::CollaboratorJoined(client))
            }

            ServerMessage::ClientLeft(left) => {
                self.roster.retain(|c| c.id != left.client_id);
                self.presence.remove(&left.client_id);
                if let Some(host) = left.new_host {
                    for client in &mut self.roster {
                        client.is_host = client.id == host;
                    }
                    self.is_host = self.client_id == Some(host);
                }
                Reaction::event(SyncEvent::CollaboratorLeft {
                    client_id: left.client_id,
                    new_host: left.new_host,
                })
            }

            ServerMessage::CommentAdded(comment) => {
                if self.comments.insert(comment.clone()) {
                    Reaction::event(SyncEvent::CommentAdded(comment))
                } else {
                    Reaction::default()
                }
            }

            ServerMessage::CommentResolved(resolved) => match self.comments.resolve(&resolved.comment_id) {
                Ok(_) => Reaction::event(SyncEvent::CommentResolved { comment_id: resolved.comment_id }),
                Err(e) => {
                    log::debug!("Ignoring resolve: {e}");
                    Reaction::default()
                }
            },

            ServerMessage::ChatMessage(chat) => Reaction::event(SyncEvent::Chat(chat)),

            ServerMessage::NeurolintResult(result) => {
                Reaction::event(SyncEvent::AnalysisResult(result.result))
            }

            ServerMessage::Error(reply) => {
                if self.joined {
                    log::warn!("Server error: {}", reply.error);
                    Reaction::event(SyncEvent::ServerError(reply.error))
                } else {
                    log::warn!("Join rejected: {}", reply.error);
                    Reaction {
                        events: vec![SyncEvent::JoinRejected { error: reply.error }],
                        reply: None,
                        stop: true,
                    }
                }
            }
        }
    }

    fn apply_state(&mut self, state: SessionState) -> Reaction {
        let first_join = !self.joined;
        let dropped = self.document.pending_len();
        if dropped > 0 {
            log::info!("Resync dropped {dropped} unacknowledged edits");
        }

        self.document.reset(state.document, state.revision);
        self.presence.clear();
        for client in &state.clients {
            self.presence.seed(client.id, client.cursor, client.selection);
        }
        self.roster = state.clients;
        self.comments.replace_all(state.comments);
        self.session_id = Some(state.session_id.clone());
        self.client_id = Some(state.client_id);
        self.is_host = state.is_host;
        self.joined = true;
        self.resyncing = false;
        let reply = self.replay_held();

        let mut events = Vec::with_capacity(2);
        if first_join {
            events.push(SyncEvent::SessionJoined {
                session_id: state.session_id,
                client_id: state.client_id,
                is_host: state.is_host,
            });
        }
        events.push(SyncEvent::DocumentReplaced { revision: state.revision });
        Reaction { events, reply, stop: false }
    }

    fn diverged(&mut self, error: DivergenceError) -> Reaction {
        log::warn!("Local copy diverged ({error}), requesting full state");
        Reaction {
            events: vec![SyncEvent::Diverged { reason: error.to_string() }],
            reply: Some(self.request_state()),
            stop: false,
        }
    }

    /// Apply held edits to the fresh state; the result is one new operation.
    fn replay_held(&mut self) -> Option<ClientMessage> {
        self.held_view = None;
        if self.held.is_empty() {
            return None;
        }
        let text = self
            .held
            .drain(..)
            .fold(self.document.content().to_string(), |text, edit| edit.apply_clamped(&text));
        log::debug!("Replaying held edits onto revision {}", self.document.revision());
        self.document.local_edit(&text).map(ClientMessage::Operation)
    }

    /// Start a resync. The caller must send the returned message.
    pub fn request_state(&mut self) -> ClientMessage {
        self.resyncing = true;
        ClientMessage::RequestState
    }

    /// Record a local edit. Returns the `operation` to send, if anything
    /// changed and no resync is in flight.
    pub fn local_edit(&mut self, new_content: &str) -> Option<ClientMessage> {
        if self.resyncing {
            if let Some(edit) = diff(self.content(), new_content) {
                self.held.push(edit);
                self.held_view = Some(new_content.to_string());
            }
            return None;
        }
        self.document.local_edit(new_content).map(ClientMessage::Operation)
    }

    /// The socket is gone. Membership is lost; the session id is kept so the
    /// next socket rejoins.
    pub fn connection_lost(&mut self) {
        self.joined = false;
        self.resyncing = false;
        self.held.clear();
        self.held_view = None;
        self.presence.clear();
        self.roster.clear();
    }

    /// Every collaborator, with presence merged in.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.roster
            .iter()
            .map(|c| {
                let mut c = c.clone();
                if let Some(p) = self.presence.get(&c.id) {
                    c.cursor = p.cursor;
                    c.selection = p.selection;
                    c.is_active = p.is_active;
                }
                c
            })
            .collect()
    }

    pub fn content(&self) -> &str {
        self.held_view.as_deref().unwrap_or(self.document.content())
    }

    pub fn revision(&self) -> u64 {
        self.document.revision()
    }

    pub fn document(&self) -> &DocumentSync {
        &self.document
    }

    pub fn comments(&self) -> &CommentStore {
        &self.comments
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }
}
