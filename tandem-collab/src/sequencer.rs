//! One actor per session.
//!
//! ```text
//! connection A ──┐                    ┌──► outbox A ──► socket A
//!                ├─► mailbox ─► actor ┤
//! connection B ──┘    (mpsc)  Session ├──► outbox B ──► socket B
//!                             + Group └──► outbox C ──► socket C
//! ```
//!
//! The actor task is the only writer of its [`Session`], so the revision
//! order is the mailbox order. The [`SessionRegistry`] holds mailbox
//! handles only, never content.
//!
//! A session dies with its last member: the actor unregisters itself, closes
//! its mailbox and rejects any join still queued with "session not found".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Outbox};
use crate::protocol::{ClientId, ClientMessage, ServerMessage, SessionId, UserData};
use crate::session::{Outbound, Session, SessionError};

/// Presence older than this is reported as inactive.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Point-in-time copy of a session's document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub session_id: SessionId,
    pub content: String,
    pub revision: u64,
    pub members: usize,
    pub broadcast: BroadcastStats,
}

/// Everything a session actor can be asked to do.
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        client_id: ClientId,
        user: UserData,
        outbox: Outbox,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Message {
        client_id: ClientId,
        message: ClientMessage,
    },
    Leave {
        client_id: ClientId,
    },
    /// Send a server-originated message to every member.
    Relay {
        message: ServerMessage,
    },
    /// Send a server-originated message to one member.
    Direct {
        client_id: ClientId,
        message: ServerMessage,
    },
    Snapshot {
        reply: oneshot::Sender<DocumentSnapshot>,
    },
}

/// Cheap, cloneable address of a session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    mailbox: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Join as a new member. On success the `session-state` is already in
    /// `outbox`.
    pub async fn join(
        &self,
        client_id: ClientId,
        user: UserData,
        outbox: Outbox,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(SessionCommand::Join { client_id, user, outbox, reply })
            .await
            .map_err(|_| SessionError::NotFound)?;
        rx.await.map_err(|_| SessionError::NotFound)?
    }

    pub async fn submit(&self, client_id: ClientId, message: ClientMessage) -> Result<(), SessionError> {
        self.send(SessionCommand::Message { client_id, message }).await
    }

    pub async fn leave(&self, client_id: ClientId) {
        // A closed mailbox means the session is already gone.
        let _ = self.send(SessionCommand::Leave { client_id }).await;
    }

    pub async fn relay(&self, message: ServerMessage) -> Result<(), SessionError> {
        self.send(SessionCommand::Relay { message }).await
    }

    pub async fn send_to(&self, client_id: ClientId, message: ServerMessage) -> Result<(), SessionError> {
        self.send(SessionCommand::Direct { client_id, message }).await
    }

    pub async fn snapshot(&self) -> Result<DocumentSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.mailbox.send(command).await.map_err(|_| SessionError::Closed)
    }
}

type SessionMap = Arc<RwLock<HashMap<SessionId, SessionHandle>>>;

/// Maps session ids to running actors.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: SessionMap,
    max_members: usize,
    mailbox_capacity: usize,
}

impl SessionRegistry {
    pub fn new(max_members: usize, mailbox_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_members,
            mailbox_capacity: mailbox_capacity.max(1),
        }
    }

    /// Start a new session with `client_id` as its first member and host.
    ///
    /// The creator's join happens before the actor exists, so there is no
    /// window in which the session is registered but empty.
    pub async fn create(
        &self,
        content: String,
        client_id: ClientId,
        user: UserData,
        outbox: Outbox,
    ) -> Result<SessionHandle, SessionError> {
        let id = SessionId::generate();
        let mut session = Session::new(id.clone(), content, self.max_members);
        let mut group = BroadcastGroup::new();

        let batch = session.join(client_id, &user)?;
        group.add_member(client_id, outbox);
        if !group.deliver(&batch).is_empty() {
            return Err(SessionError::Closed);
        }

        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let handle = SessionHandle { id: id.clone(), mailbox: tx };
        self.sessions.write().await.insert(id.clone(), handle.clone());
        log::info!("Session {id} created by {client_id}");

        tokio::spawn(run_session(session, group, rx, self.sessions.clone()));
        Ok(handle)
    }

    pub async fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

async fn run_session(
    mut session: Session,
    mut group: BroadcastGroup,
    mut mailbox: mpsc::Receiver<SessionCommand>,
    sessions: SessionMap,
) {
    let mut idle_sweep = tokio::time::interval(IDLE_SWEEP_INTERVAL);
    idle_sweep.tick().await;

    loop {
        tokio::select! {
            command = mailbox.recv() => {
                let Some(command) = command else { break };
                handle_command(&mut session, &mut group, command);
                if session.is_empty() {
                    break;
                }
            }
            _ = idle_sweep.tick() => {
                for id in session.mark_idle(IDLE_TIMEOUT) {
                    log::debug!("Client {id} idle in session {}", session.id());
                }
            }
        }
    }

    let id = session.id().clone();
    sessions.write().await.remove(&id);
    mailbox.close();
    while let Some(command) = mailbox.recv().await {
        if let SessionCommand::Join { reply, .. } = command {
            let _ = reply.send(Err(SessionError::NotFound));
        }
    }
    log::info!("Session {id} closed at revision {}", session.revision());
}

fn handle_command(session: &mut Session, group: &mut BroadcastGroup, command: SessionCommand) {
    match command {
        SessionCommand::Join { client_id, user, outbox, reply } => match session.join(client_id, &user) {
            Ok(batch) => {
                group.add_member(client_id, outbox);
                let _ = reply.send(Ok(()));
                dispatch(session, group, batch);
            }
            Err(e) => {
                log::debug!("Join to session {} rejected: {e}", session.id());
                let _ = reply.send(Err(e));
            }
        },

        SessionCommand::Message { client_id, message } => {
            log::debug!("Session {} <- {} from {client_id}", session.id(), message.kind());
            let batch = session.handle(client_id, message);
            dispatch(session, group, batch);
        }

        SessionCommand::Leave { client_id } => {
            group.remove_member(&client_id);
            let batch = session.leave(client_id);
            dispatch(session, group, batch);
        }

        SessionCommand::Relay { message } => {
            dispatch(session, group, vec![Outbound::all(message)]);
        }

        SessionCommand::Direct { client_id, message } => {
            dispatch(session, group, vec![Outbound::to(client_id, message)]);
        }

        SessionCommand::Snapshot { reply } => {
            let _ = reply.send(DocumentSnapshot {
                session_id: session.id().clone(),
                content: session.content().to_string(),
                revision: session.revision(),
                members: session.member_count(),
                broadcast: group.stats(),
            });
        }
    }
}

/// Deliver a batch, then turn every eviction into a leave, until quiet.
fn dispatch(session: &mut Session, group: &mut BroadcastGroup, batch: Vec<Outbound>) {
    let mut evicted = group.deliver(&batch);
    while let Some(id) = evicted.pop() {
        log::warn!("Evicting lagging client {id} from session {}", session.id());
        let batch = session.leave(id);
        evicted.extend(group.deliver(&batch));
    }
}
