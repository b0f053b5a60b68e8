//! Authoritative state of one editing session.
//!
//! [`Session`] is a pure reducer: it owns content, revision, membership,
//! presence and comments, and turns each inbound message into a list of
//! [`Outbound`] messages. It performs no I/O. The sequencer actor owns one
//! `Session` and does the delivery.
//!
//! Operations are applied positionally against the **current** content,
//! whatever their `baseRevision`. Out-of-range edits are clamped first and
//! the clamped edit is what gets broadcast, so every member replays exactly
//! what the server applied.
//!
//! Analysis requests never reach a `Session`: the connection layer answers
//! them from the session snapshot. One that does arrive produces nothing.

use std::time::Duration;

use thiserror::Error;

use crate::comments::CommentStore;
use crate::operation::TextOperation;
use crate::presence::{color_for, PresenceTracker};
use crate::protocol::{
    unix_millis, ChatRelay, ClientId, ClientJoined, ClientLeft, ClientMessage, Collaborator,
    CommentResolved, OperationAck, RemoteCursor, RemoteOperation, RemoteSelection,
    ServerMessage, SessionId, SessionState, UserData,
};

/// Who an outbound message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Client(ClientId),
    AllExcept(ClientId),
    All,
}

impl Recipient {
    pub fn includes(&self, id: &ClientId) -> bool {
        match self {
            Recipient::Client(target) => target == id,
            Recipient::AllExcept(excluded) => excluded != id,
            Recipient::All => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Recipient,
    pub message: ServerMessage,
}

impl Outbound {
    pub fn to(id: ClientId, message: ServerMessage) -> Self {
        Self { to: Recipient::Client(id), message }
    }

    pub fn all_except(id: ClientId, message: ServerMessage) -> Self {
        Self { to: Recipient::AllExcept(id), message }
    }

    pub fn all(message: ServerMessage) -> Self {
        Self { to: Recipient::All, message }
    }
}

/// Membership and routing failures. The display text is the `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session is full")]
    Full,
    #[error("not in a session")]
    NotJoined,
    #[error("already in a session")]
    AlreadyJoined,
    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone)]
struct Member {
    id: ClientId,
    name: String,
    color: String,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    content: String,
    revision: u64,
    /// Join order; the first entry is the longest-standing member.
    members: Vec<Member>,
    host: Option<ClientId>,
    presence: PresenceTracker,
    comments: CommentStore,
    max_members: usize,
}

impl Session {
    pub fn new(id: SessionId, content: impl Into<String>, max_members: usize) -> Self {
        Self {
            id,
            content: content.into(),
            revision: 0,
            members: Vec::new(),
            host: None,
            presence: PresenceTracker::new(),
            comments: CommentStore::new(),
            max_members: max_members.max(1),
        }
    }

    /// Add a member. The joiner gets `session-state`, everyone else
    /// `client-joined`. The first member becomes host.
    pub fn join(&mut self, client_id: ClientId, user: &UserData) -> Result<Vec<Outbound>, SessionError> {
        if self.is_member(&client_id) {
            return Err(SessionError::AlreadyJoined);
        }
        if self.members.len() >= self.max_members {
            return Err(SessionError::Full);
        }

        let name = match user.name.trim() {
            "" => "Anonymous".to_string(),
            name => name.to_string(),
        };
        let color = user.color.clone().unwrap_or_else(|| color_for(client_id));
        self.members.push(Member { id: client_id, name, color });
        self.presence.insert(client_id);
        if self.host.is_none() {
            self.host = Some(client_id);
        }

        log::info!(
            "Client {client_id} joined session {} ({} members)",
            self.id,
            self.members.len()
        );

        let mut out = vec![Outbound::to(client_id, ServerMessage::SessionState(self.state_for(client_id)))];
        if self.members.len() > 1 {
            if let Some(client) = self.collaborator(&client_id) {
                out.push(Outbound::all_except(
                    client_id,
                    ServerMessage::ClientJoined(ClientJoined { client }),
                ));
            }
        }
        Ok(out)
    }

    /// Remove a member and its presence, promoting a new host if needed.
    pub fn leave(&mut self, client_id: ClientId) -> Vec<Outbound> {
        let Some(index) = self.members.iter().position(|m| m.id == client_id) else {
            return Vec::new();
        };
        self.members.remove(index);
        self.presence.remove(&client_id);

        let mut new_host = None;
        if self.host == Some(client_id) {
            self.host = self.members.first().map(|m| m.id);
            new_host = self.host;
            if let Some(host) = new_host {
                log::info!("Client {host} promoted to host of session {}", self.id);
            }
        }

        log::info!(
            "Client {client_id} left session {} ({} members)",
            self.id,
            self.members.len()
        );

        if self.members.is_empty() {
            return Vec::new();
        }
        vec![Outbound::all_except(
            client_id,
            ServerMessage::ClientLeft(ClientLeft { client_id, new_host }),
        )]
    }

    /// Route one client message.
    pub fn handle(&mut self, client_id: ClientId, message: ClientMessage) -> Vec<Outbound> {
        if !self.is_member(&client_id) {
            return vec![Outbound::to(client_id, ServerMessage::error(SessionError::NotJoined))];
        }

        match message {
            ClientMessage::Operation(op) => self.apply_operation(client_id, op),

            ClientMessage::CursorUpdate(update) => {
                log::trace!("Cursor from {client_id} in session {}", self.id);
                self.presence.update_cursor(client_id, update.cursor);
                vec![Outbound::all_except(
                    client_id,
                    ServerMessage::CursorUpdate(RemoteCursor { client_id, cursor: update.cursor }),
                )]
            }

            ClientMessage::SelectionUpdate(update) => {
                self.presence.update_selection(client_id, update.selection);
                vec![Outbound::all_except(
                    client_id,
                    ServerMessage::SelectionUpdate(RemoteSelection {
                        client_id,
                        selection: update.selection,
                    }),
                )]
            }

            ClientMessage::AddComment(add) => {
                match self.comments.add(client_id, &add.content, add.line, add.column) {
                    Ok(comment) => {
                        log::debug!("Comment {} added to session {}", comment.id, self.id);
                        vec![Outbound::all(ServerMessage::CommentAdded(comment))]
                    }
                    Err(e) => vec![Outbound::to(client_id, ServerMessage::error(e))],
                }
            }

            ClientMessage::ResolveComment(resolve) => {
                match self.comments.resolve(&resolve.comment_id) {
                    Ok(_) => vec![Outbound::all(ServerMessage::CommentResolved(CommentResolved {
                        comment_id: resolve.comment_id,
                    }))],
                    Err(e) => vec![Outbound::to(client_id, ServerMessage::error(e))],
                }
            }

            ClientMessage::ChatMessage(chat) => {
                let name = self.member_name(&client_id).unwrap_or("Anonymous").to_string();
                vec![Outbound::all(ServerMessage::ChatMessage(ChatRelay {
                    client_id,
                    name,
                    content: chat.content,
                    kind: chat.kind,
                    timestamp: unix_millis(),
                }))]
            }

            ClientMessage::RequestState => {
                log::debug!("Client {client_id} requested state of session {}", self.id);
                vec![Outbound::to(client_id, ServerMessage::SessionState(self.state_for(client_id)))]
            }

            ClientMessage::CreateSession(_) | ClientMessage::JoinSession(_) => {
                vec![Outbound::to(client_id, ServerMessage::error(SessionError::AlreadyJoined))]
            }

            ClientMessage::RunNeurolint(_) => {
                log::debug!("Analysis request from {client_id} reached session {}; ignoring", self.id);
                Vec::new()
            }
        }
    }

    fn apply_operation(&mut self, client_id: ClientId, op: TextOperation) -> Vec<Outbound> {
        let len = self.content.chars().count();
        let edit = op.edit.clamp_to(len);
        if edit != op.edit {
            log::warn!(
                "Clamped {} at {} from {client_id} to fit {len} chars in session {}",
                op.edit.kind(),
                op.edit.position(),
                self.id
            );
        }
        self.content = edit.apply_clamped(&self.content);
        self.revision += 1;
        let revision = self.revision;

        log::debug!(
            "Session {} applied {} from {client_id} (base {}) at revision {revision}",
            self.id,
            edit.kind(),
            op.base_revision
        );

        let operation = TextOperation::new(edit, op.base_revision);
        vec![
            Outbound::all_except(
                client_id,
                ServerMessage::Operation(RemoteOperation { operation, revision, client_id }),
            ),
            Outbound::to(client_id, ServerMessage::OperationAck(OperationAck { revision })),
        ]
    }

    /// Flag members idle longer than `timeout` as inactive.
    pub fn mark_idle(&mut self, timeout: Duration) -> Vec<ClientId> {
        self.presence.mark_idle(timeout)
    }

    /// Full snapshot as seen by `client_id`.
    pub fn state_for(&self, client_id: ClientId) -> SessionState {
        SessionState {
            session_id: self.id.clone(),
            client_id,
            document: self.content.clone(),
            revision: self.revision,
            clients: self.collaborators(),
            is_host: self.host == Some(client_id),
            comments: self.comments.all().to_vec(),
        }
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.members
            .iter()
            .filter_map(|m| self.collaborator(&m.id))
            .collect()
    }

    fn collaborator(&self, id: &ClientId) -> Option<Collaborator> {
        let member = self.members.iter().find(|m| &m.id == id)?;
        Some(Collaborator {
            id: member.id,
            name: member.name.clone(),
            color: member.color.clone(),
            cursor: self.presence.cursor(id),
            selection: self.presence.selection(id),
            is_active: self.presence.is_active(id),
            is_host: self.host == Some(member.id),
        })
    }

    fn member_name(&self, id: &ClientId) -> Option<&str> {
        self.members.iter().find(|m| &m.id == id).map(|m| m.name.as_str())
    }

    pub fn is_member(&self, id: &ClientId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    pub fn member_ids(&self) -> Vec<ClientId> {
        self.members.iter().map(|m| m.id).collect()
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn host(&self) -> Option<ClientId> {
        self.host
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn comments(&self) -> &CommentStore {
        &self.comments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Edit;
    use crate::presence::Cursor;
    use crate::protocol::{AddComment, ChatMessage, CursorUpdate, ResolveComment, RunAnalysis};

    fn session_with(content: &str) -> Session {
        Session::new(SessionId::new("S1"), content, 16)
    }

    fn join(session: &mut Session, name: &str) -> ClientId {
        let id = ClientId::new();
        session.join(id, &UserData::named(name)).unwrap();
        id
    }

    fn op(edit: Edit, base: u64) -> ClientMessage {
        ClientMessage::Operation(TextOperation::new(edit, base))
    }

    #[test]
    fn test_first_member_is_host() {
        let mut session = session_with("abc");
        let id = ClientId::new();
        let out = session.join(id, &UserData::named("Ann")).unwrap();

        assert_eq!(session.host(), Some(id));
        assert_eq!(out.len(), 1);
        match &out[0].message {
            ServerMessage::SessionState(state) => {
                assert_eq!(out[0].to, Recipient::Client(id));
                assert_eq!(state.document, "abc");
                assert_eq!(state.revision, 0);
                assert!(state.is_host);
                assert_eq!(state.clients.len(), 1);
                assert_eq!(state.clients[0].name, "Ann");
            }
            other => panic!("expected session-state, got {other:?}"),
        }
    }

    #[test]
    fn test_join_broadcasts_client_joined() {
        let mut session = session_with("");
        let host = join(&mut session, "Host");
        let guest = ClientId::new();
        let out = session.join(guest, &UserData::named("")).unwrap();

        let joined = out
            .iter()
            .find(|o| matches!(o.message, ServerMessage::ClientJoined(_)))
            .unwrap();
        assert!(joined.to.includes(&host));
        assert!(!joined.to.includes(&guest));
        match &joined.message {
            ServerMessage::ClientJoined(j) => {
                assert_eq!(j.client.name, "Anonymous");
                assert!(!j.client.is_host);
                assert!(j.client.color.starts_with('#'));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_insert_is_sequenced_and_acked() {
        let mut session = session_with("abc");
        let a = join(&mut session, "A");
        let b = join(&mut session, "B");

        let out = session.handle(a, op(Edit::insert(3, "X"), 0));
        assert_eq!(session.content(), "abcX");
        assert_eq!(session.revision(), 1);

        assert_eq!(out.len(), 2);
        assert!(out[0].to.includes(&b) && !out[0].to.includes(&a));
        match &out[0].message {
            ServerMessage::Operation(remote) => {
                assert_eq!(remote.revision, 1);
                assert_eq!(remote.client_id, a);
                assert_eq!(remote.operation.edit, Edit::insert(3, "X"));
            }
            other => panic!("expected operation, got {other:?}"),
        }
        assert_eq!(
            out[1],
            Outbound::to(a, ServerMessage::OperationAck(OperationAck { revision: 1 }))
        );
    }

    #[test]
    fn test_concurrent_ops_apply_positionally() {
        let mut session = session_with("hello");
        session.revision = 5;
        let a = join(&mut session, "A");
        let b = join(&mut session, "B");

        session.handle(a, op(Edit::insert(5, "!"), 5));
        assert_eq!(session.content(), "hello!");
        assert_eq!(session.revision(), 6);

        // B's delete still says base 5 but lands on current content.
        session.handle(b, op(Edit::delete(4, 1), 5));
        assert_eq!(session.content(), "hell!");
        assert_eq!(session.revision(), 7);
    }

    #[test]
    fn test_out_of_range_operation_is_clamped() {
        let mut session = session_with("abc");
        let a = join(&mut session, "A");
        let _b = join(&mut session, "B");

        let out = session.handle(a, op(Edit::delete(2, 40), 0));
        assert_eq!(session.content(), "ab");
        match &out[0].message {
            ServerMessage::Operation(remote) => {
                assert_eq!(remote.operation.edit, Edit::delete(2, 1));
            }
            other => panic!("expected operation, got {other:?}"),
        }
    }

    #[test]
    fn test_revision_is_monotonic() {
        let mut session = session_with("");
        let a = join(&mut session, "A");
        for i in 0..20u64 {
            session.handle(a, op(Edit::insert(0, "x"), i));
            assert_eq!(session.revision(), i + 1);
        }
        assert_eq!(session.content().len(), 20);
    }

    #[test]
    fn test_host_promotion_in_join_order() {
        let mut session = session_with("");
        let h = join(&mut session, "H");
        let b = join(&mut session, "B");
        let c = join(&mut session, "C");

        let out = session.leave(h);
        assert_eq!(session.host(), Some(b));
        assert_eq!(
            out,
            vec![Outbound::all_except(
                h,
                ServerMessage::ClientLeft(ClientLeft { client_id: h, new_host: Some(b) })
            )]
        );

        let clients = session.collaborators();
        assert_eq!(clients.iter().filter(|c| c.is_host).count(), 1);
        assert!(clients.iter().all(|c| c.id != h));
        assert!(session.state_for(b).is_host);
        assert!(!session.state_for(c).is_host);
    }

    #[test]
    fn test_non_host_leave_keeps_host() {
        let mut session = session_with("");
        let h = join(&mut session, "H");
        let b = join(&mut session, "B");
        let out = session.leave(b);
        assert_eq!(session.host(), Some(h));
        match &out[0].message {
            ServerMessage::ClientLeft(left) => assert!(left.new_host.is_none()),
            other => panic!("expected client-left, got {other:?}"),
        }
    }

    #[test]
    fn test_last_leave_empties_session() {
        let mut session = session_with("x");
        let a = join(&mut session, "A");
        assert!(session.leave(a).is_empty());
        assert!(session.is_empty());
        assert!(session.host().is_none());
        // leaving twice is a no-op
        assert!(session.leave(a).is_empty());
    }

    #[test]
    fn test_presence_never_touches_revision() {
        let mut session = session_with("abc");
        let a = join(&mut session, "A");
        let b = join(&mut session, "B");

        let out = session.handle(
            a,
            ClientMessage::CursorUpdate(CursorUpdate { cursor: Cursor::new(0, 2) }),
        );
        assert_eq!(session.revision(), 0);
        assert_eq!(session.content(), "abc");
        assert_eq!(out.len(), 1);
        assert!(out[0].to.includes(&b) && !out[0].to.includes(&a));

        let state = session.state_for(b);
        let ann = state.clients.iter().find(|c| c.id == a).unwrap();
        assert_eq!(ann.cursor, Some(Cursor::new(0, 2)));
    }

    #[test]
    fn test_request_state_is_idempotent() {
        let mut session = session_with("abc");
        let a = join(&mut session, "A");
        session.handle(a, op(Edit::insert(0, "z"), 0));

        let first = session.handle(a, ClientMessage::RequestState);
        let second = session.handle(a, ClientMessage::RequestState);
        match (&first[0].message, &second[0].message) {
            (ServerMessage::SessionState(x), ServerMessage::SessionState(y)) => {
                assert_eq!((&x.document, x.revision), (&y.document, y.revision));
                assert_eq!(x.document, "zabc");
                assert_eq!(x.revision, 1);
            }
            other => panic!("expected two session-states, got {other:?}"),
        }
    }

    #[test]
    fn test_comments_added_and_resolved() {
        let mut session = session_with("line one\nline two");
        let a = join(&mut session, "A");

        let out = session.handle(
            a,
            ClientMessage::AddComment(AddComment { content: "typo".into(), line: 1, column: 5 }),
        );
        let comment = match &out[0] {
            Outbound { to: Recipient::All, message: ServerMessage::CommentAdded(c) } => c.clone(),
            other => panic!("expected comment-added to all, got {other:?}"),
        };
        assert_eq!(comment.author_id, a);
        assert_eq!((comment.line, comment.column), (1, 5));

        // anchors are not moved by later edits
        session.handle(a, op(Edit::insert(0, "new first line\n"), 0));
        assert_eq!(session.comments().get(&comment.id).unwrap().line, 1);

        let out = session.handle(
            a,
            ClientMessage::ResolveComment(ResolveComment { comment_id: comment.id.clone() }),
        );
        assert!(matches!(out[0].message, ServerMessage::CommentResolved(_)));
        assert!(session.comments().get(&comment.id).unwrap().resolved);

        let out = session.handle(
            a,
            ClientMessage::ResolveComment(ResolveComment { comment_id: "nope".into() }),
        );
        assert_eq!(out[0].to, Recipient::Client(a));
        assert!(matches!(out[0].message, ServerMessage::Error(_)));
    }

    #[test]
    fn test_empty_comment_rejected() {
        let mut session = session_with("");
        let a = join(&mut session, "A");
        let out = session.handle(
            a,
            ClientMessage::AddComment(AddComment { content: "  ".into(), line: 0, column: 0 }),
        );
        assert_eq!(out[0].to, Recipient::Client(a));
        assert!(session.comments().is_empty());
    }

    #[test]
    fn test_chat_relayed_to_everyone() {
        let mut session = session_with("");
        let a = join(&mut session, "Ann");
        let out = session.handle(
            a,
            ClientMessage::ChatMessage(ChatMessage { content: "hi".into(), kind: "text".into() }),
        );
        match &out[0] {
            Outbound { to: Recipient::All, message: ServerMessage::ChatMessage(chat) } => {
                assert_eq!(chat.name, "Ann");
                assert_eq!(chat.content, "hi");
                assert_eq!(chat.client_id, a);
            }
            other => panic!("expected chat relay, got {other:?}"),
        }
    }

    #[test]
    fn test_full_session_rejects_join() {
        let mut session = Session::new(SessionId::new("S1"), "", 2);
        join(&mut session, "A");
        join(&mut session, "B");
        assert_eq!(
            session.join(ClientId::new(), &UserData::named("C")),
            Err(SessionError::Full)
        );
        assert_eq!(SessionError::Full.to_string(), "session is full");
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let mut session = session_with("");
        let a = join(&mut session, "A");
        assert_eq!(
            session.join(a, &UserData::named("A")),
            Err(SessionError::AlreadyJoined)
        );
        assert_eq!(session.member_count(), 1);
    }

    #[test]
    fn test_non_member_gets_error() {
        let mut session = session_with("abc");
        join(&mut session, "A");
        let stranger = ClientId::new();
        let out = session.handle(stranger, op(Edit::insert(0, "x"), 0));
        assert_eq!(
            out,
            vec![Outbound::to(stranger, ServerMessage::error(SessionError::NotJoined))]
        );
        assert_eq!(session.content(), "abc");
    }

    #[test]
    fn test_analysis_request_produces_nothing() {
        let mut session = session_with("abc");
        let a = join(&mut session, "A");
        let request = RunAnalysis { dry_run: true, layers: None, filename: None };
        assert!(session.handle(a, ClientMessage::RunNeurolint(request)).is_empty());
        assert_eq!(session.revision(), 0);
    }

    #[test]
    fn test_recipient_includes() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert!(Recipient::All.includes(&a));
        assert!(Recipient::Client(a).includes(&a));
        assert!(!Recipient::Client(a).includes(&b));
        assert!(!Recipient::AllExcept(a).includes(&a));
        assert!(Recipient::AllExcept(a).includes(&b));
    }
}
