//! JSON wire protocol shared by the sequencer and the client.
//!
//! Every frame is one envelope:
//! ```text
//! { "type": "<kebab-case kind>", "data": { ...payload } }
//! ```
//!
//! Messages are modelled as two tagged unions, [`ClientMessage`] and
//! [`ServerMessage`]. Decoding is total: anything that does not fit an
//! envelope becomes [`ProtocolError::Parse`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::comments::Comment;
use crate::operation::TextOperation;
use crate::presence::{Cursor, Selection};

/// Identity of one connected client. A fresh id is issued per join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session identifier. Generated ids are UUIDs, but any string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Profile a client announces when creating or joining.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserData {
    pub name: String,
    pub color: Option<String>,
}

impl UserData {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), color: None }
    }
}

/// A session member as seen by every participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: ClientId,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub selection: Option<Selection>,
    pub is_active: bool,
    pub is_host: bool,
}

// ─── Client → server payloads ─────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSession {
    pub user_data: UserData,
    pub document: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSession {
    pub session_id: SessionId,
    #[serde(default)]
    pub user_data: UserData,
    /// Ignored by the sequencer; a join never seeds content.
    #[serde(default)]
    pub document: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub cursor: Cursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionUpdate {
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddComment {
    pub content: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveComment {
    pub comment_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunAnalysis {
    pub dry_run: bool,
    pub layers: Option<Vec<u32>>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    #[serde(rename = "type", default = "default_chat_kind")]
    pub kind: String,
}

fn default_chat_kind() -> String {
    "text".to_string()
}

/// Everything a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    CreateSession(CreateSession),
    JoinSession(JoinSession),
    Operation(TextOperation),
    CursorUpdate(CursorUpdate),
    SelectionUpdate(SelectionUpdate),
    AddComment(AddComment),
    ResolveComment(ResolveComment),
    RunNeurolint(RunAnalysis),
    ChatMessage(ChatMessage),
    RequestState,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Parse(e.to_string()))
    }

    /// Wire name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateSession(_) => "create-session",
            ClientMessage::JoinSession(_) => "join-session",
            ClientMessage::Operation(_) => "operation",
            ClientMessage::CursorUpdate(_) => "cursor-update",
            ClientMessage::SelectionUpdate(_) => "selection-update",
            ClientMessage::AddComment(_) => "add-comment",
            ClientMessage::ResolveComment(_) => "resolve-comment",
            ClientMessage::RunNeurolint(_) => "run-neurolint",
            ClientMessage::ChatMessage(_) => "chat-message",
            ClientMessage::RequestState => "request-state",
        }
    }
}

// ─── Server → client payloads ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub document: String,
    pub revision: u64,
    pub clients: Vec<Collaborator>,
    pub is_host: bool,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOperation {
    pub operation: TextOperation,
    pub revision: u64,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAck {
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub client_id: ClientId,
    pub cursor: Cursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSelection {
    pub client_id: ClientId,
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientJoined {
    pub client: Collaborator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientLeft {
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_host: Option<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentResolved {
    pub comment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRelay {
    pub client_id: ClientId,
    pub name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

/// Everything the sequencer may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    SessionState(SessionState),
    Operation(RemoteOperation),
    OperationAck(OperationAck),
    CursorUpdate(RemoteCursor),
    SelectionUpdate(RemoteSelection),
    ClientJoined(ClientJoined),
    ClientLeft(ClientLeft),
    CommentAdded(Comment),
    CommentResolved(CommentResolved),
    ChatMessage(ChatRelay),
    NeurolintResult(AnalysisResult),
    Error(ErrorReply),
}

impl ServerMessage {
    pub fn error(message: impl fmt::Display) -> Self {
        ServerMessage::Error(ErrorReply { error: message.to_string() })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Parse(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionState(_) => "session-state",
            ServerMessage::Operation(_) => "operation",
            ServerMessage::OperationAck(_) => "operation-ack",
            ServerMessage::CursorUpdate(_) => "cursor-update",
            ServerMessage::SelectionUpdate(_) => "selection-update",
            ServerMessage::ClientJoined(_) => "client-joined",
            ServerMessage::ClientLeft(_) => "client-left",
            ServerMessage::CommentAdded(_) => "comment-added",
            ServerMessage::CommentResolved(_) => "comment-resolved",
            ServerMessage::ChatMessage(_) => "chat-message",
            ServerMessage::NeurolintResult(_) => "neurolint-result",
            ServerMessage::Error(_) => "error",
        }
    }
}

/// Wire-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Parse(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
